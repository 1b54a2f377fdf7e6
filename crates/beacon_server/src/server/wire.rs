#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted frame (one JSON line) in bytes, newline included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
	#[error("frame exceeds maximum size: max={max}")]
	FrameTooLarge { max: usize },

	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Present a bearer token to join the broadcast channel.
	Hello { token: String },

	/// Create an account. Allowed before authentication; never admits.
	Register { username: String, password: String },

	/// Exchange credentials for a bearer token. Never admits by itself.
	Login { username: String, password: String },

	/// Broadcast a message. Only valid once admitted.
	Chat { text: String },
}

/// Frames the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Welcome { user_id: String, username: String },
	Registered { user_id: String },
	LoggedIn { token: String },
	Broadcast { from: u64, text: String },
	Error { code: String, message: String },
}

/// Encode a frame as one newline-terminated JSON line.
pub fn encode_line<F: Serialize>(frame: &F) -> Result<String, WireError> {
	let mut line = serde_json::to_string(frame)?;
	line.push('\n');
	if line.len() > MAX_LINE_LEN {
		return Err(WireError::FrameTooLarge { max: MAX_LINE_LEN });
	}
	Ok(line)
}

/// Decode one line (trailing newline optional) into a frame.
pub fn decode_line<'a, F: Deserialize<'a>>(line: &'a str) -> Result<F, WireError> {
	if line.len() > MAX_LINE_LEN {
		return Err(WireError::FrameTooLarge { max: MAX_LINE_LEN });
	}
	Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}
