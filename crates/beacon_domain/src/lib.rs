#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable user identifier assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected UUID, got: {s}")))
	}
}

/// Unique, case-sensitive account name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username`. Case is preserved; matching is exact.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authentication and credential errors.
///
/// `UserNotFound` and `WrongPassword` are internal distinctions kept for
/// logging; callers outside the core see them collapsed via [`AuthError::into_public`].
#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("username already taken")]
	DuplicateUsername,

	#[error("no such user")]
	UserNotFound,

	#[error("wrong password")]
	WrongPassword,

	#[error("invalid credentials")]
	InvalidCredentials,

	#[error("invalid token: {0}")]
	InvalidToken(String),

	#[error("credential store unavailable: {0}")]
	StoreUnavailable(String),
}

impl AuthError {
	/// Collapse login-internal failures so the wire never reveals whether the
	/// username or the password was wrong.
	pub fn into_public(self) -> Self {
		match self {
			AuthError::UserNotFound | AuthError::WrongPassword => AuthError::InvalidCredentials,
			other => other,
		}
	}

	/// Stable machine-readable code for the wire.
	pub const fn code(&self) -> &'static str {
		match self {
			AuthError::InvalidInput(_) => "INVALID_INPUT",
			AuthError::DuplicateUsername => "DUPLICATE_USERNAME",
			AuthError::UserNotFound | AuthError::WrongPassword | AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
			AuthError::InvalidToken(_) => "INVALID_TOKEN",
			AuthError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_rejects_empty_and_whitespace() {
		assert_eq!(Username::new("").unwrap_err(), ParseIdError::Empty);
		assert_eq!(Username::new("   ").unwrap_err(), ParseIdError::Empty);
	}

	#[test]
	fn username_is_case_sensitive() {
		let a = Username::new("Alice").unwrap();
		let b = Username::new("alice").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn user_id_parse_roundtrip() {
		let id = UserId::new_v4();
		let parsed: UserId = id.to_string().parse().unwrap();
		assert_eq!(parsed, id);
	}

	#[test]
	fn user_id_rejects_garbage() {
		assert!("not-a-uuid".parse::<UserId>().is_err());
		assert_eq!("".parse::<UserId>().unwrap_err(), ParseIdError::Empty);
	}

	#[test]
	fn login_failures_collapse_at_public_boundary() {
		assert!(matches!(AuthError::UserNotFound.into_public(), AuthError::InvalidCredentials));
		assert!(matches!(AuthError::WrongPassword.into_public(), AuthError::InvalidCredentials));
		assert!(matches!(
			AuthError::DuplicateUsername.into_public(),
			AuthError::DuplicateUsername
		));
	}

	#[test]
	fn secret_string_redacts_debug_and_display() {
		let s = SecretString::new("hunter2");
		assert!(!format!("{s:?}").contains("hunter2"));
		assert!(!format!("{s}").contains("hunter2"));
		assert_eq!(s.expose(), "hunter2");
	}
}
