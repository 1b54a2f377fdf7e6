#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use beacon_domain::{AuthError, SecretString, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

/// Identity claims embedded in a `v1` bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: UserId,
	pub username: String,
	pub iat: u64,
	pub exp: u64,
}

/// Stateless issuer/verifier for `v1.<payload>.<sig>` HMAC-SHA256 tokens.
///
/// The signing secret is process-wide configuration loaded once at startup;
/// rotating it invalidates every outstanding token. There is no revocation
/// list: a token is valid until `exp`.
#[derive(Clone)]
pub struct TokenService {
	secret: SecretString,
	ttl: Duration,
}

impl TokenService {
	pub fn new(secret: SecretString, ttl: Duration) -> Self {
		Self { secret, ttl }
	}

	/// Issue a signed token for an authenticated user.
	pub fn issue(&self, user_id: UserId, username: &str) -> Result<String, AuthError> {
		let now = unix_secs_now();
		let claims = AuthClaims {
			sub: user_id,
			username: username.to_string(),
			iat: now,
			exp: now.saturating_add(self.ttl.as_secs()),
		};

		let payload = serde_json::to_vec(&claims)
			.map_err(|e| AuthError::InvalidInput(format!("encode token claims: {e}")))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), self.secret.expose().as_bytes()));

		Ok(format!("v1.{payload_b64}.{sig_b64}"))
	}

	/// Verify a presented token and return its claims.
	///
	/// Rejects bad format, bad signature, malformed claims, and anything at
	/// or past `exp`. No grace period.
	pub fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(AuthError::InvalidToken("invalid token format".to_string()));
		}

		let payload_b64 = parts[1];
		let sig_b64 = parts[2];

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|e| AuthError::InvalidToken(format!("decode token payload: {e}")))?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		let provided_sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|e| AuthError::InvalidToken(format!("decode token signature: {e}")))?;

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(AuthError::InvalidToken("invalid token signature".to_string()));
		}

		let claims: AuthClaims = serde_json::from_slice(&payload)
			.map_err(|e| AuthError::InvalidToken(format!("parse token claims: {e}")))?;
		if claims.exp <= unix_secs_now() {
			return Err(AuthError::InvalidToken("token expired".to_string()));
		}

		Ok(claims)
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
