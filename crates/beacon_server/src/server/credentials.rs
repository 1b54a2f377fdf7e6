#![forbid(unsafe_code)]

use beacon_domain::{AuthError, UserId, Username};
use tracing::{debug, info};

use crate::server::store::CredentialStore;

/// Policy knobs for the credential service.
#[derive(Debug, Clone)]
pub struct CredentialSettings {
	/// Minimum accepted password length.
	pub min_password_len: usize,

	/// bcrypt work factor (4..=31).
	pub bcrypt_cost: u32,
}

impl Default for CredentialSettings {
	fn default() -> Self {
		Self {
			min_password_len: 4,
			bcrypt_cost: 10,
		}
	}
}

/// Registers and authenticates users against the credential store.
#[derive(Clone)]
pub struct CredentialService {
	store: CredentialStore,
	settings: CredentialSettings,

	/// Hash verified when the username does not exist, so a login attempt for
	/// a missing user costs the same as one with a wrong password.
	dummy_hash: String,
}

impl CredentialService {
	pub fn new(store: CredentialStore, settings: CredentialSettings) -> Result<Self, AuthError> {
		let dummy_hash = bcrypt::hash("beacon.dummy.credential", settings.bcrypt_cost)
			.map_err(|e| AuthError::StoreUnavailable(format!("bcrypt init: {e}")))?;

		Ok(Self {
			store,
			settings,
			dummy_hash,
		})
	}

	/// Register a new user and return its id.
	///
	/// The store's uniqueness constraint decides duplicate races: exactly one
	/// of any set of concurrent registrations for a username succeeds.
	pub async fn register(&self, username: &str, password: &str) -> Result<UserId, AuthError> {
		let username = Username::new(username).map_err(|_| AuthError::InvalidInput("username must be non-empty".to_string()))?;

		if password.is_empty() {
			return Err(AuthError::InvalidInput("password must be non-empty".to_string()));
		}
		if password.chars().count() < self.settings.min_password_len {
			return Err(AuthError::InvalidInput(format!(
				"password must be at least {} characters",
				self.settings.min_password_len
			)));
		}

		let hash = self.hash_password(password.to_string()).await?;

		let id = UserId::new_v4();
		self.store.insert_user(id, &username, &hash).await?;

		info!(user_id = %id, username = %username, "registered user");
		Ok(id)
	}

	/// Authenticate an existing user and return its id.
	///
	/// Returns the internal `UserNotFound` / `WrongPassword` distinction;
	/// callers at the wire boundary collapse both via [`AuthError::into_public`].
	pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserId, AuthError> {
		let username = Username::new(username).map_err(|_| AuthError::InvalidInput("username must be non-empty".to_string()))?;

		match self.store.find_by_username(&username).await? {
			Some(rec) => {
				let ok = self.verify_password(password.to_string(), rec.password_hash).await?;
				if ok {
					debug!(user_id = %rec.id, "authenticated user");
					Ok(rec.id)
				} else {
					debug!(username = %username, "wrong password");
					Err(AuthError::WrongPassword)
				}
			}
			None => {
				// Burn a verification anyway; timing must not reveal existence.
				let _ = self.verify_password(password.to_string(), self.dummy_hash.clone()).await?;
				debug!(username = %username, "unknown username");
				Err(AuthError::UserNotFound)
			}
		}
	}

	/// bcrypt hashing is CPU-bound; run it off the async workers.
	async fn hash_password(&self, password: String) -> Result<String, AuthError> {
		let cost = self.settings.bcrypt_cost;
		tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
			.await
			.map_err(|e| AuthError::StoreUnavailable(format!("hash worker: {e}")))?
			.map_err(|e| AuthError::StoreUnavailable(format!("bcrypt hash: {e}")))
	}

	async fn verify_password(&self, password: String, hash: String) -> Result<bool, AuthError> {
		tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
			.await
			.map_err(|e| AuthError::StoreUnavailable(format!("hash worker: {e}")))?
			.map_err(|e| AuthError::StoreUnavailable(format!("bcrypt verify: {e}")))
	}
}
