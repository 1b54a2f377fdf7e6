#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use beacon_domain::{AuthError, UserId, Username};
use sqlx::Row as _;

/// One row of the credential table.
#[derive(Debug, Clone)]
pub struct UserRecord {
	pub id: UserId,
	pub username: String,
	pub password_hash: String,
}

/// Durable username -> password-hash mapping.
///
/// Username uniqueness is enforced by the store's UNIQUE constraint, which is
/// the source of truth under concurrent registration: of two racing inserts
/// for the same username exactly one succeeds.
#[derive(Clone)]
pub struct CredentialStore {
	backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl CredentialStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let store = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self {
				backend: StoreBackend::Sqlite(pool),
			}
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Self {
				backend: StoreBackend::Postgres(pool),
			}
		} else {
			return Err(anyhow!("unsupported database_url for credential store"));
		};

		store.ensure_schema().await?;
		Ok(store)
	}

	/// Wrap an already-connected sqlite pool (test seam).
	#[cfg(test)]
	pub async fn from_sqlite_pool(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		let store = Self {
			backend: StoreBackend::Sqlite(pool),
		};
		store.ensure_schema().await?;
		Ok(store)
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		let ddl = "CREATE TABLE IF NOT EXISTS users (\
			id TEXT PRIMARY KEY, \
			username TEXT UNIQUE NOT NULL, \
			password_hash TEXT NOT NULL\
		)";

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(ddl).execute(pool).await.context("create users table (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(ddl).execute(pool).await.context("create users table (postgres)")?;
			}
		}

		Ok(())
	}

	/// Insert a new credential row. `DuplicateUsername` on unique violation.
	pub async fn insert_user(&self, id: UserId, username: &Username, password_hash: &str) -> Result<(), AuthError> {
		let result = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO users (id, username, password_hash) VALUES (?, ?, ?)")
					.bind(id.to_string())
					.bind(username.as_str())
					.bind(password_hash)
					.execute(pool)
					.await
					.map(|_| ())
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (id, username, password_hash) VALUES ($1, $2, $3)")
					.bind(id.to_string())
					.bind(username.as_str())
					.bind(password_hash)
					.execute(pool)
					.await
					.map(|_| ())
			}
		};

		result.map_err(map_insert_error)
	}

	/// Look up a credential row by exact username.
	pub async fn find_by_username(&self, username: &Username) -> Result<Option<UserRecord>, AuthError> {
		let row = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("SELECT id, username, password_hash FROM users WHERE username = ?")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await
					.map_err(map_store_error)?
					.map(|row| {
						(
							row.get::<String, _>("id"),
							row.get::<String, _>("username"),
							row.get::<String, _>("password_hash"),
						)
					})
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("SELECT id, username, password_hash FROM users WHERE username = $1")
					.bind(username.as_str())
					.fetch_optional(pool)
					.await
					.map_err(map_store_error)?
					.map(|row| {
						(
							row.get::<String, _>("id"),
							row.get::<String, _>("username"),
							row.get::<String, _>("password_hash"),
						)
					})
			}
		};

		let Some((id, username, password_hash)) = row else {
			return Ok(None);
		};

		let id = id
			.parse::<UserId>()
			.map_err(|e| AuthError::StoreUnavailable(format!("corrupt user id in store: {e}")))?;

		Ok(Some(UserRecord {
			id,
			username,
			password_hash,
		}))
	}

	/// Number of rows for a username (test/diagnostic helper; 0 or 1 by the unique constraint).
	pub async fn count_username(&self, username: &Username) -> Result<i64, AuthError> {
		let n = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query("SELECT COUNT(*) AS n FROM users WHERE username = ?")
				.bind(username.as_str())
				.fetch_one(pool)
				.await
				.map_err(map_store_error)?
				.get::<i64, _>("n"),
			StoreBackend::Postgres(pool) => sqlx::query("SELECT COUNT(*) AS n FROM users WHERE username = $1")
				.bind(username.as_str())
				.fetch_one(pool)
				.await
				.map_err(map_store_error)?
				.get::<i64, _>("n"),
		};

		Ok(n)
	}
}

fn map_insert_error(e: sqlx::Error) -> AuthError {
	if let Some(db) = e.as_database_error()
		&& db.is_unique_violation()
	{
		return AuthError::DuplicateUsername;
	}

	map_store_error(e)
}

fn map_store_error(e: sqlx::Error) -> AuthError {
	AuthError::StoreUnavailable(e.to_string())
}
