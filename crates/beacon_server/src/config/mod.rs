#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use beacon_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.beacon/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".beacon").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

/// Listener-side settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Upper bound on one broadcast delivery attempt.
	pub delivery_timeout: Duration,
	/// Capacity of each connection's outbound broadcast queue.
	pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			delivery_timeout: Duration::from_millis(2000),
			outbound_queue_capacity: 1024,
		}
	}
}

/// Credential and token settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for stateless bearer tokens. Required; there is no
	/// built-in default, rotating it invalidates all outstanding tokens.
	pub token_hmac_secret: Option<SecretString>,
	/// Token lifetime.
	pub token_ttl: Duration,
	/// Minimum accepted password length.
	pub min_password_len: usize,
	/// bcrypt work factor.
	pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			token_hmac_secret: None,
			token_ttl: Duration::from_secs(7 * 24 * 3600),
			min_password_len: 4,
			bcrypt_cost: 10,
		}
	}
}

impl AuthSettings {
	/// The signing secret is mandatory, process-wide configuration; refuse to
	/// start without one rather than fall back to a literal.
	pub fn require_signing_secret(&self) -> anyhow::Result<SecretString> {
		self.token_hmac_secret
			.clone()
			.ok_or_else(|| anyhow!("auth.token_hmac_secret is required (set it in config.toml or BEACON_AUTH_HMAC_SECRET)"))
	}
}

/// Credential store settings.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (`sqlite:` or `postgres:`).
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite::memory:".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	delivery_timeout_ms: Option<u64>,
	outbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	token_hmac_secret: Option<String>,
	token_ttl_days: Option<u64>,
	min_password_len: Option<usize>,
	bcrypt_cost: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults_auth = AuthSettings::default();
		let defaults_server = ServerSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				delivery_timeout: file
					.server
					.delivery_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults_server.delivery_timeout),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults_server.outbound_queue_capacity),
			},
			auth: AuthSettings {
				token_hmac_secret: file
					.auth
					.token_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				token_ttl: file
					.auth
					.token_ttl_days
					.filter(|v| *v > 0)
					.map(ttl_from_days)
					.unwrap_or(defaults_auth.token_ttl),
				min_password_len: file.auth.min_password_len.unwrap_or(defaults_auth.min_password_len),
				bcrypt_cost: file.auth.bcrypt_cost.unwrap_or(defaults_auth.bcrypt_cost),
			},
			persistence: PersistenceSettings {
				database_url: file
					.persistence
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| PersistenceSettings::default().database_url),
			},
		}
	}
}

/// Saturates instead of overflowing on absurd day counts.
fn ttl_from_days(days: u64) -> Duration {
	Duration::from_secs(days.saturating_mul(86_400))
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("BEACON_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.token_hmac_secret = Some(SecretString::new(v));
			info!("auth config: token_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BEACON_TOKEN_TTL_DAYS")
		&& let Ok(days) = v.trim().parse::<u64>()
		&& days > 0
	{
		cfg.auth.token_ttl = ttl_from_days(days);
		info!(days, "auth config: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("BEACON_MIN_PASSWORD_LEN")
		&& let Ok(len) = v.trim().parse::<usize>()
	{
		cfg.auth.min_password_len = len;
		info!(len, "auth config: min_password_len overridden by env");
	}

	if let Ok(v) = std::env::var("BEACON_BCRYPT_COST")
		&& let Ok(cost) = v.trim().parse::<u32>()
	{
		cfg.auth.bcrypt_cost = cost;
		info!(cost, "auth config: bcrypt_cost overridden by env");
	}

	if let Ok(v) = std::env::var("BEACON_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BEACON_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BEACON_DELIVERY_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.server.delivery_timeout = Duration::from_millis(ms);
		info!(ms, "server config: delivery_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("BEACON_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BEACON_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}
}
