#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;

use beacon_util::endpoint::TcpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::TokenService;
use crate::server::broadcast::{BroadcastConfig, BroadcastHub};
use crate::server::credentials::{CredentialService, CredentialSettings};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{SessionServices, SessionSettings, handle_session};
use crate::server::store::CredentialStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: beacon_server [--bind tcp://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:18210)\n\
\t         Format: tcp://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "tcp://127.0.0.1:18210".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = TcpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,beacon_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("beacon_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	// Refuse to run with the signing secret absent; a hardcoded fallback
	// would silently accept forged tokens across deployments.
	let signing_secret = server_cfg.auth.require_signing_secret()?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = CredentialStore::connect(&server_cfg.persistence.database_url).await?;
	info!("credential store ready");

	let credentials = CredentialService::new(
		store,
		CredentialSettings {
			min_password_len: server_cfg.auth.min_password_len,
			bcrypt_cost: server_cfg.auth.bcrypt_cost,
		},
	)?;
	let tokens = TokenService::new(signing_secret, server_cfg.auth.token_ttl);

	let registry = ConnectionRegistry::new();
	let hub = BroadcastHub::new(
		registry.clone(),
		BroadcastConfig {
			delivery_timeout: server_cfg.server.delivery_timeout,
			..BroadcastConfig::default()
		},
	);

	let services = SessionServices {
		credentials,
		tokens,
		registry: registry.clone(),
		hub,
	};
	let session_settings = SessionSettings {
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
	};

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "beacon_server: listening");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("beacon_server_connections_total").increment(1);
		info!(conn_id, remote = %remote, "accepted connection");

		let services = services.clone();
		let session_settings = session_settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_session(conn_id, stream, services, session_settings).await {
				warn!(conn_id, error = %e, "session handler exited with error");
			}
		});
	}
}
