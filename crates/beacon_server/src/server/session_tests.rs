#![forbid(unsafe_code)]

use std::time::Duration;

use beacon_domain::SecretString;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::{sleep, timeout};

use crate::server::auth::TokenService;
use crate::server::broadcast::{BroadcastConfig, BroadcastHub};
use crate::server::credentials::{CredentialService, CredentialSettings};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{SessionServices, SessionSettings, handle_session};
use crate::server::store::CredentialStore;
use crate::server::wire::{self, ClientFrame, ServerFrame};

struct Harness {
	services: SessionServices,
	next_conn_id: u64,
}

async fn harness() -> Harness {
	let pool = sqlx::sqlite::SqlitePoolOptions::new()
		.max_connections(1)
		.connect("sqlite::memory:")
		.await
		.expect("sqlite memory");
	let store = CredentialStore::from_sqlite_pool(pool).await.expect("schema");

	let credentials = CredentialService::new(
		store,
		CredentialSettings {
			min_password_len: 4,
			bcrypt_cost: 4,
		},
	)
	.expect("credential service");
	let tokens = TokenService::new(SecretString::new("test-secret"), Duration::from_secs(3600));

	let registry = ConnectionRegistry::new();
	let hub = BroadcastHub::new(
		registry.clone(),
		BroadcastConfig {
			delivery_timeout: Duration::from_millis(500),
			debug_logs: false,
		},
	);

	Harness {
		services: SessionServices {
			credentials,
			tokens,
			registry,
			hub,
		},
		next_conn_id: 1,
	}
}

impl Harness {
	/// Open a client connected to a freshly spawned gateway session.
	fn connect(&mut self) -> TestClient {
		let (client, server) = tokio::io::duplex(64 * 1024);
		let conn_id = self.next_conn_id;
		self.next_conn_id += 1;

		let services = self.services.clone();
		tokio::spawn(async move {
			let _ = handle_session(
				conn_id,
				server,
				services,
				SessionSettings {
					outbound_queue_capacity: 64,
				},
			)
			.await;
		});

		TestClient::new(conn_id, client)
	}

	async fn wait_for_registry_len(&self, expected: usize) {
		for _ in 0..40 {
			if self.services.registry.len().await == expected {
				return;
			}
			sleep(Duration::from_millis(25)).await;
		}
		panic!("registry never reached {expected} entries");
	}
}

struct TestClient {
	conn_id: u64,
	reader: BufReader<ReadHalf<DuplexStream>>,
	writer: WriteHalf<DuplexStream>,
}

impl TestClient {
	fn new(conn_id: u64, stream: DuplexStream) -> Self {
		let (read_half, write_half) = tokio::io::split(stream);
		Self {
			conn_id,
			reader: BufReader::new(read_half),
			writer: write_half,
		}
	}

	async fn send(&mut self, frame: &ClientFrame) {
		let line = wire::encode_line(frame).expect("encode frame");
		self.writer.write_all(line.as_bytes()).await.expect("write frame");
	}

	async fn send_raw(&mut self, raw: &str) {
		self.writer.write_all(raw.as_bytes()).await.expect("write raw");
	}

	/// Next frame, or `None` on clean close.
	async fn recv(&mut self) -> Option<ServerFrame> {
		let mut line = String::new();
		let n = timeout(Duration::from_millis(1000), self.reader.read_line(&mut line))
			.await
			.expect("expected a frame within timeout")
			.expect("read frame");
		if n == 0 {
			return None;
		}
		Some(wire::decode_line(&line).expect("decode frame"))
	}

	async fn expect_error(&mut self, expected_code: &str) {
		match self.recv().await {
			Some(ServerFrame::Error { code, .. }) => assert_eq!(code, expected_code),
			other => panic!("expected error {expected_code}, got: {other:?}"),
		}
	}

	async fn assert_silent(&mut self) {
		let mut line = String::new();
		let got = timeout(Duration::from_millis(75), self.reader.read_line(&mut line)).await;
		assert!(got.is_err(), "expected no frame, got: {line:?}");
	}
}

async fn register_and_login(client: &mut TestClient, username: &str, password: &str) -> String {
	client
		.send(&ClientFrame::Register {
			username: username.to_string(),
			password: password.to_string(),
		})
		.await;
	match client.recv().await {
		Some(ServerFrame::Registered { .. }) => {}
		other => panic!("expected registered, got: {other:?}"),
	}

	login(client, username, password).await
}

async fn login(client: &mut TestClient, username: &str, password: &str) -> String {
	client
		.send(&ClientFrame::Login {
			username: username.to_string(),
			password: password.to_string(),
		})
		.await;
	match client.recv().await {
		Some(ServerFrame::LoggedIn { token }) => token,
		other => panic!("expected logged_in, got: {other:?}"),
	}
}

async fn admit(client: &mut TestClient, token: &str) {
	client
		.send(&ClientFrame::Hello {
			token: token.to_string(),
		})
		.await;
	match client.recv().await {
		Some(ServerFrame::Welcome { .. }) => {}
		other => panic!("expected welcome, got: {other:?}"),
	}
}

#[tokio::test]
async fn full_scenario_register_login_chat_echo_disconnect() {
	let mut h = harness().await;

	let mut a = h.connect();
	let token = register_and_login(&mut a, "alice", "wonder1").await;
	admit(&mut a, &token).await;
	h.wait_for_registry_len(1).await;

	// A bad token never reaches the registry; the connection is torn down.
	let mut b = h.connect();
	b.send(&ClientFrame::Hello {
		token: "v1.bogus.bogus".to_string(),
	})
	.await;
	b.expect_error("INVALID_TOKEN").await;
	assert!(b.recv().await.is_none(), "rejected connection should be closed");
	assert_eq!(h.services.registry.len().await, 1);

	// Echo-back: the sender sees its own message exactly once.
	a.send(&ClientFrame::Chat { text: "hi".to_string() }).await;
	match a.recv().await {
		Some(ServerFrame::Broadcast { from, text }) => {
			assert_eq!(text, "hi");
			assert_eq!(from, a.conn_id);
		}
		other => panic!("expected broadcast, got: {other:?}"),
	}
	a.assert_silent().await;

	// Disconnect deregisters; later fanouts no longer attempt delivery to A.
	drop(a);
	h.wait_for_registry_len(0).await;

	let mut c = h.connect();
	admit(&mut c, &token).await;
	c.send(&ClientFrame::Chat { text: "anyone?".to_string() }).await;
	match c.recv().await {
		Some(ServerFrame::Broadcast { text, .. }) => assert_eq!(text, "anyone?"),
		other => panic!("expected broadcast, got: {other:?}"),
	}
	c.assert_silent().await;
}

#[tokio::test]
async fn chat_before_authentication_never_broadcasts() {
	let mut h = harness().await;

	let mut client = h.connect();
	client.send(&ClientFrame::Chat { text: "sneaky".to_string() }).await;
	client.expect_error("NOT_AUTHENTICATED").await;
	assert_eq!(h.services.registry.len().await, 0);

	// The connection stays usable; the normal path still works afterwards.
	let token = register_and_login(&mut client, "alice", "wonder1").await;
	admit(&mut client, &token).await;
	assert_eq!(h.services.registry.len().await, 1);
}

#[tokio::test]
async fn login_failures_share_one_public_error_code() {
	let mut h = harness().await;

	let mut client = h.connect();
	let _ = register_and_login(&mut client, "alice", "wonder1").await;

	client
		.send(&ClientFrame::Login {
			username: "alice".to_string(),
			password: "wrong".to_string(),
		})
		.await;
	client.expect_error("INVALID_CREDENTIALS").await;

	client
		.send(&ClientFrame::Login {
			username: "nobody".to_string(),
			password: "wrong".to_string(),
		})
		.await;
	client.expect_error("INVALID_CREDENTIALS").await;
}

#[tokio::test]
async fn duplicate_registration_over_the_wire() {
	let mut h = harness().await;

	let mut client = h.connect();
	let _ = register_and_login(&mut client, "alice", "wonder1").await;

	client
		.send(&ClientFrame::Register {
			username: "alice".to_string(),
			password: "other-pw".to_string(),
		})
		.await;
	client.expect_error("DUPLICATE_USERNAME").await;
}

#[tokio::test]
async fn short_password_is_rejected_over_the_wire() {
	let mut h = harness().await;

	let mut client = h.connect();
	client
		.send(&ClientFrame::Register {
			username: "alice".to_string(),
			password: "abc".to_string(),
		})
		.await;
	client.expect_error("INVALID_INPUT").await;
}

#[tokio::test]
async fn every_active_connection_receives_each_broadcast_once() {
	let mut h = harness().await;

	let mut a = h.connect();
	let token = register_and_login(&mut a, "alice", "wonder1").await;
	admit(&mut a, &token).await;

	let mut b = h.connect();
	admit(&mut b, &token).await;
	h.wait_for_registry_len(2).await;

	a.send(&ClientFrame::Chat { text: "ping".to_string() }).await;

	let origin = a.conn_id;
	for client in [&mut a, &mut b] {
		match client.recv().await {
			Some(ServerFrame::Broadcast { from, text }) => {
				assert_eq!(text, "ping");
				assert_eq!(from, origin);
			}
			other => panic!("expected broadcast, got: {other:?}"),
		}
		client.assert_silent().await;
	}
}

#[tokio::test]
async fn hello_twice_is_an_error_but_session_survives() {
	let mut h = harness().await;

	let mut client = h.connect();
	let token = register_and_login(&mut client, "alice", "wonder1").await;
	admit(&mut client, &token).await;

	client
		.send(&ClientFrame::Hello {
			token: token.clone(),
		})
		.await;
	client.expect_error("ALREADY_AUTHENTICATED").await;

	client.send(&ClientFrame::Chat { text: "still here".to_string() }).await;
	match client.recv().await {
		Some(ServerFrame::Broadcast { text, .. }) => assert_eq!(text, "still here"),
		other => panic!("expected broadcast, got: {other:?}"),
	}
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
	let mut h = harness().await;

	let mut client = h.connect();
	client.send_raw("this is not json\n").await;
	client.expect_error("MALFORMED_FRAME").await;
	assert!(client.recv().await.is_none());
	assert_eq!(h.services.registry.len().await, 0);
}
