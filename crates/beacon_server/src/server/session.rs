#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use beacon_domain::AuthError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::TokenService;
use crate::server::broadcast::BroadcastHub;
use crate::server::credentials::CredentialService;
use crate::server::registry::{ConnectionRegistry, OutboundMessage};
use crate::server::wire::{self, ClientFrame, MAX_LINE_LEN, ServerFrame};

/// Per-connection gateway settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Capacity of the bounded outbound broadcast queue.
	pub outbound_queue_capacity: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 1024,
		}
	}
}

/// Everything a session needs behind the transport boundary.
#[derive(Clone)]
pub struct SessionServices {
	pub credentials: CredentialService,
	pub tokens: TokenService,
	pub registry: ConnectionRegistry,
	pub hub: BroadcastHub,
}

/// Gateway state machine per connection. `Closed` is terminal; `Active` is
/// unreachable without a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Authenticating,
	Active,
	Closed,
}

/// Drive one transport connection through the gateway until it closes.
///
/// The stream is any `AsyncRead + AsyncWrite` transport; the accept loop
/// hands in TCP sockets, tests hand in in-memory duplex pipes.
pub async fn handle_session<S>(
	conn_id: u64,
	stream: S,
	services: SessionServices,
	settings: SessionSettings,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("beacon_server_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("beacon_server_active_sessions").increment(1.0);
	let _session_guard = SessionGaugeGuard;

	let (read_half, write_half) = tokio::io::split(stream);
	let mut reader = BufReader::new(read_half);

	let (resp_tx, resp_rx) = mpsc::unbounded_channel::<ServerFrame>();
	let (push_tx, push_rx) = mpsc::channel::<OutboundMessage>(settings.outbound_queue_capacity);

	let writer_task = tokio::spawn(write_loop(write_half, resp_rx, push_rx));

	let mut state = SessionState::Connecting;
	let result = session_loop(conn_id, &mut reader, &resp_tx, &push_tx, &services, &mut state).await;

	// Redundant with the hub's failed-delivery removal; both are safe.
	services.registry.remove(conn_id).await;

	drop(push_tx);
	drop(resp_tx);
	match writer_task.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(conn_id, error = %e, "session writer exited with error"),
		Err(e) => warn!(conn_id, error = %e, "session writer panicked"),
	}

	info!(conn_id, "session closed");
	result
}

async fn session_loop<R>(
	conn_id: u64,
	reader: &mut R,
	resp_tx: &mpsc::UnboundedSender<ServerFrame>,
	push_tx: &mpsc::Sender<OutboundMessage>,
	services: &SessionServices,
	state: &mut SessionState,
) -> anyhow::Result<()>
where
	R: AsyncBufRead + Unpin,
{
	loop {
		let Some(line) = read_frame(reader).await? else {
			return Ok(());
		};

		let frame = match wire::decode_line::<ClientFrame>(&line) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(conn_id, error = %e, "malformed frame; closing");
				let _ = resp_tx.send(ServerFrame::Error {
					code: "MALFORMED_FRAME".to_string(),
					message: e.to_string(),
				});
				return Ok(());
			}
		};

		match (*state, frame) {
			(SessionState::Connecting, ClientFrame::Register { username, password }) => {
				match services.credentials.register(&username, &password).await {
					Ok(user_id) => {
						let _ = resp_tx.send(ServerFrame::Registered {
							user_id: user_id.to_string(),
						});
					}
					Err(e) => {
						debug!(conn_id, error = %e, "register rejected");
						let _ = resp_tx.send(error_frame(&e));
					}
				}
			}

			(SessionState::Connecting, ClientFrame::Login { username, password }) => {
				let outcome = match services.credentials.authenticate(&username, &password).await {
					Ok(user_id) => services.tokens.issue(user_id, &username),
					Err(e) => Err(e),
				};

				match outcome {
					Ok(token) => {
						let _ = resp_tx.send(ServerFrame::LoggedIn { token });
					}
					Err(e) => {
						let e = e.into_public();
						metrics::counter!("beacon_server_auth_failures_total").increment(1);
						warn!(conn_id, error = %e, "login failed");
						let _ = resp_tx.send(error_frame(&e));
					}
				}
			}

			(SessionState::Connecting, ClientFrame::Hello { token }) => {
				*state = SessionState::Authenticating;
				match services.tokens.verify(&token) {
					Ok(claims) => {
						if let Err(e) = services.registry.add(conn_id, claims.sub, push_tx.clone()).await {
							// Should not occur; the accept loop allocates unique ids.
							warn!(conn_id, error = %e, "registry rejected connection");
							let _ = resp_tx.send(ServerFrame::Error {
								code: "ALREADY_REGISTERED".to_string(),
								message: e.to_string(),
							});
							*state = SessionState::Closed;
							return Ok(());
						}

						*state = SessionState::Active;
						info!(conn_id, user_id = %claims.sub, username = %claims.username, "session active");
						let _ = resp_tx.send(ServerFrame::Welcome {
							user_id: claims.sub.to_string(),
							username: claims.username,
						});
					}
					Err(e) => {
						metrics::counter!("beacon_server_auth_failures_total").increment(1);
						warn!(conn_id, error = %e, "token rejected; closing");
						let _ = resp_tx.send(error_frame(&e));
						*state = SessionState::Closed;
						return Ok(());
					}
				}
			}

			(SessionState::Connecting, ClientFrame::Chat { .. }) => {
				let _ = resp_tx.send(ServerFrame::Error {
					code: "NOT_AUTHENTICATED".to_string(),
					message: "present a token with hello before chatting".to_string(),
				});
			}

			(SessionState::Active, ClientFrame::Chat { text }) => {
				let delivered = services.hub.publish(&text, conn_id).await;
				debug!(conn_id, delivered, "chat fanned out");
			}

			(SessionState::Active, _) => {
				let _ = resp_tx.send(ServerFrame::Error {
					code: "ALREADY_AUTHENTICATED".to_string(),
					message: "connection is already active".to_string(),
				});
			}

			(SessionState::Authenticating | SessionState::Closed, _) => return Ok(()),
		}
	}
}

/// Read one newline-terminated frame. `Ok(None)` on clean EOF; errors on
/// oversized frames and invalid UTF-8.
async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<String>>
where
	R: AsyncBufRead + Unpin,
{
	let mut buf = Vec::new();
	let n = reader
		.take((MAX_LINE_LEN + 1) as u64)
		.read_until(b'\n', &mut buf)
		.await
		.context("read frame")?;

	if n == 0 {
		return Ok(None);
	}
	if buf.len() > MAX_LINE_LEN {
		return Err(anyhow!("frame exceeds maximum size: max={MAX_LINE_LEN}"));
	}

	let line = String::from_utf8(buf).context("frame is not valid UTF-8")?;
	Ok(Some(line))
}

async fn write_loop<W>(
	mut write: W,
	mut resp_rx: mpsc::UnboundedReceiver<ServerFrame>,
	mut push_rx: mpsc::Receiver<OutboundMessage>,
) -> anyhow::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let mut push_open = true;

	loop {
		let frame = tokio::select! {
			frame = resp_rx.recv() => match frame {
				Some(frame) => frame,
				// Session loop is gone; nothing more to write.
				None => return Ok(()),
			},
			msg = push_rx.recv(), if push_open => match msg {
				Some(msg) => ServerFrame::Broadcast {
					from: msg.origin,
					text: msg.payload,
				},
				None => {
					push_open = false;
					continue;
				}
			},
		};

		let line = wire::encode_line(&frame).context("encode outbound frame")?;
		write.write_all(line.as_bytes()).await.context("write outbound frame")?;
	}
}

fn error_frame(e: &AuthError) -> ServerFrame {
	ServerFrame::Error {
		code: e.code().to_string(),
		message: e.to_string(),
	}
}
