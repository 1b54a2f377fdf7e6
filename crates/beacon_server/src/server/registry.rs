#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use beacon_domain::UserId;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// One message as delivered to a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
	/// Connection id of the sender (informational only).
	pub origin: u64,
	pub payload: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("connection {0} already registered")]
	AlreadyRegistered(u64),
}

/// The set of live, authenticated connections.
///
/// Every entry corresponds to a transport connection that passed token
/// verification; the session gateway is the only writer. The mutex is held
/// only for map mutation and snapshotting, never across channel sends.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
	conns: HashMap<u64, RegisteredConn>,
}

struct RegisteredConn {
	user_id: UserId,
	sender: mpsc::Sender<OutboundMessage>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a newly authenticated connection.
	pub async fn add(&self, conn_id: u64, user_id: UserId, sender: mpsc::Sender<OutboundMessage>) -> Result<(), RegistryError> {
		let mut inner = self.inner.lock().await;
		if inner.conns.contains_key(&conn_id) {
			return Err(RegistryError::AlreadyRegistered(conn_id));
		}

		inner.conns.insert(conn_id, RegisteredConn { user_id, sender });
		debug!(conn_id, %user_id, total = inner.conns.len(), "registry: added connection");
		Ok(())
	}

	/// Remove a connection. No-op when absent: disconnect can race with the
	/// broadcast hub's failed-delivery removal.
	pub async fn remove(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if inner.conns.remove(&conn_id).is_some() {
			debug!(conn_id, total = inner.conns.len(), "registry: removed connection");
		}
	}

	/// Point-in-time consistent view of all delivery handles for one fanout.
	/// Additions and removals after the snapshot do not affect it.
	pub async fn snapshot_for_fanout(&self) -> Vec<(u64, mpsc::Sender<OutboundMessage>)> {
		let inner = self.inner.lock().await;
		inner
			.conns
			.iter()
			.map(|(conn_id, conn)| (*conn_id, conn.sender.clone()))
			.collect()
	}

	pub async fn contains(&self, conn_id: u64) -> bool {
		self.inner.lock().await.conns.contains_key(&conn_id)
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.conns.len()
	}

	/// Drop every entry (process shutdown path).
	pub async fn clear(&self) {
		let mut inner = self.inner.lock().await;
		let dropped = inner.conns.len();
		inner.conns.clear();
		if dropped > 0 {
			debug!(dropped, "registry: cleared all connections");
		}
	}
}
