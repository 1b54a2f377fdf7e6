#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::server::registry::{ConnectionRegistry, OutboundMessage};

/// Configuration for `BroadcastHub`.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
	/// Upper bound on one delivery attempt; a peer that does not accept the
	/// message within this window counts as failed.
	pub delivery_timeout: Duration,

	pub debug_logs: bool,
}

impl Default for BroadcastConfig {
	fn default() -> Self {
		Self {
			delivery_timeout: Duration::from_millis(2000),
			debug_logs: false,
		}
	}
}

/// Fans one inbound message out to every registered connection.
#[derive(Clone)]
pub struct BroadcastHub {
	registry: ConnectionRegistry,
	cfg: BroadcastConfig,
}

impl BroadcastHub {
	pub fn new(registry: ConnectionRegistry, cfg: BroadcastConfig) -> Self {
		Self { registry, cfg }
	}

	/// Deliver `payload` to every member of the registry snapshot, the origin
	/// included (senders see their own message through the same path as
	/// everyone else). Returns the number of successful deliveries.
	///
	/// A failed delivery (peer gone, queue wedged past the timeout) never
	/// aborts the remaining deliveries and never surfaces to the sender; it
	/// triggers best-effort deregistration of that connection instead.
	pub async fn publish(&self, payload: &str, origin: u64) -> usize {
		let snapshot = self.registry.snapshot_for_fanout().await;
		metrics::counter!("beacon_server_broadcasts_total").increment(1);

		let message = OutboundMessage {
			origin,
			payload: payload.to_string(),
		};

		let mut delivered = 0usize;
		let mut failed: Vec<u64> = Vec::new();

		for (conn_id, sender) in snapshot {
			match timeout(self.cfg.delivery_timeout, sender.send(message.clone())).await {
				Ok(Ok(())) => {
					delivered += 1;
					metrics::counter!("beacon_server_deliveries_total").increment(1);
				}
				Ok(Err(_closed)) => {
					metrics::counter!("beacon_server_delivery_failures_total").increment(1);
					failed.push(conn_id);
				}
				Err(_elapsed) => {
					metrics::counter!("beacon_server_delivery_failures_total").increment(1);
					if self.cfg.debug_logs {
						debug!(conn_id, "broadcast: delivery timed out");
					}
					failed.push(conn_id);
				}
			}
		}

		for conn_id in failed {
			self.registry.remove(conn_id).await;
		}

		if self.cfg.debug_logs {
			debug!(origin, delivered, "broadcast: fanout complete");
		}

		delivered
	}
}
