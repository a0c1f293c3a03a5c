//! # Realtime Event Bus
//!
//! A single in-process publish/subscribe channel fanning server events out
//! to every connected web client. Delivery is best-effort: a subscriber
//! that lags past the channel capacity misses events rather than stalling
//! producers, and per-subscriber ordering is preserved by the channel.
//!
//! If the control plane is ever sharded across processes this bus is the
//! seam to replace with a durable stream; no consumer cares today.

use fleet_protocol::ServerEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Sized to absorb heartbeat bursts from a few hundred agents without
/// lagging dashboard subscribers.
const BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// New receiver for a web-client stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. With no subscribers the event is
    /// discarded, which is the normal state when no dashboard is open.
    pub fn publish(&self, event: ServerEvent) {
        match self.tx.send(event) {
            Ok(n) => trace!(subscribers = n, "event published"),
            Err(_) => trace!("event dropped, no subscribers"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
