//! Round broadcasting for WebSocket clients.
//!
//! [`RoundBroadcaster`] is the server's [`PublishSink`]: the publisher task
//! hands it every accepted [`Snapshot`] and it fans the resulting
//! [`RoundEvent`] out to all connected WebSocket clients over a tokio
//! broadcast channel.
//!
//! # Example
//!
//! ```rust
//! use dartrelay_feed::{PublishSink, Round, LatestStateStore};
//! use dartrelay_server::broadcast::RoundBroadcaster;
//! use serde_json::json;
//!
//! let store = LatestStateStore::new();
//! let broadcaster = RoundBroadcaster::new();
//! let mut rx = broadcaster.subscribe();
//!
//! let snapshot = store.set(Round(json!({"points": 60})));
//! broadcaster.publish(&snapshot);
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.seq, 1);
//! assert_eq!(event.data, json!({"points": 60}));
//! ```

use chrono::{DateTime, Utc};
use dartrelay_feed::{PublishSink, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

/// Default channel capacity.
///
/// Rounds arrive a few times a minute, so a client that falls this far
/// behind is stalled rather than slow. It skips ahead to newer rounds.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Value of the `event` field on every pushed message.
pub const ROUND_EVENT: &str = "round";

/// The message pushed to WebSocket clients for each accepted round.
///
/// ```json
/// {"event": "round", "seq": 3, "received_at": "2024-05-01T19:02:11Z", "data": {...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEvent {
    /// Always [`ROUND_EVENT`].
    pub event: String,

    /// Sequence number of the round.
    pub seq: u64,

    /// When the relay accepted the round.
    pub received_at: DateTime<Utc>,

    /// The round payload, unchanged from the vendor.
    pub data: Value,
}

impl From<&Snapshot> for RoundEvent {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            event: ROUND_EVENT.to_string(),
            seq: snapshot.seq,
            received_at: snapshot.received_at,
            data: snapshot.round.payload().clone(),
        }
    }
}

/// Fans accepted rounds out to every WebSocket client.
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct RoundBroadcaster {
    sender: Sender<RoundEvent>,
}

impl RoundBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given per-client queue length.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created round broadcaster");
        Self { sender }
    }

    /// Subscribes to rounds broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<RoundEvent> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Sends `event` to every subscriber and returns how many there were.
    ///
    /// Never blocks. With nobody listening the event is discarded.
    pub fn broadcast(&self, event: RoundEvent) -> usize {
        let seq = event.seq;
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(seq, receivers, "Round broadcast");
                receivers
            }
            Err(_) => {
                trace!(seq, "No subscribers for round");
                0
            }
        }
    }

    /// Number of live subscribers, which is the number of WebSocket clients.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RoundBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishSink for RoundBroadcaster {
    fn publish(&self, snapshot: &Snapshot) {
        self.broadcast(RoundEvent::from(snapshot));
    }
}
