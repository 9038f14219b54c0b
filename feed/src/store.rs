//! Latest-round store.
//!
//! [`LatestStateStore`] holds the most recent [`Round`] together with a
//! sequence number and receive timestamp. Reads never block the writer:
//!
//! - [`get()`](LatestStateStore::get) reads the current [`Snapshot`] from a
//!   `watch` cell.
//! - [`subscribe()`](LatestStateStore::subscribe) hands out a `broadcast`
//!   receiver with one item per accepted write. Slow receivers lose the
//!   oldest items and observe `RecvError::Lagged`.
//!
//! # Example
//!
//! ```rust
//! use dartrelay_feed::protocol::Round;
//! use dartrelay_feed::store::LatestStateStore;
//! use serde_json::json;
//!
//! let store = LatestStateStore::new();
//! assert!(store.get().is_none());
//!
//! let snapshot = store.set(Round(json!({"points": 60})));
//! assert_eq!(snapshot.seq, 1);
//! assert_eq!(store.get().unwrap().round, Round(json!({"points": 60})));
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::protocol::Round;

/// Per-subscriber notification queue length.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 64;

/// The current round as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// The most recent turn.
    pub round: Round,

    /// Starts at 1 and increases by one per accepted round.
    pub seq: u64,

    /// When the relay accepted the round.
    pub received_at: DateTime<Utc>,
}

struct Inner {
    current: watch::Sender<Option<Snapshot>>,
    notify: broadcast::Sender<Snapshot>,
}

/// Single-writer, many-reader holder of the latest round.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct LatestStateStore {
    inner: Arc<Inner>,
}

impl LatestStateStore {
    /// Creates an empty store with the default notification capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    /// Creates an empty store.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                current: watch::Sender::new(None),
                notify,
            }),
        }
    }

    /// Replaces the stored round and bumps the sequence number.
    ///
    /// Only the relay task writes; concurrent writers would race on `seq`.
    pub fn set(&self, round: Round) -> Snapshot {
        let snapshot = next_snapshot(self.inner.current.borrow().as_ref(), round);
        self.inner.current.send_replace(Some(snapshot.clone()));
        self.notify(&snapshot);
        snapshot
    }

    /// Stores `round` unless it is structurally equal to the stored one.
    ///
    /// Returns the new snapshot, or `None` when the write was skipped.
    pub fn set_if_changed(&self, round: Round) -> Option<Snapshot> {
        let mut written = None;
        self.inner.current.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|current| current.round == round) {
                return false;
            }
            let snapshot = next_snapshot(slot.as_ref(), round);
            written = Some(snapshot.clone());
            *slot = Some(snapshot);
            true
        });

        match written {
            Some(snapshot) => {
                self.notify(&snapshot);
                Some(snapshot)
            }
            None => {
                trace!("Round unchanged, skipping store update");
                None
            }
        }
    }

    /// Returns the current snapshot, or `None` before the first round.
    #[must_use]
    pub fn get(&self) -> Option<Snapshot> {
        self.inner.current.borrow().clone()
    }

    /// Sequence number of the current snapshot, or 0 before the first round.
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        self.inner.current.borrow().as_ref().map_or(0, |s| s.seq)
    }

    /// Subscribes to future writes.
    ///
    /// Writes made before subscribing are not delivered; read them with
    /// [`get()`](Self::get).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.inner.notify.subscribe()
    }

    /// Returns the number of live notification receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.notify.receiver_count()
    }

    fn notify(&self, snapshot: &Snapshot) {
        // Err only means nobody is listening
        match self.inner.notify.send(snapshot.clone()) {
            Ok(receivers) => debug!(seq = snapshot.seq, receivers, "Stored new round"),
            Err(_) => debug!(seq = snapshot.seq, "Stored new round with no subscribers"),
        }
    }
}

impl Default for LatestStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LatestStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestStateStore")
            .field("latest_seq", &self.latest_seq())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn next_snapshot(current: Option<&Snapshot>, round: Round) -> Snapshot {
    Snapshot {
        round,
        seq: current.map_or(1, |s| s.seq + 1),
        received_at: Utc::now(),
    }
}
