//! Shared feed health counters.
//!
//! The relay task writes, the gateway reads. All fields are atomics (or a
//! short-lived lock for the match id) so readers never wait on the feed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::connection::ConnectionState;

/// Consecutive send failures after which the feed reports itself degraded.
pub const DEGRADED_SEND_FAILURES: u32 = 3;

/// Live health of the vendor feed.
#[derive(Debug, Default)]
pub struct FeedHealth {
    connection: AtomicU8,
    reconnects: AtomicU64,
    dropped_frames: AtomicU64,
    send_failures: AtomicU32,
    degraded: AtomicBool,
    active_match: RwLock<Option<String>>,
}

/// Point-in-time copy of [`FeedHealth`], shaped for JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedHealthSnapshot {
    pub connection: ConnectionState,
    pub reconnects: u64,
    pub dropped_frames: u64,
    pub send_failures: u32,
    pub degraded: bool,
    pub active_match: Option<String>,
}

impl FeedHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.connection.store(state as u8, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection.load(Ordering::Relaxed))
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed command write and flips to degraded at the threshold.
    pub fn record_send_failure(&self) {
        let failures = self.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= DEGRADED_SEND_FAILURES && !self.degraded.swap(true, Ordering::Relaxed) {
            error!(failures, "Feed degraded: repeated command send failures");
        }
    }

    /// Resets the failure streak after a successful write.
    pub fn record_send_success(&self) {
        self.send_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Feed recovered from degraded state");
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_active_match(&self, match_id: Option<&str>) {
        if let Ok(mut slot) = self.active_match.write() {
            *slot = match_id.map(str::to_string);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> FeedHealthSnapshot {
        FeedHealthSnapshot {
            connection: self.connection(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            active_match: self
                .active_match
                .read()
                .ok()
                .and_then(|slot| slot.clone()),
        }
    }
}
