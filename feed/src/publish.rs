//! Forwarding store updates to consumers.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{LatestStateStore, Snapshot};

/// Something that pushes new rounds to clients.
pub trait PublishSink: Send + Sync + 'static {
    /// Delivers one snapshot. Must not block.
    fn publish(&self, snapshot: &Snapshot);
}

impl<S: PublishSink> PublishSink for std::sync::Arc<S> {
    fn publish(&self, snapshot: &Snapshot) {
        (**self).publish(snapshot);
    }
}

/// Spawns a task that hands every store update to `sink`.
///
/// If the task falls behind, skipped updates are logged and it continues
/// with newer ones. It ends once every handle to the store is dropped.
pub fn spawn_publisher<S: PublishSink>(store: &LatestStateStore, sink: S) -> JoinHandle<()> {
    let mut rx = store.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => sink.publish(&snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Publisher lagged, skipping to newer rounds");
                }
                Err(RecvError::Closed) => {
                    debug!("Store dropped, publisher stopping");
                    break;
                }
            }
        }
    })
}
