//! The relay task.
//!
//! [`Relay`] owns the [`FeedConnection`] and the
//! [`SubscriptionStateMachine`]. It is the only writer of the
//! [`LatestStateStore`] and the only caller of
//! [`FeedConnection::send`], so subscriptions are never issued from two
//! places at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::connection::{ConnectionState, FeedConnection, FeedEvent};
use crate::error::{ConnectError, FeedError, SendError};
use crate::health::FeedHealth;
use crate::machine::{SubscriptionStateMachine, DEFAULT_MATCH_IDLE_TIMEOUT};
use crate::protocol::Command;
use crate::store::LatestStateStore;

/// How often the match idle timeout is evaluated.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for the close handshake.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The board whose matches are followed.
    pub board_id: String,

    /// Time without match frames before the match is abandoned; zero disables.
    pub match_idle_timeout: Duration,

    /// Upper bound on the close handshake at shutdown.
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            match_idle_timeout: DEFAULT_MATCH_IDLE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

enum Step {
    Shutdown,
    IdleCheck,
    Event(Result<FeedEvent, ConnectError>),
}

/// Drives the connection and state machine until shutdown.
pub struct Relay<A> {
    connection: FeedConnection<A>,
    machine: SubscriptionStateMachine,
    health: Arc<FeedHealth>,
    shutdown_grace: Duration,
    board_id: String,
}

impl<A: Authenticator> Relay<A> {
    #[must_use]
    pub fn new(connection: FeedConnection<A>, config: RelayConfig, store: LatestStateStore) -> Self {
        let health = Arc::clone(connection.health());
        Self {
            machine: SubscriptionStateMachine::new(&config.board_id, store, config.match_idle_timeout),
            connection,
            health,
            shutdown_grace: config.shutdown_grace,
            board_id: config.board_id,
        }
    }

    /// Runs the relay on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), FeedError>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Connect`] when a finite reconnect budget is used
    /// up. Every other failure is retried.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        // Checked by the connection between reads, so it never interrupts a
        // handshake or a keepalive write
        let mut idle_check_at = Instant::now() + IDLE_CHECK_INTERVAL;

        info!(board_id = %self.board_id, url = %self.connection.url(), "Relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let step = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        Step::Shutdown
                    } else {
                        continue;
                    }
                }
                event = self.connection.next_event_until(Some(idle_check_at)) => match event {
                    Ok(Some(event)) => Step::Event(Ok(event)),
                    Ok(None) => Step::IdleCheck,
                    Err(e) => Step::Event(Err(e)),
                },
            };

            let commands = match step {
                Step::Shutdown => break,
                Step::IdleCheck => {
                    idle_check_at = Instant::now() + IDLE_CHECK_INTERVAL;
                    self.machine.on_idle_check(Instant::now())
                }
                Step::Event(Ok(event)) => self.machine.on_event(&event, Instant::now()),
                Step::Event(Err(e)) => {
                    error!(error = %e, "Feed connection permanently failed");
                    self.health.set_active_match(None);
                    return Err(e.into());
                }
            };

            let dispatched = tokio::select! {
                biased;

                () = wait_for_shutdown(&mut shutdown) => false,
                () = self.dispatch(commands) => true,
            };
            self.health.set_active_match(self.machine.active_match());

            if !dispatched {
                warn!("Shutdown requested while sending, abandoning pending commands");
                break;
            }
        }

        self.close().await;
        Ok(())
    }

    async fn dispatch(&mut self, commands: Vec<Command>) {
        for command in commands {
            match self.connection.send(&command).await {
                Ok(()) => self.health.record_send_success(),
                Err(e) => {
                    self.health.record_send_failure();
                    warn!(
                        error = %e,
                        channel = %command.channel,
                        topic = %command.topic,
                        "Failed to send command"
                    );
                    // Without a transport the rest would fail too; reconnect replays state
                    if matches!(
                        e,
                        SendError::NotConnected | SendError::Transport(_) | SendError::Timeout(_)
                    ) {
                        break;
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        info!("Relay shutting down");
        if tokio::time::timeout(self.shutdown_grace, self.connection.close())
            .await
            .is_err()
        {
            warn!(grace_secs = self.shutdown_grace.as_secs(), "Close handshake timed out");
            self.health.set_connection(ConnectionState::Disconnected);
        }
        debug!("Relay stopped");
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl<A> std::fmt::Debug for Relay<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("board_id", &self.board_id)
            .field("connection", &self.connection)
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}
