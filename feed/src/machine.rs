//! Subscription state machine.
//!
//! The machine turns [`FeedEvent`]s into subscribe/unsubscribe [`Command`]s
//! and writes accepted rounds into the [`LatestStateStore`]. It does no I/O:
//! the caller sends the returned commands and supplies the current time.
//!
//! ```text
//!            Connected / Reconnected
//!   Idle ───────────────────────────────▶ BoardSubscribed
//!    ▲                                      │       ▲
//!    │ Disconnected          start {id}     │       │ finish / stop / delete,
//!    │ (session kept)                       ▼       │ idle timeout
//!    └──────────────────────────────── MatchActive ─┘
//! ```
//!
//! On reconnect the board subscription is always replayed, followed by the
//! remembered match subscription if a session is held.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::connection::FeedEvent;
use crate::protocol::{BoardEvent, Command, InboundFrame, Subscription, MATCHES_CHANNEL};
use crate::store::LatestStateStore;

/// Default time without match frames before a session is abandoned.
pub const DEFAULT_MATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Subscription progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// No transport, or connected but not yet subscribed.
    Idle,
    /// Subscribed to the board, no match running.
    BoardSubscribed,
    /// Subscribed to the board and one match's state.
    MatchActive,
}

#[derive(Debug, Clone)]
struct MatchSession {
    match_id: String,
    subscription: Subscription,
    last_activity: Instant,
}

impl MatchSession {
    fn new(match_id: String, now: Instant) -> Self {
        Self {
            subscription: Subscription::match_state(&match_id),
            match_id,
            last_activity: now,
        }
    }
}

/// Tracks the board and at most one active match.
#[derive(Debug)]
pub struct SubscriptionStateMachine {
    board: Subscription,
    store: LatestStateStore,
    idle_timeout: Option<Duration>,
    state: MachineState,
    session: Option<MatchSession>,
}

impl SubscriptionStateMachine {
    /// Creates a machine for `board_id`.
    ///
    /// A zero `idle_timeout` disables the match idle check.
    #[must_use]
    pub fn new(board_id: &str, store: LatestStateStore, idle_timeout: Duration) -> Self {
        Self {
            board: Subscription::board(board_id),
            store,
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
            state: MachineState::Idle,
            session: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// The id of the match currently followed, if any.
    #[must_use]
    pub fn active_match(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.match_id.as_str())
    }

    /// The subscriptions a fresh connection needs, board first.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        let mut subs = vec![self.board.clone()];
        if let Some(session) = &self.session {
            subs.push(session.subscription.clone());
        }
        subs
    }

    /// Dispatches a connection event.
    pub fn on_event(&mut self, event: &FeedEvent, now: Instant) -> Vec<Command> {
        match event {
            FeedEvent::Connected | FeedEvent::Reconnected => self.on_connected(now),
            FeedEvent::Disconnected => {
                self.on_disconnected();
                Vec::new()
            }
            FeedEvent::Frame(frame) => self.on_frame(frame, now),
        }
    }

    /// Replays every held subscription on a new transport.
    pub fn on_connected(&mut self, now: Instant) -> Vec<Command> {
        let commands: Vec<Command> = self
            .active_subscriptions()
            .iter()
            .map(Subscription::subscribe)
            .collect();

        self.state = match self.session.as_mut() {
            Some(session) => {
                // Time spent disconnected does not count as match inactivity
                session.last_activity = now;
                info!(match_id = %session.match_id, "Resubscribing to board and active match");
                MachineState::MatchActive
            }
            None => {
                info!(topic = %self.board.topic, "Subscribing to board");
                MachineState::BoardSubscribed
            }
        };

        commands
    }

    /// Marks the transport as gone. The match session is kept for replay.
    pub fn on_disconnected(&mut self) {
        debug!(had_match = self.session.is_some(), "Subscriptions suspended");
        self.state = MachineState::Idle;
    }

    /// Interprets one inbound frame.
    pub fn on_frame(&mut self, frame: &InboundFrame, now: Instant) -> Vec<Command> {
        if let Some(event) = frame.board_event() {
            if frame.topic.as_deref().is_some_and(|t| t != self.board.topic) {
                trace!(topic = ?frame.topic, "Ignoring event for another board");
                return Vec::new();
            }
            return self.on_board_event(event, now);
        }

        if frame.channel == MATCHES_CHANNEL {
            self.on_match_frame(frame, now);
        } else {
            trace!(channel = %frame.channel, "Ignoring frame on unhandled channel");
        }

        Vec::new()
    }

    /// Abandons the match if no match frame arrived within the idle timeout.
    pub fn on_idle_check(&mut self, now: Instant) -> Vec<Command> {
        let (Some(timeout), Some(session)) = (self.idle_timeout, &self.session) else {
            return Vec::new();
        };

        if now.saturating_duration_since(session.last_activity) < timeout {
            return Vec::new();
        }

        info!(
            match_id = %session.match_id,
            timeout_secs = timeout.as_secs(),
            "Match idle timeout elapsed, unsubscribing"
        );
        self.end_session()
    }

    fn on_board_event(&mut self, event: BoardEvent, now: Instant) -> Vec<Command> {
        match event {
            BoardEvent::Start { match_id } => self.start_match(match_id, now),
            BoardEvent::End { match_id } => {
                let Some(session) = &self.session else {
                    trace!("End event with no active match");
                    return Vec::new();
                };
                match match_id {
                    Some(id) if id != session.match_id => {
                        debug!(ended = %id, active = %session.match_id, "Ignoring end of another match");
                        Vec::new()
                    }
                    _ => {
                        info!(match_id = %session.match_id, "Match ended");
                        self.end_session()
                    }
                }
            }
            BoardEvent::Other(name) => {
                trace!(event = %name, "Ignoring board event");
                Vec::new()
            }
        }
    }

    fn start_match(&mut self, match_id: String, now: Instant) -> Vec<Command> {
        let mut commands = Vec::with_capacity(2);

        if let Some(previous) = &self.session {
            if previous.match_id == match_id {
                debug!(match_id = %match_id, "Duplicate start event");
                return commands;
            }
            info!(previous = %previous.match_id, next = %match_id, "Switching to new match");
            commands.push(previous.subscription.unsubscribe());
        } else {
            info!(match_id = %match_id, "Match started");
        }

        let session = MatchSession::new(match_id, now);
        commands.push(session.subscription.subscribe());
        self.session = Some(session);
        self.state = MachineState::MatchActive;
        commands
    }

    fn end_session(&mut self) -> Vec<Command> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        self.state = MachineState::BoardSubscribed;
        vec![session.subscription.unsubscribe()]
    }

    fn on_match_frame(&mut self, frame: &InboundFrame, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            trace!("Dropping match frame with no active match");
            return;
        };

        let topic_matches = frame
            .topic
            .as_deref()
            .map_or(true, |topic| topic == session.subscription.topic);
        let id_matches = frame
            .data
            .get("id")
            .and_then(Value::as_str)
            .map_or(true, |id| id == session.match_id);

        if !topic_matches || !id_matches {
            debug!(
                frame_match = ?frame.match_id(),
                active = %session.match_id,
                "Dropping frame for another match"
            );
            return;
        }

        session.last_activity = now;

        let Some(round) = frame.latest_turn() else {
            trace!("Match frame without turns");
            return;
        };

        if let Some(snapshot) = self.store.set_if_changed(round) {
            debug!(seq = snapshot.seq, "Accepted new round");
        }
    }
}
