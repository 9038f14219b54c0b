//! End-to-end tests of the relay against an in-process vendor endpoint.
//!
//! These tests verify that:
//! - The bearer token is presented on the upgrade request
//! - The board and match subscriptions follow board events
//! - A dropped transport is re-established with each subscription replayed once
//! - A silent match is abandoned once the idle timeout passes
//! - Malformed frames are counted and otherwise ignored

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use dartrelay_feed::{
    ConnectError, ConnectionState, FeedConnection, FeedError, FeedHealth, LatestStateStore,
    ReconnectPolicy, Relay, RelayConfig, Round, Snapshot, StaticAuthenticator, TokenProvider,
};

use common::MockVendor;

const TOKEN: &str = "test-token";
const BOARD: &str = "board-1";

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    vendor: MockVendor,
    store: LatestStateStore,
    health: Arc<FeedHealth>,
    shutdown: watch::Sender<bool>,
    relay: JoinHandle<Result<(), FeedError>>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(RelayConfig::new(BOARD)).await
    }

    async fn start_with(config: RelayConfig) -> Self {
        let vendor = MockVendor::start(TOKEN).await;
        let store = LatestStateStore::new();
        let health = Arc::new(FeedHealth::new());

        let tokens = Arc::new(TokenProvider::new(StaticAuthenticator::new(TOKEN)));
        let connection = FeedConnection::new(vendor.url.clone(), tokens, Arc::clone(&health))
            .with_policy(ReconnectPolicy::fast_for_tests())
            .with_keepalive(None);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let relay = Relay::new(connection, config, store.clone()).spawn(shutdown_rx);

        Self {
            vendor,
            store,
            health,
            shutdown,
            relay,
        }
    }

    async fn expect_board_subscribe(&mut self) {
        assert_eq!(
            self.vendor.next_command().await,
            json!({"channel": "autodarts.boards", "type": "subscribe", "topic": "board-1.matches"})
        );
    }

    fn start_match(&self, match_id: &str) {
        self.vendor.send(json!({
            "channel": "autodarts.boards",
            "topic": "board-1.matches",
            "data": {"event": "start", "id": match_id}
        }));
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let result = timeout(Duration::from_secs(10), self.relay)
            .await
            .expect("relay did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

fn match_subscribe(match_id: &str) -> Value {
    json!({"channel": "autodarts.matches", "type": "subscribe", "topic": format!("{match_id}.state")})
}

fn match_unsubscribe(match_id: &str) -> Value {
    json!({"channel": "autodarts.matches", "type": "unsubscribe", "topic": format!("{match_id}.state")})
}

fn turns_frame(match_id: &str, turns: Value) -> Value {
    json!({
        "channel": "autodarts.matches",
        "topic": format!("{match_id}.state"),
        "data": {"id": match_id, "turns": turns}
    })
}

async fn next_snapshot(rx: &mut broadcast::Receiver<Snapshot>) -> Snapshot {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a round")
        .unwrap()
}

// ============================================================================
// Subscription Flow
// ============================================================================

#[tokio::test]
async fn follows_match_and_stores_latest_round() {
    let mut h = Harness::start().await;
    let mut rounds = h.store.subscribe();

    h.expect_board_subscribe().await;
    assert!(h.store.get().is_none());

    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    h.vendor
        .send(turns_frame("m1", json!([{"throws": [20, 20, 20]}, {"throws": [1, 5, 20]}])));
    let first = next_snapshot(&mut rounds).await;
    assert_eq!(first.seq, 1);
    assert_eq!(first.round, Round(json!({"throws": [20, 20, 20]})));

    // Repeating the same turn must not produce a new sequence number
    h.vendor
        .send(turns_frame("m1", json!([{"throws": [20, 20, 20]}])));
    h.vendor
        .send(turns_frame("m1", json!([{"throws": [19, 19, 3]}])));
    let second = next_snapshot(&mut rounds).await;
    assert_eq!(second.seq, 2);
    assert_eq!(second.round, Round(json!({"throws": [19, 19, 3]})));

    assert_eq!(h.health.snapshot().active_match.as_deref(), Some("m1"));
    h.stop().await;
}

#[tokio::test]
async fn new_match_replaces_previous_subscription() {
    let mut h = Harness::start().await;
    h.expect_board_subscribe().await;

    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    h.start_match("m1");
    h.start_match("m2");
    assert_eq!(h.vendor.next_command().await, match_unsubscribe("m1"));
    assert_eq!(h.vendor.next_command().await, match_subscribe("m2"));
    h.vendor.assert_no_command(Duration::from_millis(200)).await;

    h.stop().await;
}

#[tokio::test]
async fn finished_match_is_unsubscribed() {
    let mut h = Harness::start().await;
    h.expect_board_subscribe().await;

    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    h.vendor.send(json!({
        "channel": "autodarts.boards",
        "topic": "board-1.matches",
        "data": {"event": "finish", "id": "m1"}
    }));
    assert_eq!(h.vendor.next_command().await, match_unsubscribe("m1"));

    h.stop().await;
}

#[tokio::test]
async fn silent_match_is_abandoned_after_idle_timeout() {
    let mut config = RelayConfig::new(BOARD);
    config.match_idle_timeout = Duration::from_millis(300);
    let mut h = Harness::start_with(config).await;
    h.expect_board_subscribe().await;

    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    // No match frames follow; the next idle check ends the session
    assert_eq!(h.vendor.next_command().await, match_unsubscribe("m1"));
    timeout(Duration::from_secs(5), async {
        while h.health.snapshot().active_match.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active match was never cleared");
    assert_eq!(h.health.snapshot().connection, ConnectionState::Connected);

    h.stop().await;
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn reconnect_replays_each_subscription_once() {
    let mut h = Harness::start().await;
    h.expect_board_subscribe().await;
    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    h.vendor.drop_connection();

    h.expect_board_subscribe().await;
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));
    h.vendor.assert_no_command(Duration::from_millis(300)).await;

    assert_eq!(h.vendor.connections(), 2);
    let health = h.health.snapshot();
    assert_eq!(health.reconnects, 1);
    assert_eq!(health.connection, ConnectionState::Connected);

    // Rounds still flow on the new transport
    let mut rounds = h.store.subscribe();
    h.vendor.send(turns_frame("m1", json!([{"throws": [25]}])));
    assert_eq!(next_snapshot(&mut rounds).await.seq, 1);

    h.stop().await;
}

#[tokio::test]
async fn rejected_token_is_reported_as_unauthorized() {
    let vendor = MockVendor::start(TOKEN).await;
    let tokens = Arc::new(TokenProvider::new(StaticAuthenticator::new("wrong-token")));
    let mut connection = FeedConnection::new(vendor.url.clone(), tokens, Arc::new(FeedHealth::new()));

    let err = connection.connect().await.unwrap_err();
    assert!(
        matches!(err, ConnectError::Rejected { status: 401, .. }),
        "got {err:?}"
    );
    assert_eq!(vendor.connections(), 0);
}

// ============================================================================
// Malformed Frames
// ============================================================================

#[tokio::test]
async fn malformed_frames_are_dropped_and_counted() {
    let mut h = Harness::start().await;
    h.expect_board_subscribe().await;

    h.vendor.send_raw("this is not json");
    h.vendor.send(json!({"data": {"event": "start", "id": "m1"}}));
    h.vendor.send(json!(["channel", "autodarts.boards"]));

    // The connection survives and keeps processing frames
    h.start_match("m1");
    assert_eq!(h.vendor.next_command().await, match_subscribe("m1"));

    let health = h.health.snapshot();
    assert_eq!(health.dropped_frames, 3);
    assert_eq!(health.reconnects, 0);
    assert!(h.store.get().is_none());

    h.stop().await;
}
