//! HTTP route handlers for the dartrelay server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /round` - The latest round as JSON (`{}` before the first one)
//! - `GET /ws` - WebSocket push of every accepted round
//! - `GET /health` - Feed and server health
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - The latest-round store written by the relay
//! - The round broadcaster feeding WebSocket clients
//! - Shared feed health counters
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dartrelay_feed::{FeedHealth, LatestStateStore};
//! use dartrelay_server::broadcast::RoundBroadcaster;
//! use dartrelay_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::new(
//!         LatestStateStore::new(),
//!         RoundBroadcaster::new(),
//!         Arc::new(FeedHealth::new()),
//!     );
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dartrelay_feed::{FeedHealth, FeedHealthSnapshot, LatestStateStore};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{RoundBroadcaster, RoundEvent};

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the sequence number of the served round.
pub const HEADER_ROUND_SEQ: HeaderName = HeaderName::from_static("x-round-seq");

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Latest round, written only by the relay.
    pub store: LatestStateStore,

    /// Round fan-out for WebSocket clients.
    pub broadcaster: RoundBroadcaster,

    /// Feed health counters, written by the relay.
    pub health: Arc<FeedHealth>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates the application state. Uptime is counted from this call.
    #[must_use]
    pub fn new(store: LatestStateStore, broadcaster: RoundBroadcaster, health: Arc<FeedHealth>) -> Self {
        Self {
            store,
            broadcaster,
            health,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("latest_seq", &self.store.latest_seq())
            .field("broadcaster", &self.broadcaster)
            .field("health", &self.health)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// CORS is permissive since browser overlays poll `/round` from other origins.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/round", get(get_round))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// GET /round - Latest Round
// ============================================================================

/// GET /round - The most recent round.
///
/// # Responses
///
/// - `200 OK` with the round payload and an `X-Round-Seq` header
/// - `200 OK` with `{}` and no header when no round has arrived yet
async fn get_round(State(state): State<AppState>) -> Response {
    match state.store.get() {
        Some(snapshot) => {
            trace!(seq = snapshot.seq, "Serving current round");
            let seq = HeaderValue::from(snapshot.seq);
            let body = snapshot.round.0;
            ([(HEADER_ROUND_SEQ, seq)], Json(body)).into_response()
        }
        None => Json(json!({})).into_response(),
    }
}

// ============================================================================
// GET /ws - WebSocket Push
// ============================================================================

/// GET /ws - WebSocket upgrade for round push.
///
/// # WebSocket Protocol
///
/// The server sends JSON text messages shaped like [`RoundEvent`]. The
/// current round, if any, is sent immediately after the upgrade. Messages
/// from the client are ignored.
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let client_id = Uuid::new_v4();
    info!(%client_id, "WebSocket client connecting");

    ws.on_upgrade(move |socket| handle_websocket(socket, state, client_id))
}

/// Handles an established WebSocket connection.
///
/// Subscribes before reading the current round so nothing accepted in
/// between is missed. Rounds at or below the one already sent are skipped.
async fn handle_websocket(socket: WebSocket, state: AppState, client_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut round_rx = state.broadcaster.subscribe();
    let current = state.store.get();

    info!(%client_id, "WebSocket client connected");

    let forward_task = tokio::spawn(async move {
        let mut last_sent = 0;

        if let Some(snapshot) = current {
            last_sent = snapshot.seq;
            if send_event(&mut sender, &RoundEvent::from(&snapshot), client_id)
                .await
                .is_err()
            {
                return;
            }
        }

        loop {
            match round_rx.recv().await {
                Ok(event) => {
                    if event.seq <= last_sent {
                        trace!(%client_id, seq = event.seq, "Round already sent");
                        continue;
                    }
                    last_sent = event.seq;
                    if send_event(&mut sender, &event, client_id).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    warn!(%client_id, skipped = count, "WebSocket client lagged, skipped rounds");
                }
                Err(RecvError::Closed) => {
                    debug!(%client_id, "Round broadcaster closed");
                    break;
                }
            }
        }
    });

    // Wait for client to disconnect
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                debug!(%client_id, "WebSocket client sent close frame");
                break;
            }
            Ok(Message::Ping(data)) => {
                // axum handles pong automatically
                trace!(%client_id, data_len = data.len(), "Received ping");
            }
            Ok(_) => {}
            Err(err) => {
                debug!(%client_id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    info!(%client_id, "WebSocket client disconnected");
}

/// Serializes and sends one event. `Err` means the client is gone.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RoundEvent,
    client_id: Uuid,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            // Skip the round but keep the client
            error!(%client_id, seq = event.seq, error = %err, "Failed to serialize round");
            return Ok(());
        }
    };

    trace!(%client_id, seq = event.seq, "Sending round to WebSocket client");
    sender.send(Message::Text(json.into())).await.map_err(|err| {
        debug!(%client_id, error = %err, "Failed to send round to WebSocket client");
    })
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when commands to the vendor keep failing.
    pub status: String,

    /// Vendor feed health.
    pub feed: FeedHealthSnapshot,

    /// Sequence number of the latest round; 0 before the first one.
    pub latest_seq: u64,

    /// Number of connected WebSocket clients.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "feed": {
///     "connection": "connected",
///     "reconnects": 0,
///     "dropped_frames": 0,
///     "send_failures": 0,
///     "degraded": false,
///     "active_match": "0f6c..."
///   },
///   "latest_seq": 12,
///   "connections": 2,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let feed = state.health.snapshot();
    let status = if feed.degraded { "degraded" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        feed,
        latest_seq: state.store.latest_seq(),
        connections: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
