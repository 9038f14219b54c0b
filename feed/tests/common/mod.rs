//! In-process stand-in for the Autodarts subscription endpoint.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Clone)]
enum VendorAction {
    Send(String),
    Drop,
}

#[derive(Clone)]
struct VendorState {
    token: String,
    commands: mpsc::UnboundedSender<Value>,
    control: broadcast::Sender<VendorAction>,
    connections: Arc<AtomicUsize>,
}

/// A vendor endpoint that records commands and sends scripted frames.
pub struct MockVendor {
    pub url: String,
    commands: mpsc::UnboundedReceiver<Value>,
    control: broadcast::Sender<VendorAction>,
    connections: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

impl MockVendor {
    /// Starts the endpoint; upgrades require `Authorization: Bearer <token>`.
    pub async fn start(token: &str) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));

        let state = VendorState {
            token: token.to_string(),
            commands: commands_tx,
            control: control.clone(),
            connections: Arc::clone(&connections),
        };

        let app = Router::new()
            .route("/ms/v0/subscribe", get(upgrade))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("ws://{addr}/ms/v0/subscribe"),
            commands,
            control,
            connections,
            server,
        }
    }

    /// Waits for the next command the client sent.
    pub async fn next_command(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("vendor stopped")
    }

    /// Asserts that the client sends nothing for `window`.
    pub async fn assert_no_command(&mut self, window: Duration) {
        if let Ok(Some(command)) = timeout(window, self.commands.recv()).await {
            panic!("unexpected command: {command}");
        }
    }

    /// Sends a JSON frame on the current connection.
    pub fn send(&self, frame: Value) {
        self.send_raw(frame.to_string());
    }

    /// Sends a text frame verbatim on the current connection.
    pub fn send_raw(&self, text: impl Into<String>) {
        self.control
            .send(VendorAction::Send(text.into()))
            .expect("no live connection");
    }

    /// Drops the current connection without a close handshake.
    pub fn drop_connection(&self) {
        self.control
            .send(VendorAction::Drop)
            .expect("no live connection");
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockVendor {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(
    State(state): State<VendorState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let expected = format!("Bearer {}", state.token);
    let presented = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    if presented != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(mut socket: WebSocket, state: VendorState) {
    let mut control = state.control.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(command) = serde_json::from_str::<Value>(text.as_str()) {
                        let _ = state.commands.send(command);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            action = control.recv() => match action {
                Ok(VendorAction::Send(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(VendorAction::Drop) | Err(_) => break,
            },
        }
    }
}

// ============================================================================
// Misbehaving Endpoints
// ============================================================================

/// How a [`FaultyVendor`] treats every accepted connection.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Completes the upgrade, then drops the socket without a close frame.
    DropAfterUpgrade,
    /// Completes the upgrade, then never reads or writes again.
    Unresponsive,
}

/// A vendor endpoint that accepts any upgrade and then misbehaves.
pub struct FaultyVendor {
    pub url: String,
    connections: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

impl FaultyVendor {
    pub async fn start(fault: Fault) -> Self {
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        let app = Router::new().route(
            "/ms/v0/subscribe",
            get(move |ws: WebSocketUpgrade| {
                let counter = Arc::clone(&counter);
                async move {
                    ws.on_upgrade(move |socket| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match fault {
                            Fault::DropAfterUpgrade => drop(socket),
                            Fault::Unresponsive => {
                                tokio::time::sleep(Duration::from_secs(60)).await;
                                drop(socket);
                            }
                        }
                    })
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("ws://{addr}/ms/v0/subscribe"),
            connections,
            server,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FaultyVendor {
    fn drop(&mut self) {
        self.server.abort();
    }
}
