//! Vendor WebSocket connection.
//!
//! [`FeedConnection`] owns at most one transport at a time. Callers pull
//! [`FeedEvent`]s from [`next_event()`](FeedConnection::next_event); when the
//! transport is gone the next call reconnects according to the
//! [`ReconnectPolicy`], so the caller never sees two overlapping connections.
//!
//! `next_event()` keeps its progress (retry deadline, keepalive and pong
//! deadlines) in the connection itself, so it can be dropped from a
//! `select!` and called again without losing its place.
//!
//! A transport only counts as healthy once it has stayed up for
//! `stable_after`. Shorter-lived transports count as failed attempts, so a
//! server that accepts the upgrade and then drops it backs off like one
//! that refuses the connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, TokenProvider};
use crate::backoff::ReconnectPolicy;
use crate::error::{ConnectError, SendError};
use crate::health::FeedHealth;
use crate::protocol::{Command, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time before a keepalive ping is sent.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Default time to wait for any frame after a keepalive ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on a single frame write.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default uptime after which a transport resets the reconnect backoff.
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(10);

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl ConnectionState {
    /// Inverse of `state as u8`; unknown values read as `Disconnected`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Disconnected,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

/// What the connection observed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// First successful connection.
    Connected,
    /// A later successful connection after a drop.
    Reconnected,
    /// The transport closed or failed.
    Disconnected,
    /// A well-formed inbound frame.
    Frame(InboundFrame),
}

/// One logical connection to the vendor endpoint.
pub struct FeedConnection<A> {
    url: String,
    tokens: Arc<TokenProvider<A>>,
    health: Arc<FeedHealth>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
    pong_timeout: Option<Duration>,
    send_timeout: Duration,
    stable_after: Duration,

    ws: Option<WsStream>,
    state: ConnectionState,
    has_connected: bool,
    connected_at: Option<Instant>,
    failed_attempts: u32,
    retry_at: Option<Instant>,
    last_activity: Instant,
    pong_deadline: Option<Instant>,
    pending_disconnect: bool,
    exhausted: Option<String>,
}

impl<A: Authenticator> FeedConnection<A> {
    /// Creates a disconnected connection; nothing happens until it is polled.
    #[must_use]
    pub fn new(url: impl Into<String>, tokens: Arc<TokenProvider<A>>, health: Arc<FeedHealth>) -> Self {
        Self {
            url: url.into(),
            tokens,
            health,
            policy: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
            pong_timeout: Some(DEFAULT_PONG_TIMEOUT),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            stable_after: DEFAULT_STABLE_AFTER,
            ws: None,
            state: ConnectionState::Disconnected,
            has_connected: false,
            connected_at: None,
            failed_attempts: 0,
            retry_at: None,
            last_activity: Instant::now(),
            pong_deadline: None,
            pending_disconnect: false,
            exhausted: None,
        }
    }

    /// Sets the reconnect policy (builder pattern).
    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the handshake timeout (builder pattern).
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the keepalive idle time; `None` disables pings (builder pattern).
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Sets how long to wait for a reply to a keepalive ping; `None` waits
    /// forever (builder pattern).
    #[must_use]
    pub fn with_pong_timeout(mut self, pong_timeout: Option<Duration>) -> Self {
        self.pong_timeout = pong_timeout;
        self
    }

    /// Sets the upper bound on one frame write (builder pattern).
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the uptime after which a dropped transport no longer counts as a
    /// failed attempt (builder pattern).
    #[must_use]
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    #[must_use]
    pub fn health(&self) -> &Arc<FeedHealth> {
        &self.health
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the transport, replacing any existing one.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Auth`] if no token could be obtained
    /// - [`ConnectError::InvalidUrl`] if the endpoint is not a WebSocket URL
    /// - [`ConnectError::Rejected`] if the server answered the upgrade with an HTTP error
    /// - [`ConnectError::Handshake`] on TCP, TLS or protocol failure
    /// - [`ConnectError::Timeout`] if the handshake took too long
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.ws = None;
        self.set_state(ConnectionState::Connecting);

        match open_transport(&self.url, self.tokens.as_ref(), self.connect_timeout).await {
            Ok(ws) => {
                let now = Instant::now();
                self.ws = Some(ws);
                self.connected_at = Some(now);
                self.last_activity = now;
                self.pong_deadline = None;
                self.set_state(ConnectionState::Connected);
                info!(url = %self.url, "Connected to feed");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Writes one command as a JSON text frame.
    ///
    /// A failed write drops the transport; the next
    /// [`next_event()`](Self::next_event) reports the disconnect.
    ///
    /// # Errors
    ///
    /// - [`SendError::NotConnected`] if there is no transport
    /// - [`SendError::Serialize`] if the command cannot be encoded
    /// - [`SendError::Transport`] if the write fails
    /// - [`SendError::Timeout`] if the write does not finish within the send timeout
    pub async fn send(&mut self, command: &Command) -> Result<(), SendError> {
        let Some(ws) = self.ws.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let payload = serde_json::to_string(command)?;

        if let Err(e) = write_frame(ws, Message::Text(payload.into()), self.send_timeout).await {
            self.drop_transport(&e.to_string());
            self.pending_disconnect = true;
            return Err(e);
        }

        self.last_activity = Instant::now();
        debug!(
            channel = %command.channel,
            topic = %command.topic,
            kind = ?command.kind,
            "Sent command"
        );
        Ok(())
    }

    /// Waits for the next event, reconnecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::RetriesExhausted`] once a finite reconnect
    /// budget has been used up. Every later call returns the same error.
    pub async fn next_event(&mut self) -> Result<FeedEvent, ConnectError> {
        loop {
            if let Some(event) = self.next_event_until(None).await? {
                return Ok(event);
            }
        }
    }

    /// Like [`next_event()`](Self::next_event), but returns `Ok(None)` once
    /// `deadline` passes while the transport is open and idle.
    ///
    /// The deadline is only checked between reads, so a keepalive ping
    /// that is being written is never abandoned halfway. It is not checked
    /// while reconnecting.
    ///
    /// # Errors
    ///
    /// Same as [`next_event()`](Self::next_event).
    pub async fn next_event_until(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<FeedEvent>, ConnectError> {
        if self.pending_disconnect {
            self.pending_disconnect = false;
            return Ok(Some(FeedEvent::Disconnected));
        }

        loop {
            // One ping in flight at a time
            let keepalive_at = match self.pong_deadline {
                Some(_) => None,
                None => self.keepalive.map(|idle| self.last_activity + idle),
            };
            let pong_deadline = self.pong_deadline;
            let send_timeout = self.send_timeout;

            let Some(ws) = self.ws.as_mut() else {
                return self.reconnect().await.map(Some);
            };

            let message = tokio::select! {
                biased;

                message = ws.next() => message,
                () = sleep_until_opt(pong_deadline) => {
                    return Ok(Some(self.drop_transport("no reply to keepalive ping")));
                }
                () = sleep_until_opt(keepalive_at) => {
                    trace!("Sending keepalive ping");
                    if let Err(e) = write_frame(ws, Message::Ping(Vec::new().into()), send_timeout).await {
                        return Ok(Some(self.drop_transport(&format!("keepalive ping failed: {e}"))));
                    }
                    let now = Instant::now();
                    self.last_activity = now;
                    self.pong_deadline = self.pong_timeout.map(|wait| now + wait);
                    continue;
                }
                () = sleep_until_opt(deadline) => return Ok(None),
            };

            // Any inbound frame proves the peer is alive
            self.last_activity = Instant::now();
            self.pong_deadline = None;

            match message {
                Some(Ok(Message::Text(text))) => match InboundFrame::parse(text.as_str()) {
                    Ok(frame) => {
                        trace!(channel = %frame.channel, "Received frame");
                        return Ok(Some(FeedEvent::Frame(frame)));
                    }
                    Err(e) => {
                        self.health.record_dropped_frame();
                        warn!(error = %e, "Dropping malformed frame");
                    }
                },
                Some(Ok(Message::Binary(data))) => {
                    self.health.record_dropped_frame();
                    warn!(bytes = data.len(), "Dropping unexpected binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| {
                            format!(
                                "server closed connection ({}): {}",
                                u16::from(f.code),
                                f.reason.as_str()
                            )
                        })
                        .unwrap_or_else(|| "server closed connection".to_string());
                    return Ok(Some(self.drop_transport(&reason)));
                }
                // tungstenite queues the Pong reply itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return Ok(Some(self.drop_transport(&format!("read error: {e}"))));
                }
                None => {
                    return Ok(Some(self.drop_transport("stream ended")));
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<FeedEvent, ConnectError> {
        if let Some(last_error) = &self.exhausted {
            return Err(ConnectError::RetriesExhausted {
                attempts: self.failed_attempts,
                last_error: last_error.clone(),
            });
        }

        loop {
            if let Some(deadline) = self.retry_at {
                tokio::time::sleep_until(deadline).await;
                self.retry_at = None;
            }

            match self.connect().await {
                Ok(()) => {
                    let event = if self.has_connected {
                        self.health.record_reconnect();
                        FeedEvent::Reconnected
                    } else {
                        FeedEvent::Connected
                    };
                    self.has_connected = true;
                    return Ok(event);
                }
                Err(e) => {
                    let last_error = e.to_string();
                    if !self.record_failure(&last_error) {
                        return Err(ConnectError::RetriesExhausted {
                            attempts: self.failed_attempts,
                            last_error,
                        });
                    }
                    warn!(error = %e, attempt = self.failed_attempts, "Feed connection failed, retrying");
                }
            }
        }
    }

    /// Counts one failed attempt and schedules the next one.
    ///
    /// Returns `false` once the reconnect budget is used up.
    fn record_failure(&mut self, error: &str) -> bool {
        self.failed_attempts += 1;

        if self.policy.is_exhausted(self.failed_attempts) {
            warn!(attempts = self.failed_attempts, error, "Reconnect budget exhausted");
            self.exhausted = Some(error.to_string());
            self.retry_at = None;
            return false;
        }

        let delay = self.policy.delay(self.failed_attempts - 1);
        debug!(
            attempt = self.failed_attempts,
            delay_ms = delay.as_millis() as u64,
            "Next connection attempt scheduled"
        );
        self.retry_at = Some(Instant::now() + delay);
        true
    }

    /// Sends a Close frame and drops the transport.
    pub async fn close(&mut self) {
        self.connected_at = None;
        self.pong_deadline = None;
        if let Some(mut ws) = self.ws.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = ws.close(None).await {
                debug!(error = %e, "Close handshake failed");
            }
            info!(url = %self.url, "Feed connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn drop_transport(&mut self, reason: &str) -> FeedEvent {
        self.ws = None;
        self.pong_deadline = None;
        self.set_state(ConnectionState::Disconnected);

        let stable = self
            .connected_at
            .take()
            .is_some_and(|at| at.elapsed() >= self.stable_after);
        warn!(reason, stable, "Feed connection lost");

        if stable {
            self.failed_attempts = 0;
            self.retry_at = Some(Instant::now() + self.policy.delay(0));
        } else {
            // Exhaustion surfaces from the next reconnect
            self.record_failure(reason);
        }
        FeedEvent::Disconnected
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.health.set_connection(state);
    }
}

impl<A> std::fmt::Debug for FeedConnection<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("failed_attempts", &self.failed_attempts)
            .finish_non_exhaustive()
    }
}

async fn write_frame(ws: &mut WsStream, message: Message, limit: Duration) -> Result<(), SendError> {
    match tokio::time::timeout(limit, ws.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
        Err(_) => Err(SendError::Timeout(limit)),
    }
}

async fn open_transport<A: Authenticator>(
    url: &str,
    tokens: &TokenProvider<A>,
    connect_timeout: Duration,
) -> Result<WsStream, ConnectError> {
    let token = tokens.token().await?;

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| ConnectError::Handshake(format!("token is not a valid header value: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    debug!(url = %url, "Opening feed connection");

    match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(WsError::Http(response))) => {
            let status = response.status().as_u16();
            let message = match status {
                401 => "unauthorized: token rejected".to_string(),
                403 => "forbidden: account may not subscribe".to_string(),
                _ => response
                    .status()
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            };
            if status == 401 || status == 403 {
                warn!(status, "Feed rejected bearer token");
                tokens.invalidate().await;
            }
            Err(ConnectError::Rejected { status, message })
        }
        Ok(Err(WsError::Url(e))) => Err(ConnectError::InvalidUrl(e.to_string())),
        Ok(Err(e)) => Err(ConnectError::Handshake(e.to_string())),
        Err(_) => Err(ConnectError::Timeout(connect_timeout)),
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
