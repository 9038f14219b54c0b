//! dartrelay server - Main entry point.
//!
//! This binary starts the relay with:
//! - Structured JSON logging
//! - An initial token fetch (startup fails if it does)
//! - The feed relay and round publisher on background tasks
//! - Graceful shutdown on SIGTERM/SIGINT, or when the feed gives up
//!
//! # Configuration
//!
//! See [`dartrelay_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! AUTODARTS_USERNAME=player@example.com \
//! AUTODARTS_PASSWORD=secret \
//! AUTODARTS_CLIENT_ID=relay \
//! AUTODARTS_CLIENT_SECRET=client-secret \
//! AUTODARTS_BOARD_ID=0f6c1a2b-board \
//! cargo run --release --bin dartrelay-server
//! ```

use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use dartrelay_feed::{
    spawn_publisher, FeedConnection, FeedHealth, KeycloakAuthenticator, LatestStateStore, Relay,
    RelayConfig, TokenProvider,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dartrelay_server::broadcast::RoundBroadcaster;
use dartrelay_server::config::Config;
use dartrelay_server::error::ServerError;
use dartrelay_server::routes::{create_router, AppState};

/// How often the background task checks the cached token.
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Extra time given to the relay after its own close grace has passed.
const RELAY_JOIN_SLACK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  AUTODARTS_USERNAME            - Autodarts account name");
            eprintln!("  AUTODARTS_PASSWORD            - Autodarts account password");
            eprintln!("  AUTODARTS_CLIENT_ID           - OpenID client id");
            eprintln!("  AUTODARTS_CLIENT_SECRET       - OpenID client secret");
            eprintln!("  AUTODARTS_BOARD_ID            - Board whose matches are relayed");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  AUTODARTS_WEBSOCKET_URL       - Vendor endpoint (default: wss://api.autodarts.io/ms/v0/subscribe)");
            eprintln!("  AUTODARTS_TOKEN_URL           - Token endpoint (default: Autodarts Keycloak)");
            eprintln!("  HOST                          - HTTP listen address (default: 0.0.0.0)");
            eprintln!("  PORT                          - HTTP server port (default: 8080)");
            eprintln!("  RELAY_RECONNECT_BASE_MS       - First reconnect delay (default: 500)");
            eprintln!("  RELAY_RECONNECT_MAX_MS        - Largest reconnect delay (default: 30000)");
            eprintln!("  RELAY_RECONNECT_MAX_ATTEMPTS  - Give up after this many failures (default: never)");
            eprintln!("  RELAY_MATCH_IDLE_TIMEOUT_SECS - Abandon a silent match, 0 disables (default: 1800)");
            eprintln!("  RELAY_KEEPALIVE_SECS          - Ping interval, 0 disables (default: 30)");
            eprintln!("  RELAY_PONG_TIMEOUT_SECS       - Ping reply deadline, 0 disables (default: 10)");
            eprintln!("  RUST_LOG                      - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        board_id = %config.board_id,
        websocket_url = %config.websocket_url,
        address = %config.bind_addr(),
        "dartrelay server starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, operator_error = err.is_operator_error(), "Server stopped");
            ExitCode::from(1)
        }
    }
}

/// Wires the feed to the HTTP server and runs both until shutdown.
async fn run(config: Config) -> Result<(), ServerError> {
    let authenticator = KeycloakAuthenticator::new(config.token_url.clone(), config.credentials())?;
    let tokens = Arc::new(TokenProvider::new(authenticator));

    // Bad credentials should stop startup, not turn into an endless reconnect loop
    tokens.token().await?;
    let refresh_handle = tokens.spawn_refresh_task(TOKEN_REFRESH_INTERVAL);

    let store = LatestStateStore::new();
    let health = Arc::new(FeedHealth::new());
    let broadcaster = RoundBroadcaster::new();
    let publisher_handle = spawn_publisher(&store, broadcaster.clone());

    let connection = FeedConnection::new(
        config.websocket_url.clone(),
        Arc::clone(&tokens),
        Arc::clone(&health),
    )
    .with_policy(config.reconnect_policy())
    .with_keepalive(config.keepalive)
    .with_pong_timeout(config.pong_timeout);

    let mut relay_config = RelayConfig::new(config.board_id.clone());
    relay_config.match_idle_timeout = config.match_idle_timeout;
    let relay_grace = relay_config.shutdown_grace;
    let relay = Relay::new(connection, relay_config, store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_handle = {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = relay.run(shutdown_rx).await;
            // Take the HTTP server down with the feed
            shutdown_tx.send_replace(true);
            result
        })
    };

    let app = create_router(AppState::new(store, broadcaster, health));

    let addr = config.bind_addr();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(address = %addr, "Server listening");
            listener
        }
        Err(err) => {
            shutdown_tx.send_replace(true);
            refresh_handle.abort();
            return Err(ServerError::bind(addr, err));
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));

    info!("Server ready to accept connections");

    let served = server.into_future().await.map_err(ServerError::Serve);

    info!("HTTP server stopped, waiting for relay");
    let relay_result = match tokio::time::timeout(relay_grace + RELAY_JOIN_SLACK, relay_handle).await {
        Ok(Ok(result)) => result.map_err(ServerError::from),
        Ok(Err(join_err)) => {
            error!(error = %join_err, "Relay task failed");
            Ok(())
        }
        Err(_) => {
            warn!("Relay did not stop in time");
            Ok(())
        }
    };

    refresh_handle.abort();
    publisher_handle.abort();

    served.and(relay_result)
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when the process should stop, and tells the relay to stop.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
/// - The relay ending on its own
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let mut stopped = shutdown.subscribe();
    let feed_stopped = async move {
        loop {
            let stop = *stopped.borrow_and_update();
            if stop || stopped.changed().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = feed_stopped => {
            warn!("Feed relay stopped, shutting down HTTP server");
        }
    }

    shutdown.send_replace(true);
}
