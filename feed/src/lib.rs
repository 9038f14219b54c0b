//! dartrelay feed - Autodarts live-round client.
//!
//! This crate holds everything between the vendor's WebSocket and the latest
//! round kept in memory:
//! - Obtaining and refreshing bearer tokens
//! - Keeping one connection open, with backoff and keepalive
//! - Following the board's active match through its subscriptions
//! - Storing the newest turn and notifying consumers
//!
//! # Architecture
//!
//! A single [`relay::Relay`] task owns the connection and the state machine
//! and is the only writer of the [`store::LatestStateStore`]. Everything
//! else reads the store or subscribes to it.

pub mod auth;
pub mod backoff;
pub mod connection;
pub mod error;
pub mod health;
pub mod keycloak;
pub mod machine;
pub mod protocol;
pub mod publish;
pub mod relay;
pub mod store;

pub use auth::{AccessToken, Authenticator, StaticAuthenticator, TokenProvider};
pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionState, FeedConnection, FeedEvent};
pub use error::{AuthError, ConnectError, FeedError, ProtocolError, SendError};
pub use health::{FeedHealth, FeedHealthSnapshot};
pub use keycloak::{Credentials, KeycloakAuthenticator};
pub use machine::{MachineState, SubscriptionStateMachine};
pub use protocol::{Command, InboundFrame, Round, Subscription};
pub use publish::{spawn_publisher, PublishSink};
pub use relay::{Relay, RelayConfig};
pub use store::{LatestStateStore, Snapshot};
