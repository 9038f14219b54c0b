//! dartrelay server - serves the latest Autodarts round.
//!
//! This crate provides the HTTP side of the relay:
//! - Loading configuration from the environment
//! - Broadcasting each accepted round to WebSocket clients
//! - Answering `GET /round` and `GET /health`
//!
//! # Architecture
//!
//! The feed crate's relay task writes the latest round into a
//! [`LatestStateStore`](dartrelay_feed::LatestStateStore). A publisher task
//! forwards every update to the [`broadcast::RoundBroadcaster`], and the
//! routes read the store directly. Nothing is persisted.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod routes;
