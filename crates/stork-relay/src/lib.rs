//! # stork-relay
//!
//! Signaling relay for Stork peers.
//!
//! The relay keeps one piece of state, a map from self-asserted peer
//! identity to live WebSocket connection, and routes JSON frames by their
//! target identity. It never stores or inspects message bodies. The same
//! listener answers `GET /` and `GET /health` for liveness checks.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod router;

pub use api::{build_router, serve, serve_listener, AppState};
pub use config::RelayConfig;
