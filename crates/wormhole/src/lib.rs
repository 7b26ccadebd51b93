//! Wormhole relay server: a rendezvous WebSocket message router.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
mod ratelimit;
/// Two-way index between live connections and identifiers.
pub mod registry;
/// Per-frame routing decisions.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
