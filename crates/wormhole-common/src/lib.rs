//! Common types and utilities shared by wormhole relay clients and server.
//!
//! This crate provides:
//! - Envelope classification and construction ([`envelope`])
//! - Protocol constants and wire strings ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeError};
pub use types::Identifier;
