use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum WormholeError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The global or per-IP connection limit was reached.
    #[error("connection limit reached ({0})")]
    LimitReached(&'static str),
}

/// Errors returned by [`Registry::register`](crate::registry::Registry::register).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The connection already holds a binding; it is left untouched.
    #[error("connection already registered as {existing:?}")]
    AlreadyBound {
        /// Identifier the connection is currently bound to.
        existing: String,
    },
}
