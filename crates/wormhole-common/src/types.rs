//! Core type definitions and protocol constants for the wormhole relay.

/// A client-chosen opaque string used to address a connection.
pub type Identifier = String;

/// Default maximum frame length in characters (50 KiB of hex-encoded data).
pub const DEFAULT_MAX_FRAME_CHARS: usize = 2 * 50 * 1024;

/// Envelope keys recognized by the relay, in classification order.
pub mod key {
    /// Keepalive marker; the frame is echoed back verbatim.
    pub const PING: &str = "ping";
    /// Binds the sending connection to an identifier.
    pub const REGISTER: &str = "register";
    /// Names the destination identifier of a routed message.
    pub const TO: &str = "to";
    /// Error reports sent from relay to client.
    pub const ERROR: &str = "error";
}

/// Messages carried in `{"error": ...}` envelopes from relay to client.
pub mod error_message {
    /// Frame exceeded the configured size limit.
    pub const MESSAGE_TOO_BIG: &str = "Message too big";
    /// No other connection is bound to the destination identifier.
    pub const PEER_NOT_CONNECTED: &str = "Peer is not connected";
    /// The connection already holds a binding.
    pub const ALREADY_REGISTERED: &str = "Already registered";
    /// Sender exceeded its message or bandwidth allowance.
    pub const RATE_LIMITED: &str = "Rate limited";
}

/// Reason strings attached to normal-closure (1000) close frames.
pub mod close_reason {
    /// Connection saw no application traffic within the idle window.
    pub const IDLE_TIMEOUT: &str = "Idle timeout";
    /// Connection attempted a second registration under the `close` policy.
    pub const ALREADY_REGISTERED: &str = "Already registered";
    /// Binary frames are not part of the envelope protocol.
    pub const BINARY_FRAME: &str = "Binary frames are not supported";
}
