//! Envelope classification and construction.
//!
//! Every client frame is a UTF-8 JSON object. The relay only looks at three
//! top-level keys to decide what to do with it; everything else is opaque
//! payload that is forwarded untouched.
//!
//! Keys are checked in a fixed order (`ping`, `register`, `to`) and the first
//! key present decides the shape of the frame.

use crate::types::{key, Identifier};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reasons a frame cannot be classified.
///
/// The `Display` text doubles as the close reason sent to the client.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Frame was empty or whitespace only.
    #[error("Empty frame")]
    Empty,
    /// Frame is not valid JSON.
    #[error("Invalid json")]
    InvalidJson,
    /// Frame is valid JSON but not an object.
    #[error("Envelope must be a JSON object")]
    NotAnObject,
    /// A recognized key carries something other than a non-empty string.
    #[error("Field `{0}` must be a non-empty string")]
    InvalidField(&'static str),
    /// Object carries none of the recognized keys.
    #[error("Unrecognized envelope")]
    Unrecognized,
}

/// A classified client frame.
///
/// `Route` does not carry the frame itself: callers already hold the original
/// text and must forward that, never a re-encoding of the parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Keepalive; echoed back unmodified.
    Ping,
    /// Bind the sending connection to this identifier.
    Register(Identifier),
    /// Forward the frame to the connection bound to `to`.
    Route {
        /// Destination identifier.
        to: Identifier,
    },
    /// Frame matches no recognized shape.
    Malformed(EnvelopeError),
}

impl Envelope {
    /// Classify a text frame.
    ///
    /// Never fails: anything that is not a recognized shape comes back as
    /// [`Envelope::Malformed`] with the reason.
    #[must_use]
    pub fn classify(text: &str) -> Self {
        match parse_object(text) {
            Ok(object) => classify_object(&object),
            Err(e) => Self::Malformed(e),
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Register(_) => "register",
            Self::Route { .. } => "route",
            Self::Malformed(_) => "malformed",
        }
    }
}

fn parse_object(text: &str) -> Result<Map<String, Value>, EnvelopeError> {
    if text.trim().is_empty() {
        return Err(EnvelopeError::Empty);
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(EnvelopeError::NotAnObject),
        Err(_) => Err(EnvelopeError::InvalidJson),
    }
}

fn classify_object(object: &Map<String, Value>) -> Envelope {
    if object.contains_key(key::PING) {
        return Envelope::Ping;
    }
    if let Some(value) = object.get(key::REGISTER) {
        return match identifier(value) {
            Some(id) => Envelope::Register(id),
            None => Envelope::Malformed(EnvelopeError::InvalidField(key::REGISTER)),
        };
    }
    if let Some(value) = object.get(key::TO) {
        return match identifier(value) {
            Some(to) => Envelope::Route { to },
            None => Envelope::Malformed(EnvelopeError::InvalidField(key::TO)),
        };
    }
    Envelope::Malformed(EnvelopeError::Unrecognized)
}

fn identifier(value: &Value) -> Option<Identifier> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Returns `true` if `text` is longer than `max_chars` characters.
///
/// Byte length bounds the character count from above, so the common case
/// never walks the string.
#[must_use]
pub fn exceeds_limit(text: &str, max_chars: usize) -> bool {
    text.len() > max_chars && text.chars().count() > max_chars
}

/// Build an `{"error": message}` envelope.
#[must_use]
pub fn error_envelope(message: &str) -> String {
    single_field(key::ERROR, Value::from(message))
}

/// Build a `{"register": id}` envelope.
#[must_use]
pub fn register_envelope(id: &str) -> String {
    single_field(key::REGISTER, Value::from(id))
}

/// Build a `{"ping": value}` envelope.
#[must_use]
pub fn ping_envelope(value: impl Into<Value>) -> String {
    single_field(key::PING, value.into())
}

fn single_field(name: &str, value: Value) -> String {
    let mut object = Map::with_capacity(1);
    object.insert(name.to_owned(), value);
    Value::Object(object).to_string()
}
