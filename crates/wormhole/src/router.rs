use crate::config::{DuplicatePolicy, ServerConfig};
use crate::error::RegisterError;
use crate::metrics::{counters, gauges};
use crate::registry::{ConnHandle, Registry};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};
use wormhole_common::envelope::{error_envelope, exceeds_limit};
use wormhole_common::types::{close_reason, error_message};
use wormhole_common::Envelope;

/// What the sender's connection task must do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to send back.
    Done,
    /// Registration succeeded; the connection is now a possible destination.
    Bound,
    /// Send this frame back to the sender.
    Reply(String),
    /// Close the sender with a normal closure and this reason.
    Close(Cow<'static, str>),
}

/// Turns inbound frames into registry updates and forwards.
///
/// Holds no per-connection state; one router is shared by every connection
/// task.
#[derive(Debug)]
pub struct Router {
    registry: Arc<Registry>,
    max_frame_chars: usize,
    duplicate_policy: DuplicatePolicy,
}

impl Router {
    /// Create a router over `registry` using the limits and policy in `config`.
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: &ServerConfig) -> Self {
        Self {
            registry,
            max_frame_chars: config.max_frame_chars,
            duplicate_policy: config.duplicate_registration,
        }
    }

    /// The registry this router resolves destinations against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one text frame received on `sender`.
    ///
    /// Forwards never wait on the destination: a full or closed outbound
    /// queue drops the frame.
    pub fn handle_text(&self, sender: &ConnHandle, text: &str) -> Disposition {
        if exceeds_limit(text, self.max_frame_chars) {
            counters::messages_dropped_total("oversize");
            debug!(conn = %sender.id, len = text.len(), "frame exceeds size limit");
            return Disposition::Reply(error_envelope(error_message::MESSAGE_TOO_BIG));
        }

        let envelope = Envelope::classify(text);
        trace!(conn = %sender.id, kind = envelope.kind(), "classified frame");
        match envelope {
            Envelope::Ping => Disposition::Reply(text.to_owned()),
            Envelope::Register(id) => self.register(sender, &id),
            Envelope::Route { to } => self.forward(sender, &to, text),
            Envelope::Malformed(reason) => {
                debug!(conn = %sender.id, %reason, "malformed frame");
                Disposition::Close(Cow::Owned(reason.to_string()))
            }
        }
    }

    fn register(&self, sender: &ConnHandle, id: &str) -> Disposition {
        match self.registry.register(sender, id) {
            Ok(()) => {
                counters::registrations_total("bound");
                gauges::inc_bindings_active();
                info!(conn = %sender.id, id, "registered");
                Disposition::Bound
            }
            Err(RegisterError::AlreadyBound { existing }) => {
                counters::registrations_total("duplicate");
                warn!(
                    conn = %sender.id,
                    existing = %existing,
                    requested = id,
                    policy = ?self.duplicate_policy,
                    "duplicate registration"
                );
                match self.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        Disposition::Reply(error_envelope(error_message::ALREADY_REGISTERED))
                    }
                    DuplicatePolicy::Close => {
                        if self.registry.unregister(sender.id).is_some() {
                            gauges::dec_bindings_active();
                        }
                        Disposition::Close(Cow::Borrowed(close_reason::ALREADY_REGISTERED))
                    }
                }
            }
        }
    }

    fn forward(&self, sender: &ConnHandle, to: &str, text: &str) -> Disposition {
        let candidates = self.registry.resolve(to, Some(sender.id));
        let Some((dest, others)) = candidates.split_first() else {
            counters::messages_dropped_total("offline");
            debug!(conn = %sender.id, to, "destination not connected");
            return Disposition::Reply(error_envelope(error_message::PEER_NOT_CONNECTED));
        };

        if !others.is_empty() {
            counters::ambiguous_routes_total();
            warn!(
                conn = %sender.id,
                to,
                candidates = candidates.len(),
                chosen = %dest.id,
                "identifier bound by several connections, using oldest registration"
            );
        }

        match dest.tx.try_send(text.to_owned()) {
            Ok(()) => {
                counters::messages_relayed_total();
                counters::payload_bytes_total("in", text.len() as u64);
            }
            Err(TrySendError::Full(_)) => {
                counters::messages_dropped_total("backpressure");
                debug!(conn = %sender.id, dest = %dest.id, "destination queue full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                counters::messages_dropped_total("closed");
                debug!(conn = %sender.id, dest = %dest.id, "destination closing, dropping");
            }
        }
        Disposition::Done
    }
}
