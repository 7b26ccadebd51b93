use crate::error::WormholeError;
use crate::metrics::{counters, gauges, histograms};
use crate::ratelimit::RateLimiter;
use crate::registry::ConnHandle;
use crate::router::Disposition;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use wormhole_common::envelope::error_envelope;
use wormhole_common::types::{close_reason, error_message};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Accepted, may send, cannot be addressed yet.
    Open,
    /// Holds a binding and can receive routed frames.
    Bound,
    /// Terminal; the registry no longer knows this connection.
    Closed,
}

/// Why the message loop ended.
#[derive(Debug)]
enum Exit {
    /// Remote sent a close frame or the stream ended.
    Remote,
    /// The server decided to close the connection.
    Terminate {
        label: &'static str,
        reason: Cow<'static, str>,
    },
}

/// Reservation against the global and per-IP connection limits.
///
/// Released on drop.
pub(crate) struct ConnectionSlot {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl ConnectionSlot {
    /// Reserve a slot for a connection from `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`WormholeError::LimitReached`] naming the limit that was hit.
    pub(crate) fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Result<Self, WormholeError> {
        let previous = state.active_connections.fetch_add(1, Ordering::AcqRel);
        if previous >= state.config.max_conns {
            state.active_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(WormholeError::LimitReached("max_conns"));
        }

        // Entry API keeps the check and the increment under one shard lock.
        let mut should_reject = false;
        match state.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    should_reject = true;
                } else {
                    *entry.get_mut() += 1;
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }

        if should_reject {
            state.active_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(WormholeError::LimitReached("max_conns_ip"));
        }

        Ok(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Refuse upgrade requests for any path other than the configured one.
fn check_path(req: &Request, resp: Response, path: &str) -> Result<Response, ErrorResponse> {
    if req.uri().path() == path {
        return Ok(resp);
    }
    let mut err = ErrorResponse::new(Some("not found".to_string()));
    *err.status_mut() = StatusCode::NOT_FOUND;
    Err(err)
}

/// Serve one client from WebSocket upgrade to close.
///
/// Whatever ends the connection, its binding is removed before this returns.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    _slot: ConnectionSlot,
) -> Result<(), WormholeError> {
    let limit = state.config.transport_limit();
    let ws_config = WebSocketConfig {
        max_message_size: Some(limit),
        max_frame_size: Some(limit),
        ..WebSocketConfig::default()
    };

    let path = state.config.path.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| check_path(req, resp, &path),
        Some(ws_config),
    )
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<String>(state.config.send_queue);
    let handle = ConnHandle::new(deliver_tx);
    let mut link = LinkState::Open;

    gauges::inc_connections_active();
    debug!(conn = %handle.id, peer = %peer_addr, "connection open");

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &state,
        &handle,
        &mut link,
    )
    .await;

    let identifier = state.router.registry().unregister(handle.id);
    if identifier.is_some() {
        gauges::dec_bindings_active();
    }
    gauges::dec_connections_active();
    let last_state = std::mem::replace(&mut link, LinkState::Closed);
    debug!(
        conn = %handle.id,
        peer = %peer_addr,
        id = identifier.as_deref().unwrap_or("-"),
        state = ?last_state,
        lifetime_ms = handle.connected_at.elapsed().as_millis() as u64,
        "connection closed"
    );

    match result {
        Ok(Exit::Remote) => {
            counters::connections_closed_total("remote");
            Ok(())
        }
        Ok(Exit::Terminate { label, reason }) => {
            counters::connections_closed_total(label);
            debug!(conn = %handle.id, %reason, "closing connection");
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason,
            };
            if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                debug!(conn = %handle.id, "failed to send close frame: {}", e);
            }
            Ok(())
        }
        Err(e) => {
            counters::connections_closed_total("error");
            Err(e)
        }
    }
}

/// Drive the select loop for one connection until it must close.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<String>,
    state: &ServerState,
    handle: &ConnHandle,
    link: &mut LinkState,
) -> Result<Exit, WormholeError> {
    let mut rate_limiter = RateLimiter::new(state.config.msg_rate, state.config.bw_rate);
    let period = Duration::from_secs(state.config.ping_interval);
    let mut keepalive = interval_at(Instant::now() + period, period);
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    // Transport ping/pong does not count as activity.
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        let start = Instant::now();
                        let disposition = match rate_limiter.check(text.len()) {
                            Ok(()) => state.router.handle_text(handle, &text),
                            Err(exceeded) => {
                                counters::messages_dropped_total(exceeded.label());
                                Disposition::Reply(error_envelope(error_message::RATE_LIMITED))
                            }
                        };
                        match disposition {
                            Disposition::Done => {
                                histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
                            }
                            Disposition::Bound => {
                                // The registry refuses a second binding.
                                debug_assert_eq!(*link, LinkState::Open);
                                *link = LinkState::Bound;
                            }
                            Disposition::Reply(frame) => {
                                ws_tx.send(Message::Text(frame)).await?;
                            }
                            Disposition::Close(reason) => {
                                return Ok(Exit::Terminate { label: "protocol", reason });
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        return Ok(Exit::Terminate {
                            label: "protocol",
                            reason: Cow::Borrowed(close_reason::BINARY_FRAME),
                        });
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!(conn = %handle.id, "failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::Remote),
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(WormholeError::WebSocket(e)),
                }
            }
            Some(frame) = deliver_rx.recv() => {
                last_activity = Instant::now();
                counters::payload_bytes_total("out", frame.len() as u64);
                ws_tx.send(Message::Text(frame)).await?;
            }
            _ = keepalive.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(conn = %handle.id, "idle timeout reached");
                    return Ok(Exit::Terminate {
                        label: "idle",
                        reason: Cow::Borrowed(close_reason::IDLE_TIMEOUT),
                    });
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!(conn = %handle.id, "failed to send ping: {}", e);
                }
            }
        }
    }
}
