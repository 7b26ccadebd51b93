use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use wormhole_common::types::DEFAULT_MAX_FRAME_CHARS;

/// What to do when a connection that already holds a binding registers again.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Reply with an error envelope and keep the existing binding.
    #[default]
    Reject,
    /// Drop the binding and close the connection.
    Close,
}

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "wormhole")]
#[command(about = "Rendezvous WebSocket relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:7070", env = "WORMHOLE_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "WORMHOLE_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Request path accepted for the WebSocket upgrade.
    #[arg(long, default_value = "/", env = "WORMHOLE_PATH")]
    pub path: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "WORMHOLE_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "64", env = "WORMHOLE_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum text frame length in characters.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_CHARS, env = "WORMHOLE_MAX_FRAME_CHARS")]
    pub max_frame_chars: usize,
    /// Maximum messages per minute per connection.
    #[arg(long, default_value = "600", env = "WORMHOLE_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    #[arg(long, default_value = "16777216", env = "WORMHOLE_BW_RATE")]
    pub bw_rate: u64,
    /// Interval between WebSocket pings and idle checks, in seconds.
    #[arg(long, default_value = "30", env = "WORMHOLE_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Close connections without application traffic for this many seconds.
    #[arg(long, default_value = "300", env = "WORMHOLE_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Outbound frames buffered per connection before forwards are dropped.
    #[arg(long, default_value = "256", env = "WORMHOLE_SEND_QUEUE")]
    pub send_queue: usize,
    /// Policy for a second registration on an already bound connection.
    #[arg(
        long,
        value_enum,
        default_value_t = DuplicatePolicy::Reject,
        env = "WORMHOLE_DUPLICATE_REGISTRATION"
    )]
    pub duplicate_registration: DuplicatePolicy,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Request path accepted for the WebSocket upgrade.
    pub path: String,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum text frame length in characters.
    pub max_frame_chars: usize,
    /// Maximum messages per minute per connection.
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    pub bw_rate: u64,
    /// Interval between WebSocket pings and idle checks, in seconds.
    pub ping_interval: u64,
    /// Idle timeout in seconds.
    pub idle_timeout: u64,
    /// Per-connection outbound queue capacity.
    pub send_queue: usize,
    /// Policy for a second registration on an already bound connection.
    pub duplicate_registration: DuplicatePolicy,
}

impl ServerConfig {
    /// Upper bound on `max_frame_chars`.
    pub const MAX_ALLOWED_FRAME_CHARS: usize = 4 * 1024 * 1024;

    /// Largest WebSocket message the transport will buffer.
    ///
    /// A character is at most four UTF-8 bytes, so every frame within
    /// `max_frame_chars` fits, and oversized frames up to this bound still get
    /// an error envelope instead of a transport failure.
    ///
    /// This is a hard ceiling: a message larger than this many bytes is
    /// refused by the WebSocket layer itself and the connection is dropped
    /// without a `Message too big` reply.
    #[must_use]
    pub fn transport_limit(&self) -> usize {
        self.max_frame_chars.saturating_mul(4).saturating_add(1024)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.starts_with('/') {
            return Err("path must start with '/'".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.max_frame_chars == 0 {
            return Err("max_frame_chars must be greater than 0".to_string());
        }
        if self.max_frame_chars > Self::MAX_ALLOWED_FRAME_CHARS {
            return Err(format!(
                "max_frame_chars exceeds maximum allowed ({} characters)",
                Self::MAX_ALLOWED_FRAME_CHARS
            ));
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 1_000_000 {
            return Err("msg_rate exceeds reasonable limit (1,000,000 msg/min)".to_string());
        }

        if self.bw_rate == 0 {
            return Err("bw_rate must be greater than 0".to_string());
        }
        if self.bw_rate > 100_000_000_000 {
            return Err("bw_rate exceeds reasonable limit (100 GB/min)".to_string());
        }
        if self.bw_rate < self.transport_limit() as u64 {
            return Err(format!(
                "bw_rate must allow at least one maximum-size frame ({} bytes)",
                self.transport_limit()
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.send_queue == 0 {
            return Err("send_queue must be greater than 0".to_string());
        }
        if self.send_queue > 65_536 {
            return Err("send_queue exceeds reasonable limit (65536 frames)".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            path: args.path,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_frame_chars: args.max_frame_chars,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            send_queue: args.send_queue,
            duplicate_registration: args.duplicate_registration,
        }
    }
}
