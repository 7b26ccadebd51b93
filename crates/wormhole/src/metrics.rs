use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state; starts out ready.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the metrics HTTP
/// server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Returns 200 while accepting connections, 503 once draining.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection and binding gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("wormhole_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("wormhole_connections_active").decrement(1.0);
    }

    /// Increment the bound connections gauge.
    pub fn inc_bindings_active() {
        metrics::gauge!("wormhole_bindings_active").increment(1.0);
    }

    /// Decrement the bound connections gauge.
    pub fn dec_bindings_active() {
        metrics::gauge!("wormhole_bindings_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a registration attempt with the given status label.
    pub fn registrations_total(status: &'static str) {
        metrics::counter!("wormhole_registrations_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("wormhole_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("wormhole_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the counter of routes that matched more than one connection.
    pub fn ambiguous_routes_total() {
        metrics::counter!("wormhole_ambiguous_routes_total").increment(1);
    }

    /// Record a connection closure with the given reason label.
    pub fn connections_closed_total(reason: &'static str) {
        metrics::counter!("wormhole_connections_closed_total", "reason" => reason).increment(1);
    }

    /// Record bytes relayed in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("wormhole_payload_bytes_total", "direction" => direction)
            .increment(bytes);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a relay latency observation in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("wormhole_relay_latency_seconds").record(value);
    }
}
