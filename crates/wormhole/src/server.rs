use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionSlot};
use crate::error::WormholeError;
use crate::registry::Registry;
use crate::router::Router;
use dashmap::DashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Frame router; owns the shared registry.
    pub router: Router,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Connections currently holding a slot.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Build server state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let router = Router::new(registry, &config);
        Self {
            config,
            router,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }
}

/// Run the accept loop until the process ends.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), WormholeError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Run the accept loop until `shutdown` completes.
///
/// After shutdown no new connections are accepted; in-flight connections get
/// up to 30 seconds to finish before the function returns.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: F,
) -> Result<(), WormholeError>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr()?;
    info!("server listening on {}", local_addr);
    tokio::pin!(shutdown);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let slot = match ConnectionSlot::acquire(&state, addr.ip()) {
                            Ok(slot) => slot,
                            Err(e) => {
                                warn!("rejecting {}: {}", addr, e);
                                drop(stream);
                                continue;
                            }
                        };
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, slot).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            // Reap finished connection tasks.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            () = &mut shutdown => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }
    drop(listener);

    let drain_timeout = Duration::from_secs(30);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("server shut down gracefully");
    Ok(())
}
