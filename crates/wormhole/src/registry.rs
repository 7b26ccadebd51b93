use crate::error::RegisterError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use wormhole_common::Identifier;

/// Process-unique identity of a live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle held in the registry, used to send frames to a connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Identity used for equality and self-exclusion.
    pub id: ConnId,
    /// Channel sender for delivering frames to this connection's task.
    pub tx: mpsc::Sender<String>,
    /// Instant when the connection was accepted.
    pub connected_at: Instant,
}

impl ConnHandle {
    /// Create a handle with a fresh id around an outbound queue sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnId::next(),
            tx,
            connected_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Binding {
    identifier: Identifier,
    seq: u64,
}

#[derive(Debug, Default)]
struct Tables {
    by_conn: HashMap<ConnId, Binding>,
    /// Registration sequence number → handle; iteration order is oldest first.
    by_id: HashMap<Identifier, BTreeMap<u64, ConnHandle>>,
    next_seq: u64,
}

/// Two-way index between connections and the identifiers they registered.
///
/// Both directions live behind one lock so no caller can observe a binding
/// that is present in one index and missing from the other. The lock is never
/// held across an await or a send: lookups hand back cloned handles.
#[derive(Debug, Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `conn` to `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::AlreadyBound`] if the connection already holds
    /// a binding. The existing binding is left unchanged.
    pub fn register(&self, conn: &ConnHandle, identifier: &str) -> Result<(), RegisterError> {
        let mut tables = self.lock();
        if let Some(existing) = tables.by_conn.get(&conn.id) {
            return Err(RegisterError::AlreadyBound {
                existing: existing.identifier.clone(),
            });
        }
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables
            .by_id
            .entry(identifier.to_owned())
            .or_default()
            .insert(seq, conn.clone());
        tables.by_conn.insert(
            conn.id,
            Binding {
                identifier: identifier.to_owned(),
                seq,
            },
        );
        Ok(())
    }

    /// Remove any binding held by `conn`, returning the identifier it had.
    ///
    /// Idempotent: unbound or unknown connections are a no-op.
    pub fn unregister(&self, conn: ConnId) -> Option<Identifier> {
        let mut tables = self.lock();
        let binding = tables.by_conn.remove(&conn)?;
        if let Some(conns) = tables.by_id.get_mut(&binding.identifier) {
            conns.remove(&binding.seq);
            if conns.is_empty() {
                tables.by_id.remove(&binding.identifier);
            }
        }
        Some(binding.identifier)
    }

    /// Connections bound to `identifier`, oldest registration first, never
    /// including `excluding`.
    #[must_use]
    pub fn resolve(&self, identifier: &str, excluding: Option<ConnId>) -> Vec<ConnHandle> {
        let tables = self.lock();
        tables
            .by_id
            .get(identifier)
            .map(|conns| {
                conns
                    .values()
                    .filter(|handle| Some(handle.id) != excluding)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identifier currently bound to `conn`, if any.
    #[must_use]
    pub fn identifier_of(&self, conn: ConnId) -> Option<Identifier> {
        self.lock()
            .by_conn
            .get(&conn)
            .map(|binding| binding.identifier.clone())
    }

    /// Point-in-time copy of every binding, ordered by connection id.
    ///
    /// Taken under the same lock as every mutation, so it always reflects a
    /// state that existed between two operations.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ConnId, Identifier)> {
        let tables = self.lock();
        let mut bindings: Vec<(ConnId, Identifier)> = tables
            .by_id
            .iter()
            .flat_map(|(identifier, conns)| {
                conns
                    .values()
                    .map(move |handle| (handle.id, identifier.clone()))
            })
            .collect();
        debug_assert_eq!(bindings.len(), tables.by_conn.len());
        bindings.sort_by_key(|(conn, _)| *conn);
        bindings
    }

    /// Number of bound connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_conn.len()
    }

    /// Returns `true` if no connection is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().by_conn.is_empty()
    }
}
