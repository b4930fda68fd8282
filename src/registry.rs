//! Registry of connections currently held by a handler.
//!
//! Each entry tracks the peer, when the connection was accepted, and which
//! stage of its lifecycle it is in. Entries are removed by dropping the
//! returned `ConnGuard`, so a cancelled handler still releases its slot.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Current stage of a handled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading the request.
    Reading,
    /// Running the service.
    Working,
    /// Writing the response.
    Writing,
    /// Shutting the socket down.
    Closing,
}

/// A single in-flight connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: SocketAddr,
    pub accepted_at: Instant,
    pub state: ConnState,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(peer: SocketAddr, accepted_at: Instant) -> Self {
        Self {
            peer,
            accepted_at,
            state: ConnState::Reading,
        }
    }
}

#[derive(Debug)]
struct Inner {
    connections: Slab<Connection>,
    peak: usize,
    handled: u64,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert and remove. Insertion fails once `capacity`
/// entries are live.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                connections: Slab::with_capacity(capacity),
                peak: 0,
                handled: 0,
            }),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a holder panicked; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a connection, returning a guard that removes it on drop.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(self: &Arc<Self>, conn: Connection) -> Option<ConnGuard> {
        let mut inner = self.lock();
        if inner.connections.len() >= self.capacity {
            return None;
        }
        let id = inner.connections.insert(conn);
        inner.peak = inner.peak.max(inner.connections.len());
        Some(ConnGuard {
            registry: Arc::clone(self),
            id,
        })
    }

    fn remove(&self, id: usize) {
        let mut inner = self.lock();
        if inner.connections.try_remove(id).is_some() {
            inner.handled += 1;
        }
    }

    fn set_state(&self, id: usize, state: ConnState) {
        if let Some(conn) = self.lock().connections.get_mut(id) {
            conn.state = state;
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest number of simultaneously active connections seen.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Connections that have been released after handling.
    pub fn handled(&self) -> u64 {
        self.lock().handled
    }

    /// Copy of the active connections.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock()
            .connections
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect()
    }
}

/// Slot in the registry held for the lifetime of one handler.
#[derive(Debug)]
pub struct ConnGuard {
    registry: Arc<ConnectionRegistry>,
    id: usize,
}

impl ConnGuard {
    /// Record the stage the connection has reached.
    pub fn set_state(&self, state: ConnState) {
        self.registry.set_state(self.id, state);
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
