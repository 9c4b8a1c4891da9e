// src/connection/registry.rs
use super::handle::{ConnectionHandle, ConnectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Set of live connections, shared by the accept loop, every handler task and
/// the shutdown path.
///
/// Each operation takes the lock once and does a single set edit, so add,
/// remove and drain are atomic with respect to each other. The registry
/// never touches sockets; whoever drains it is responsible for closing what
/// it gets back.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out an id that no other connection of this registry will get.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Insert `handle`. Returns `false` and keeps the existing entry if the
    /// id is already registered.
    pub fn add(&self, handle: ConnectionHandle) -> bool {
        let mut connections = self.connections.lock();
        if connections.contains_key(&handle.id()) {
            return false;
        }
        connections.insert(handle.id(), handle);
        true
    }

    /// Remove `id` if present. A drain may have taken it already, in which
    /// case this is a no-op returning `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.lock().remove(&id)
    }

    /// Take every registered handle and leave the registry empty.
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        let taken = std::mem::take(&mut *self.connections.lock());
        taken.into_values().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
