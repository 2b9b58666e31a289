use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::debug;

use crate::connection::Connection;
use crate::frame::MacAddr;

/// An entry in the MAC learning table.
#[derive(Clone)]
pub struct MacEntry {
    pub connection: Arc<Connection>,
    pub learned_at: Instant,
}

/// Concurrent MAC-to-connection learning table for one VLAN.
///
/// Forwarding-path lookups take the shared lock; learning, eviction and
/// aging take the exclusive lock, which also gives sweeps a consistent view.
/// No caller holds a guard across I/O: lookups clone the entry out.
pub struct MacTable {
    entries: RwLock<HashMap<MacAddr, MacEntry>>,
}

impl MacTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the entry for `mac`. Last write wins, so a MAC
    /// that moves between connections is followed on the next frame.
    pub fn learn(&self, mac: MacAddr, connection: &Arc<Connection>) {
        let entry = MacEntry {
            connection: Arc::clone(connection),
            learned_at: Instant::now(),
        };
        self.write().insert(mac, entry);
        debug!("Learned MAC {} on connection {}", mac, connection.id());
    }

    pub fn lookup(&self, mac: &MacAddr) -> Option<MacEntry> {
        self.read().get(mac).cloned()
    }

    pub fn remove(&self, mac: &MacAddr) -> bool {
        self.write().remove(mac).is_some()
    }

    /// Drop every entry bound to `connection_id`. Runs during connection
    /// cleanup, before the connection itself is released.
    pub fn evict_connection(&self, connection_id: &str) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.connection.id() != connection_id);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(
                "Removed {} MAC entries for connection {}",
                removed, connection_id
            );
        }
        removed
    }

    /// Remove entries not refreshed within `timeout`, plus any whose
    /// connection has closed.
    pub fn age(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            now.duration_since(entry.learned_at) <= timeout && !entry.connection.is_closed()
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<MacAddr, MacEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MacAddr, MacEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MacTable {
    fn default() -> Self {
        Self::new()
    }
}
