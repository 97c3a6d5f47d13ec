use std::collections::HashMap;
use std::net::SocketAddrV4;

use parking_lot::Mutex;
use shared::types::ServerEntry;

/// Thread-safe map of address → entry, the single source of truth shared
/// by discovery, the poller, the master listener, and the janitor.
///
/// All entry mutation happens through this type while its lock is held.
/// Critical sections are CPU-bound map work only; the lock is never held
/// across network I/O or timers.
#[derive(Default)]
pub struct Registry {
    servers: Mutex<HashMap<SocketAddrV4, ServerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known servers.
    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `init()` under `addr` when absent, then runs `update` on the
    /// entry either way, all in one lock hold. Returns true when the entry
    /// was created.
    pub fn get_or_create(
        &self,
        addr: SocketAddrV4,
        init: impl FnOnce() -> ServerEntry,
        update: impl FnOnce(&mut ServerEntry),
    ) -> bool {
        let mut servers = self.servers.lock();
        let mut created = false;
        let entry = servers.entry(addr).or_insert_with(|| {
            created = true;
            init()
        });
        update(entry);
        created
    }

    /// Runs `mutate` on the entry, if present.
    pub fn update<R>(
        &self,
        addr: SocketAddrV4,
        mutate: impl FnOnce(&mut ServerEntry) -> R,
    ) -> Option<R> {
        self.servers.lock().get_mut(&addr).map(mutate)
    }

    /// Point-in-time copy of one entry.
    pub fn get(&self, addr: SocketAddrV4) -> Option<ServerEntry> {
        self.servers.lock().get(&addr).cloned()
    }

    /// Point-in-time copy of every entry. Mutating the result has no effect
    /// on the registry.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        self.servers.lock().values().cloned().collect()
    }

    /// Addresses whose entry currently satisfies `pred`, collected under
    /// the lock so the caller can visit them with the lock released.
    pub fn addrs_where(&self, pred: impl Fn(&ServerEntry) -> bool) -> Vec<SocketAddrV4> {
        self.servers
            .lock()
            .values()
            .filter(|e| pred(e))
            .map(|e| e.address)
            .collect()
    }

    pub fn remove(&self, addr: SocketAddrV4) -> bool {
        self.servers.lock().remove(&addr).is_some()
    }

    /// Removes the entry only when `pred` holds for it, atomically.
    pub fn remove_if(&self, addr: SocketAddrV4, pred: impl FnOnce(&ServerEntry) -> bool) -> bool {
        let mut servers = self.servers.lock();
        if servers.get(&addr).is_some_and(pred) {
            servers.remove(&addr);
            true
        } else {
            false
        }
    }

    /// Full sweep under the lock: keeps entries for which `keep` returns
    /// true. `keep` may mutate the entry in place.
    pub fn retain(&self, keep: impl FnMut(&SocketAddrV4, &mut ServerEntry) -> bool) {
        self.servers.lock().retain(keep);
    }
}
