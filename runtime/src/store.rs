//! The rendezvous store contract (spec §3, §6): an external, networked
//! key-value service used both by the transport to bootstrap a world and by
//! the [`crate::watchdog::Watchdog`] to exchange heartbeats.
//!
//! This module also ships [`InProcessStoreFactory`], a reference
//! implementation used by the test suite and demos. It fulfills the same
//! `get`/`set`/`add` contract a networked TCP store would without
//! introducing a new wire protocol, which spec.md's Non-goals explicitly
//! rule out for this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

/// A small, networked key-value service. Implementations must be safe to
/// call from a plain OS thread — the Watchdog never awaits a store call.
pub trait RendezvousStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    /// Atomically adds `delta` to the integer at `key` (0 if absent) and
    /// returns the updated value.
    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
}

/// Creates rendezvous stores bound to a `(host, port, participant count)`
/// triple. Kept distinct from [`RendezvousStore`] because construction is
/// where a real implementation dials the network and where rank 0 becomes
/// the store's leader (spec §4.1).
pub trait RendezvousStoreFactory: Send + Sync {
    fn connect(
        &self,
        addr: &str,
        port: u16,
        size: usize,
        is_leader: bool,
    ) -> Result<Arc<dyn RendezvousStore>, StoreError>;
}

/// A reference [`RendezvousStoreFactory`]: participants that `connect` to
/// the same `(addr, port)` share one in-process [`InProcessStore`].
#[derive(Default)]
pub struct InProcessStoreFactory {
    registry: Mutex<HashMap<(String, u16), Arc<InProcessStore>>>,
}

impl InProcessStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store already registered at `(addr, port)`, if any —
    /// used by tests to simulate a peer/network failure with
    /// [`InProcessStore::poison`] without going through `connect` again.
    pub fn existing(&self, addr: &str, port: u16) -> Option<Arc<InProcessStore>> {
        self.registry
            .lock()
            .unwrap()
            .get(&(addr.to_string(), port))
            .cloned()
    }
}

impl RendezvousStoreFactory for InProcessStoreFactory {
    fn connect(
        &self,
        addr: &str,
        port: u16,
        _size: usize,
        _is_leader: bool,
    ) -> Result<Arc<dyn RendezvousStore>, StoreError> {
        let mut registry = self.registry.lock().unwrap();
        let store = registry
            .entry((addr.to_string(), port))
            .or_insert_with(|| Arc::new(InProcessStore::default()))
            .clone();
        Ok(store as Arc<dyn RendezvousStore>)
    }
}

/// In-process rendezvous store: a shared key-value map guarded by a mutex.
#[derive(Default)]
pub struct InProcessStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    poisoned: AtomicBool,
}

impl InProcessStore {
    /// Simulates the store becoming unreachable (peer process killed,
    /// network partition): every call after this fails with
    /// [`StoreError::Unreachable`].
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    fn check_poisoned(&self) -> Result<(), StoreError> {
        if self.poisoned.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable("store poisoned".to_string()))
        } else {
            Ok(())
        }
    }
}

impl RendezvousStore for InProcessStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check_poisoned()?;
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_poisoned()?;
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.check_poisoned()?;
        let mut entries = self.entries.lock().unwrap();
        let current = entries
            .get(key)
            .map(|bytes| parse_i64(key, bytes))
            .transpose()?
            .unwrap_or(0);
        let updated = current + delta;
        entries.insert(key.to_string(), updated.to_string().into_bytes());
        Ok(updated)
    }
}

fn parse_i64(key: &str, bytes: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Unreachable(format!("corrupt counter at {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_from_zero() {
        let store = InProcessStore::default();
        assert_eq!(store.add("k", 1).unwrap(), 1);
        assert_eq!(store.add("k", 1).unwrap(), 2);
        assert_eq!(store.add("k", 5).unwrap(), 7);
    }

    #[test]
    fn poisoned_store_fails_everything() {
        let store = InProcessStore::default();
        store.set("k", b"1".to_vec()).unwrap();
        store.poison();
        assert!(store.get("k").is_err());
        assert!(store.add("k", 1).is_err());
        assert!(store.set("k", b"2".to_vec()).is_err());
    }

    #[test]
    fn factory_shares_store_per_address() {
        let factory = InProcessStoreFactory::new();
        let a = factory.connect("127.0.0.1", 29500, 2, true).unwrap();
        let b = factory.connect("127.0.0.1", 29500, 2, false).unwrap();
        a.set("x", b"1".to_vec()).unwrap();
        assert_eq!(b.get("x").unwrap(), b"1".to_vec());
    }
}
