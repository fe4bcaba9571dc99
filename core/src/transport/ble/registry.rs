// Device connection registry
//
// Maps each device address to its shared connection state and the number of
// open sockets referencing it. All table operations run under one lock; a
// condition variable signals entry removal to sockets waiting on teardown.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::address::DeviceAddress;
use super::state::SharedConnectionState;

static SHARED_REGISTRY: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();

struct RegistryEntry {
    state: Arc<SharedConnectionState>,
    ref_count: usize,
}

/// Per-address serialization of connect attempts and writes
#[derive(Default)]
pub struct DeviceLocks {
    pub(crate) connect: Mutex<()>,
    pub(crate) write: Mutex<()>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    entries: Mutex<HashMap<DeviceAddress, RegistryEntry>>,
    removed: Condvar,
    locks: Mutex<HashMap<DeviceAddress, Arc<DeviceLocks>>>,
}

impl DeviceRegistry {
    /// Create an isolated registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by every connector that does not supply its own
    pub fn shared() -> Arc<DeviceRegistry> {
        SHARED_REGISTRY
            .get_or_init(|| Arc::new(DeviceRegistry::new()))
            .clone()
    }

    /// Return the state for `address`, creating an empty one if absent.
    pub fn find_or_create(&self, address: &DeviceAddress) -> Arc<SharedConnectionState> {
        let mut entries = self.entries.lock();
        entries
            .entry(address.clone())
            .or_insert_with(|| {
                debug!("Registry: creating connection state for {}", address);
                RegistryEntry {
                    state: Arc::new(SharedConnectionState::new(address.clone())),
                    ref_count: 0,
                }
            })
            .state
            .clone()
    }

    pub fn find(&self, address: &DeviceAddress) -> Option<Arc<SharedConnectionState>> {
        self.entries.lock().get(address).map(|e| e.state.clone())
    }

    /// Increment the reference count. Returns the new count, or 0 if no entry exists.
    pub fn increment_ref(&self, address: &DeviceAddress) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(address) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.ref_count
            }
            None => {
                warn!("Registry: increment for unknown device {}", address);
                0
            }
        }
    }

    /// Decrement the reference count, saturating at zero. Returns the new count.
    ///
    /// Reaching zero does not tear anything down; the caller owns teardown.
    pub fn decrement_ref(&self, address: &DeviceAddress) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(address) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count
            }
            None => 0,
        }
    }

    pub fn reference_count(&self, address: &DeviceAddress) -> usize {
        self.entries.lock().get(address).map_or(0, |e| e.ref_count)
    }

    pub fn remove(&self, address: &DeviceAddress) -> Option<Arc<SharedConnectionState>> {
        let removed = self.entries.lock().remove(address).map(|e| e.state);
        if removed.is_some() {
            debug!("Registry: removed connection state for {}", address);
            self.removed.notify_all();
            self.prune_locks(address);
        }
        removed
    }

    /// Remove the entry only if it still holds `state`.
    pub fn remove_state(&self, address: &DeviceAddress, state: &Arc<SharedConnectionState>) -> bool {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(address)
            .is_some_and(|e| Arc::ptr_eq(&e.state, state));
        if matches {
            entries.remove(address);
            drop(entries);
            debug!("Registry: removed connection state for {}", address);
            self.removed.notify_all();
            self.prune_locks(address);
        }
        matches
    }

    /// Replace the state for `address` with a fresh one, keeping the reference count.
    pub fn reset(&self, address: &DeviceAddress) -> Arc<SharedConnectionState> {
        let fresh = Arc::new(SharedConnectionState::new(address.clone()));
        let mut entries = self.entries.lock();
        let ref_count = entries.get(address).map_or(0, |e| e.ref_count);
        entries.insert(
            address.clone(),
            RegistryEntry {
                state: fresh.clone(),
                ref_count,
            },
        );
        drop(entries);
        debug!("Registry: reset stale connection state for {}", address);
        self.removed.notify_all();
        fresh
    }

    /// Block until `state` is no longer registered for `address`.
    ///
    /// Returns `false` if it is still registered when `timeout` elapses.
    pub fn wait_removed(
        &self,
        address: &DeviceAddress,
        state: &Arc<SharedConnectionState>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            let present = entries
                .get(address)
                .is_some_and(|e| Arc::ptr_eq(&e.state, state));
            if !present {
                return true;
            }
            if self.removed.wait_until(&mut entries, deadline).timed_out() {
                return !entries
                    .get(address)
                    .is_some_and(|e| Arc::ptr_eq(&e.state, state));
            }
        }
    }

    /// Connect and write locks for `address`.
    ///
    /// Hand the `Arc` back through [`release_locks`](Self::release_locks) when
    /// done so the table does not keep one entry per address ever used.
    pub fn device_locks(&self, address: &DeviceAddress) -> Arc<DeviceLocks> {
        self.locks.lock().entry(address.clone()).or_default().clone()
    }

    pub fn release_locks(&self, address: &DeviceAddress, locks: Arc<DeviceLocks>) {
        drop(locks);
        self.prune_locks(address);
    }

    /// Drop the lock object for `address` once nobody holds it and no entry remains.
    fn prune_locks(&self, address: &DeviceAddress) {
        // Lock order: locks table, then entries.
        let mut locks = self.locks.lock();
        let unused = locks
            .get(address)
            .is_some_and(|l| Arc::strong_count(l) == 1);
        if unused && !self.entries.lock().contains_key(address) {
            locks.remove(address);
            debug!("Registry: released locks for {}", address);
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_table_len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::parse(s).expect("valid address")
    }

    #[test]
    fn test_find_or_create_returns_same_state() {
        let registry = DeviceRegistry::new();
        let a = addr("AA:BB:CC:DD:EE:FF");

        let first = registry.find_or_create(&a);
        let second = registry.find_or_create(&addr("aa-bb-cc-dd-ee-ff"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reference_count(&a), 0);
    }

    #[test]
    fn test_reference_counting() {
        let registry = DeviceRegistry::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        registry.find_or_create(&a);

        assert_eq!(registry.increment_ref(&a), 1);
        assert_eq!(registry.increment_ref(&a), 2);
        assert_eq!(registry.decrement_ref(&a), 1);
        assert_eq!(registry.decrement_ref(&a), 0);
        assert_eq!(registry.decrement_ref(&a), 0);
        assert!(registry.find(&a).is_some());
    }

    #[test]
    fn test_unknown_device() {
        let registry = DeviceRegistry::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        assert!(registry.find(&a).is_none());
        assert_eq!(registry.increment_ref(&a), 0);
        assert_eq!(registry.decrement_ref(&a), 0);
        assert!(registry.remove(&a).is_none());
    }

    #[test]
    fn test_remove_state_checks_identity() {
        let registry = DeviceRegistry::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        let stale = registry.find_or_create(&a);
        registry.increment_ref(&a);

        let fresh = registry.reset(&a);
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(registry.reference_count(&a), 1);

        assert!(!registry.remove_state(&a, &stale));
        assert!(registry.find(&a).is_some());
        assert!(registry.remove_state(&a, &fresh));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wait_removed() {
        let registry = Arc::new(DeviceRegistry::new());
        let a = addr("AA:BB:CC:DD:EE:FF");
        let state = registry.find_or_create(&a);

        assert!(!registry.wait_removed(&a, &state, Duration::from_millis(20)));

        let remover = {
            let registry = registry.clone();
            let a = a.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.remove(&a);
            })
        };
        assert!(registry.wait_removed(&a, &state, Duration::from_secs(5)));
        remover.join().expect("remover thread");
    }

    #[test]
    fn test_concurrent_find_or_create() {
        let registry = Arc::new(DeviceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let a = addr("AA:BB:CC:DD:EE:FF");
                    let state = registry.find_or_create(&a);
                    registry.increment_ref(&a);
                    state
                })
            })
            .collect();

        let states: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("worker thread"))
            .collect();
        assert!(states.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.reference_count(&addr("AA:BB:CC:DD:EE:FF")), 8);
    }

    #[test]
    fn test_device_locks_shared_per_address() {
        let registry = DeviceRegistry::new();
        let a = registry.device_locks(&addr("AA:BB:CC:DD:EE:FF"));
        let b = registry.device_locks(&addr("aabbccddeeff"));
        let c = registry.device_locks(&addr("11:22:33:44:55:66"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_lock_table_pruned_when_unused() {
        let registry = DeviceRegistry::new();
        let a = addr("AA:BB:CC:DD:EE:FF");

        for i in 0..50u8 {
            let other = addr(&format!("11:22:33:44:55:{:02X}", i));
            let locks = registry.device_locks(&other);
            registry.release_locks(&other, locks);
        }
        assert_eq!(registry.lock_table_len(), 0);

        let held = registry.device_locks(&a);
        registry.find_or_create(&a);
        let again = registry.device_locks(&a);
        registry.release_locks(&a, again);
        assert_eq!(registry.lock_table_len(), 1, "entry still registered");

        registry.remove(&a);
        assert_eq!(registry.lock_table_len(), 1, "lock object still held");

        registry.release_locks(&a, held);
        assert_eq!(registry.lock_table_len(), 0);
    }
}
