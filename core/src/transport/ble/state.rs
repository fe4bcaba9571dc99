//! Per-device shared connection state.
//!
//! One [`SharedConnectionState`] exists per physical printer. Caller threads
//! (sockets) and the platform callback thread both mutate it; every field
//! lives behind a single mutex, and a condition variable wakes blocked callers
//! whenever the event side changes something.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::address::DeviceAddress;
use super::gatt::{DEFAULT_MTU_SIZE, MTU_OFFSET};
use super::platform::RadioLink;
use crate::error::TransportError;

/// Connection lifecycle of one physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    ServicesDiscovering,
    /// Services resolved; waiting for bonding and the CCCD write to complete
    AwaitingBond,
    Ready,
    Disconnecting,
}

/// Result of a bounded wait on the shared state
#[derive(Debug, Clone)]
pub(crate) enum WaitOutcome {
    Ready,
    Failed(TransportError),
    TimedOut,
}

struct LinkInner {
    link: Option<Arc<dyn RadioLink>>,
    phase: ConnectionPhase,
    mtu: usize,
    mtu_negotiated: bool,
    waiting_for_mtu_change: bool,
    paired: bool,
    services_resolved: bool,
    first_write_performed: HashSet<Uuid>,
    read_buffers: HashMap<Uuid, Vec<u8>>,
    write_completion: HashMap<Uuid, bool>,
    failure: Option<TransportError>,
    closing: bool,
}

pub struct SharedConnectionState {
    address: DeviceAddress,
    inner: Mutex<LinkInner>,
    changed: Condvar,
}

impl SharedConnectionState {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            inner: Mutex::new(LinkInner {
                link: None,
                phase: ConnectionPhase::Disconnected,
                mtu: DEFAULT_MTU_SIZE - MTU_OFFSET,
                mtu_negotiated: false,
                waiting_for_mtu_change: false,
                paired: false,
                services_resolved: false,
                first_write_performed: HashSet::new(),
                read_buffers: HashMap::new(),
                write_completion: HashMap::new(),
                failure: None,
                closing: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    // ------------------------------------------------------------------------
    // Link handle and lifecycle
    // ------------------------------------------------------------------------

    pub fn link(&self) -> Option<Arc<dyn RadioLink>> {
        self.inner.lock().link.clone()
    }

    pub fn attach_link(&self, link: Arc<dyn RadioLink>) {
        self.inner.lock().link = Some(link);
        self.changed.notify_all();
    }

    /// Detach the link handle so its resources can be released.
    pub fn take_link(&self) -> Option<Arc<dyn RadioLink>> {
        self.inner.lock().link.take()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().phase
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        self.update(|inner| inner.phase = phase);
    }

    /// Mark the link as intentionally closing. Returns the phase it was in.
    pub fn begin_closing(&self) -> ConnectionPhase {
        let mut inner = self.inner.lock();
        let previous = inner.phase;
        inner.closing = true;
        if previous != ConnectionPhase::Disconnected {
            inner.phase = ConnectionPhase::Disconnecting;
        }
        drop(inner);
        self.changed.notify_all();
        previous
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Record a terminal failure. Only the first failure is kept.
    ///
    /// Returns `true` if this call recorded it.
    pub fn fail(&self, error: TransportError) -> bool {
        let mut inner = self.inner.lock();
        if inner.failure.is_some() {
            return false;
        }
        inner.failure = Some(error);
        drop(inner);
        self.changed.notify_all();
        true
    }

    pub fn failure(&self) -> Option<TransportError> {
        self.inner.lock().failure.clone()
    }

    pub fn mark_services_resolved(&self) {
        self.update(|inner| inner.services_resolved = true);
    }

    pub fn services_resolved(&self) -> bool {
        self.inner.lock().services_resolved
    }

    /// The notification subscription completed; the link is usable.
    pub fn mark_paired(&self) {
        self.update(|inner| {
            inner.paired = true;
            inner.phase = ConnectionPhase::Ready;
        });
    }

    pub fn is_paired(&self) -> bool {
        self.inner.lock().paired
    }

    pub(crate) fn wait_services_resolved(&self, timeout: Duration) -> WaitOutcome {
        self.wait_for(timeout, |inner| inner.services_resolved)
    }

    pub(crate) fn wait_paired(&self, timeout: Duration) -> WaitOutcome {
        self.wait_for(timeout, |inner| inner.paired)
    }

    // ------------------------------------------------------------------------
    // MTU
    // ------------------------------------------------------------------------

    pub fn mtu(&self) -> usize {
        self.inner.lock().mtu
    }

    /// Returns `true` exactly once per write characteristic.
    pub fn take_first_write(&self, characteristic: Uuid) -> bool {
        self.inner.lock().first_write_performed.insert(characteristic)
    }

    pub fn begin_mtu_request(&self) {
        self.inner.lock().waiting_for_mtu_change = true;
    }

    pub fn is_waiting_for_mtu(&self) -> bool {
        self.inner.lock().waiting_for_mtu_change
    }

    /// Apply an MTU completion. `payload` is `None` when negotiation failed.
    ///
    /// Ignored unless a request is outstanding and no value was applied yet.
    pub fn complete_mtu(&self, payload: Option<usize>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.waiting_for_mtu_change || inner.mtu_negotiated {
            return false;
        }
        inner.waiting_for_mtu_change = false;
        if let Some(payload) = payload {
            inner.mtu = payload;
            inner.mtu_negotiated = true;
        }
        drop(inner);
        self.changed.notify_all();
        true
    }

    pub(crate) fn wait_mtu(&self, timeout: Duration) -> WaitOutcome {
        self.wait_for(timeout, |inner| !inner.waiting_for_mtu_change)
    }

    // ------------------------------------------------------------------------
    // Write completion
    // ------------------------------------------------------------------------

    pub fn begin_write(&self, characteristic: Uuid) {
        self.inner.lock().write_completion.insert(characteristic, false);
    }

    pub fn complete_write(&self, characteristic: Uuid) {
        self.update(|inner| {
            inner.write_completion.insert(characteristic, true);
        });
    }

    pub(crate) fn wait_write_complete(&self, characteristic: Uuid, timeout: Duration) -> WaitOutcome {
        self.wait_for(timeout, |inner| {
            inner.write_completion.get(&characteristic).copied().unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------------
    // Read buffers
    // ------------------------------------------------------------------------

    /// Reset the accumulator for a characteristic to empty.
    pub fn prepare_read_buffer(&self, characteristic: Uuid) {
        self.inner.lock().read_buffers.insert(characteristic, Vec::new());
    }

    pub fn append_notification(&self, characteristic: Uuid, value: &[u8]) {
        self.update(|inner| {
            inner
                .read_buffers
                .entry(characteristic)
                .or_default()
                .extend_from_slice(value);
        });
    }

    /// Take everything accumulated so far, leaving the accumulator empty.
    pub fn drain_read_buffer(&self, characteristic: Uuid) -> Vec<u8> {
        let mut inner = self.inner.lock();
        inner
            .read_buffers
            .get_mut(&characteristic)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn pending_read_len(&self, characteristic: Uuid) -> usize {
        self.inner
            .lock()
            .read_buffers
            .get(&characteristic)
            .map_or(0, Vec::len)
    }

    /// Block until the accumulator is non-empty. Failures end the wait early.
    pub(crate) fn wait_for_data(&self, characteristic: Uuid, timeout: Duration) -> WaitOutcome {
        self.wait_for(timeout, |inner| {
            inner
                .read_buffers
                .get(&characteristic)
                .is_some_and(|buf| !buf.is_empty())
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn update<F: FnOnce(&mut LinkInner)>(&self, f: F) {
        let mut inner = self.inner.lock();
        f(&mut inner);
        drop(inner);
        self.changed.notify_all();
    }

    fn wait_for<F>(&self, timeout: Duration, mut ready: F) -> WaitOutcome
    where
        F: FnMut(&LinkInner) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner: MutexGuard<'_, LinkInner> = self.inner.lock();
        loop {
            if ready(&inner) {
                return WaitOutcome::Ready;
            }
            if let Some(error) = &inner.failure {
                return WaitOutcome::Failed(error.clone());
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return if ready(&inner) {
                    WaitOutcome::Ready
                } else if let Some(error) = &inner.failure {
                    WaitOutcome::Failed(error.clone())
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }
}

impl std::fmt::Debug for SharedConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedConnectionState")
            .field("address", &self.address)
            .field("phase", &inner.phase)
            .field("mtu", &inner.mtu)
            .field("paired", &inner.paired)
            .field("has_link", &inner.link.is_some())
            .field("closing", &inner.closing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::gatt::{DATA_FROM_PRINTER_UUID, DATA_TO_PRINTER_UUID};
    use std::thread;

    fn state() -> Arc<SharedConnectionState> {
        let address = DeviceAddress::parse("AA:BB:CC:DD:EE:FF").expect("valid address");
        Arc::new(SharedConnectionState::new(address))
    }

    #[test]
    fn test_initial_state() {
        let state = state();
        assert_eq!(state.phase(), ConnectionPhase::Disconnected);
        assert_eq!(state.mtu(), 17);
        assert!(!state.is_paired());
        assert!(state.link().is_none());
        assert!(state.failure().is_none());
    }

    #[test]
    fn test_drain_resets_accumulator_in_order() {
        let state = state();
        state.prepare_read_buffer(DATA_FROM_PRINTER_UUID);
        state.append_notification(DATA_FROM_PRINTER_UUID, b"hello ");
        state.append_notification(DATA_FROM_PRINTER_UUID, b"world");

        assert_eq!(state.pending_read_len(DATA_FROM_PRINTER_UUID), 11);
        assert_eq!(state.drain_read_buffer(DATA_FROM_PRINTER_UUID), b"hello world");
        assert!(state.drain_read_buffer(DATA_FROM_PRINTER_UUID).is_empty());
    }

    #[test]
    fn test_concurrent_append_and_drain_loses_nothing() {
        let state = state();
        state.prepare_read_buffer(DATA_FROM_PRINTER_UUID);

        let producer = {
            let state = state.clone();
            thread::spawn(move || {
                for i in 0..1000u32 {
                    state.append_notification(DATA_FROM_PRINTER_UUID, &i.to_le_bytes());
                }
            })
        };

        let mut collected = Vec::new();
        while collected.len() < 4000 {
            collected.extend(state.drain_read_buffer(DATA_FROM_PRINTER_UUID));
        }
        producer.join().expect("producer thread");

        let values: Vec<u32> = collected
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_first_write_flag_is_per_channel() {
        let state = state();
        assert!(state.take_first_write(DATA_TO_PRINTER_UUID));
        assert!(!state.take_first_write(DATA_TO_PRINTER_UUID));
        assert!(state.take_first_write(DATA_FROM_PRINTER_UUID));
    }

    #[test]
    fn test_mtu_applied_once() {
        let state = state();
        state.begin_mtu_request();
        assert!(state.complete_mtu(Some(182)));
        assert_eq!(state.mtu(), 182);
        assert!(!state.is_waiting_for_mtu());

        state.begin_mtu_request();
        assert!(!state.complete_mtu(Some(512)));
        assert_eq!(state.mtu(), 182);
    }

    #[test]
    fn test_unsolicited_mtu_ignored() {
        let state = state();
        assert!(!state.complete_mtu(Some(182)));
        assert_eq!(state.mtu(), 17);
    }

    #[test]
    fn test_failed_mtu_keeps_default() {
        let state = state();
        state.begin_mtu_request();
        assert!(state.complete_mtu(None));
        assert_eq!(state.mtu(), 17);
        assert!(!state.is_waiting_for_mtu());
    }

    #[test]
    fn test_write_wait_wakes_on_completion() {
        let state = state();
        state.begin_write(DATA_TO_PRINTER_UUID);

        let completer = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.complete_write(DATA_TO_PRINTER_UUID);
            })
        };

        let outcome = state.wait_write_complete(DATA_TO_PRINTER_UUID, Duration::from_secs(5));
        completer.join().expect("completer thread");
        assert!(matches!(outcome, WaitOutcome::Ready));
    }

    #[test]
    fn test_wait_times_out() {
        let state = state();
        state.begin_write(DATA_TO_PRINTER_UUID);
        let outcome = state.wait_write_complete(DATA_TO_PRINTER_UUID, Duration::from_millis(30));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn test_failure_aborts_wait() {
        let state = state();
        let failer = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.fail(TransportError::ConnectionFailed("link lost".into()));
            })
        };

        let outcome = state.wait_paired(Duration::from_secs(5));
        failer.join().expect("failer thread");
        assert!(matches!(
            outcome,
            WaitOutcome::Failed(TransportError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_first_failure_wins() {
        let state = state();
        assert!(state.fail(TransportError::Protocol("service missing".into())));
        assert!(!state.fail(TransportError::ConnectionFailed("later".into())));
        assert!(matches!(state.failure(), Some(TransportError::Protocol(_))));
    }

    #[test]
    fn test_begin_closing_reports_previous_phase() {
        let state = state();
        state.set_phase(ConnectionPhase::Ready);
        assert_eq!(state.begin_closing(), ConnectionPhase::Ready);
        assert_eq!(state.phase(), ConnectionPhase::Disconnecting);
        assert!(state.is_closing());
    }

    #[test]
    fn test_mark_paired_enters_ready() {
        let state = state();
        state.set_phase(ConnectionPhase::AwaitingBond);
        state.mark_paired();
        assert!(state.is_paired());
        assert_eq!(state.phase(), ConnectionPhase::Ready);
    }
}
