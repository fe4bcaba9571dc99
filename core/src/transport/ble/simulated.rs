// Simulated radio platform
//
// An in-process stand-in for a BLE stack, used for host-side testing and
// demos. Events are delivered on a dedicated callback thread, in submission
// order, the way a real stack delivers them off the caller's thread.
// Behaviour is scripted through `SimulatedBehavior`; counters in
// `SimulatedStats` record what the transport asked the radio to do.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::address::DeviceAddress;
use super::gatt::{GattStatus, DATA_FROM_PRINTER_UUID, DATA_TO_PRINTER_UUID, PARSER_DATA_SERVICE_UUID};
use super::platform::{
    BondCallback, BondReceiverId, BondState, GattCallback, GattEvent, LinkState, PlatformError,
    RadioLink, RadioPlatform,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Scripted behaviour of the simulated printer and radio stack
#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    /// `connect_gatt` returns a link
    pub accept_connect: bool,
    /// The link reports Connected after `connect_gatt`
    pub complete_connect: bool,
    /// The printer data service is present
    pub service_present: bool,
    /// Status reported for service discovery
    pub discovery_status: GattStatus,
    /// The device starts in Bonding and bonds `bond_delay` after discovery
    pub bond_required: bool,
    pub bond_delay: Duration,
    /// Status reported for the first descriptor write on a link
    pub descriptor_status: GattStatus,
    /// Whether MTU requests are supported at all
    pub mtu_support: bool,
    /// Peer MTU limit; `None` leaves MTU requests unanswered
    pub mtu_response: Option<usize>,
    /// Acknowledge only the first N chunk writes on a link
    pub acked_write_limit: Option<usize>,
    /// Report Disconnected after `disconnect()`
    pub ack_disconnect: bool,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            accept_connect: true,
            complete_connect: true,
            service_present: true,
            discovery_status: GattStatus::SUCCESS,
            bond_required: false,
            bond_delay: Duration::from_millis(50),
            descriptor_status: GattStatus::SUCCESS,
            mtu_support: true,
            mtu_response: Some(185),
            acked_write_limit: None,
            ack_disconnect: true,
        }
    }
}

/// Counters describing what the transport asked of the radio
#[derive(Debug, Clone, Default)]
pub struct SimulatedStats {
    pub connect_attempts: usize,
    pub discoveries: usize,
    pub descriptor_writes: usize,
    pub mtu_requests: usize,
    pub written_chunks: Vec<Vec<u8>>,
    pub disconnect_requests: usize,
    pub links_closed: usize,
    pub receivers_registered: usize,
    pub receivers_unregistered: usize,
}

// ============================================================================
// RADIO CORE
// ============================================================================

type Job = Box<dyn FnOnce() + Send>;

struct RadioCore {
    behavior: RwLock<SimulatedBehavior>,
    jobs: Mutex<mpsc::Sender<Job>>,
    links: Mutex<HashMap<DeviceAddress, Arc<SimulatedLink>>>,
    bond_states: Mutex<HashMap<DeviceAddress, BondState>>,
    receivers: Mutex<HashMap<BondReceiverId, BondCallback>>,
    next_receiver: AtomicU64,
    stats: Mutex<SimulatedStats>,
}

impl RadioCore {
    fn dispatch(&self, job: Job) {
        if self.jobs.lock().send(job).is_err() {
            warn!("Simulated radio: callback thread gone, dropping event");
        }
    }

    fn broadcast_bond(self: &Arc<Self>, address: DeviceAddress, state: BondState) {
        let core = Arc::downgrade(self);
        self.dispatch(Box::new(move || {
            let Some(core) = core.upgrade() else {
                return;
            };
            core.bond_states.lock().insert(address.clone(), state);
            let receivers: Vec<BondCallback> = core.receivers.lock().values().cloned().collect();
            for receiver in receivers {
                receiver(&address, state);
            }
        }));
    }
}

// ============================================================================
// SIMULATED LINK
// ============================================================================

pub struct SimulatedLink {
    address: DeviceAddress,
    me: Weak<SimulatedLink>,
    core: Weak<RadioCore>,
    callback: GattCallback,
    state: Mutex<LinkState>,
    chunk_writes: AtomicUsize,
    descriptor_writes: AtomicUsize,
    closed: AtomicBool,
}

impl SimulatedLink {
    fn emit(&self, transition: Option<LinkState>, event: GattEvent) {
        let (Some(core), Some(link)) = (self.core.upgrade(), self.me.upgrade()) else {
            return;
        };
        let callback = self.callback.clone();
        core.dispatch(Box::new(move || {
            if let Some(state) = transition {
                *link.state.lock() = state;
            }
            let link_ref: &dyn RadioLink = link.as_ref();
            callback(link_ref, event);
        }));
    }

    fn behavior(&self) -> SimulatedBehavior {
        self.core
            .upgrade()
            .map(|core| core.behavior.read().clone())
            .unwrap_or_default()
    }

    fn record<F: FnOnce(&mut SimulatedStats)>(&self, f: F) {
        if let Some(core) = self.core.upgrade() {
            f(&mut core.stats.lock());
        }
    }

    fn current_bond_state(&self) -> BondState {
        self.core
            .upgrade()
            .and_then(|core| core.bond_states.lock().get(&self.address).copied())
            .unwrap_or(BondState::None)
    }
}

impl RadioLink for SimulatedLink {
    fn connection_state(&self) -> LinkState {
        *self.state.lock()
    }

    fn discover_services(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let behavior = self.behavior();
        self.record(|s| s.discoveries += 1);
        self.emit(
            None,
            GattEvent::ServicesDiscovered {
                status: behavior.discovery_status,
            },
        );

        if behavior.bond_required && self.current_bond_state() == BondState::Bonding {
            let core = self.core.clone();
            let address = self.address.clone();
            thread::spawn(move || {
                thread::sleep(behavior.bond_delay);
                if let Some(core) = core.upgrade() {
                    core.broadcast_bond(address, BondState::Bonded);
                }
            });
        }
        true
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.behavior().service_present
            && service == PARSER_DATA_SERVICE_UUID
            && (characteristic == DATA_TO_PRINTER_UUID || characteristic == DATA_FROM_PRINTER_UUID)
    }

    fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.connection_state() != LinkState::Connected {
            return false;
        }
        let submitted = self.chunk_writes.fetch_add(1, Ordering::SeqCst);
        self.record(|s| s.written_chunks.push(value.to_vec()));

        let acked = self
            .behavior()
            .acked_write_limit
            .map_or(true, |limit| submitted < limit);
        if acked {
            self.emit(
                None,
                GattEvent::CharacteristicWritten {
                    characteristic,
                    status: GattStatus::SUCCESS,
                },
            );
        }
        true
    }

    fn write_descriptor(&self, _characteristic: Uuid, descriptor: Uuid, _value: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.record(|s| s.descriptor_writes += 1);
        if self.current_bond_state() == BondState::Bonding {
            return false;
        }
        let attempt = self.descriptor_writes.fetch_add(1, Ordering::SeqCst);
        let status = if attempt == 0 {
            self.behavior().descriptor_status
        } else {
            GattStatus::SUCCESS
        };
        self.emit(None, GattEvent::DescriptorWritten { descriptor, status });
        true
    }

    fn set_characteristic_notification(&self, _characteristic: Uuid, _enabled: bool) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn request_mtu(&self, mtu: usize) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.record(|s| s.mtu_requests += 1);
        if let Some(peer_limit) = self.behavior().mtu_response {
            self.emit(
                None,
                GattEvent::MtuChanged {
                    mtu: mtu.min(peer_limit),
                    status: GattStatus::SUCCESS,
                },
            );
        }
        true
    }

    fn disconnect(&self) {
        self.record(|s| s.disconnect_requests += 1);
        {
            let mut state = self.state.lock();
            if *state == LinkState::Disconnected {
                return;
            }
            *state = LinkState::Disconnecting;
        }
        if self.behavior().ack_disconnect {
            self.emit(
                Some(LinkState::Disconnected),
                GattEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    state: LinkState::Disconnected,
                },
            );
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record(|s| s.links_closed += 1);
        if let Some(core) = self.core.upgrade() {
            let mut links = core.links.lock();
            let current = links
                .get(&self.address)
                .is_some_and(|l| std::ptr::eq(Arc::as_ptr(l), self));
            if current {
                links.remove(&self.address);
            }
        }
        debug!("Simulated radio: link to {} closed", self.address);
    }
}

// ============================================================================
// SIMULATED PLATFORM
// ============================================================================

/// Simulated radio stack. Clones share the same radio.
#[derive(Clone)]
pub struct SimulatedRadio {
    core: Arc<RadioCore>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::with_behavior(SimulatedBehavior::default())
    }

    pub fn with_behavior(behavior: SimulatedBehavior) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("simulated-radio".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            });
        if let Err(e) = spawned {
            warn!("Simulated radio: failed to start callback thread: {}", e);
        }

        Self {
            core: Arc::new(RadioCore {
                behavior: RwLock::new(behavior),
                jobs: Mutex::new(tx),
                links: Mutex::new(HashMap::new()),
                bond_states: Mutex::new(HashMap::new()),
                receivers: Mutex::new(HashMap::new()),
                next_receiver: AtomicU64::new(1),
                stats: Mutex::new(SimulatedStats::default()),
            }),
        }
    }

    pub fn update_behavior<F: FnOnce(&mut SimulatedBehavior)>(&self, f: F) {
        f(&mut self.core.behavior.write());
    }

    pub fn stats(&self) -> SimulatedStats {
        self.core.stats.lock().clone()
    }

    pub fn link_state(&self, address: &DeviceAddress) -> Option<LinkState> {
        self.core
            .links
            .lock()
            .get(address)
            .map(|link| link.connection_state())
    }

    pub fn active_receivers(&self) -> usize {
        self.core.receivers.lock().len()
    }

    /// Deliver an indication from the printer on the current link.
    pub fn notify(&self, address: &DeviceAddress, value: &[u8]) -> bool {
        let Some(link) = self.core.links.lock().get(address).cloned() else {
            return false;
        };
        link.emit(
            None,
            GattEvent::CharacteristicChanged {
                characteristic: DATA_FROM_PRINTER_UUID,
                value: value.to_vec(),
            },
        );
        true
    }

    /// Simulate the printer going out of range.
    pub fn drop_link(&self, address: &DeviceAddress) -> bool {
        let Some(link) = self.core.links.lock().get(address).cloned() else {
            return false;
        };
        link.emit(
            Some(LinkState::Disconnected),
            GattEvent::ConnectionStateChanged {
                status: GattStatus(8),
                state: LinkState::Disconnected,
            },
        );
        true
    }

    /// Broadcast a bond-state change to every registered receiver.
    pub fn broadcast_bond(&self, address: &DeviceAddress, state: BondState) {
        self.core.broadcast_bond(address.clone(), state);
    }

    /// Wait until every event queued so far has been delivered.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.core.dispatch(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.recv_timeout(Duration::from_secs(5));
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioPlatform for SimulatedRadio {
    fn supports_mtu_request(&self) -> bool {
        self.core.behavior.read().mtu_support
    }

    fn connect_gatt(
        &self,
        address: &DeviceAddress,
        callback: GattCallback,
    ) -> Option<Arc<dyn RadioLink>> {
        let behavior = self.core.behavior.read().clone();
        self.core.stats.lock().connect_attempts += 1;
        if !behavior.accept_connect {
            return None;
        }
        if behavior.bond_required {
            self.core
                .bond_states
                .lock()
                .insert(address.clone(), BondState::Bonding);
        }

        let core = Arc::downgrade(&self.core);
        let link = Arc::new_cyclic(|me| SimulatedLink {
            address: address.clone(),
            me: me.clone(),
            core,
            callback,
            state: Mutex::new(LinkState::Connecting),
            chunk_writes: AtomicUsize::new(0),
            descriptor_writes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.core.links.lock().insert(address.clone(), link.clone());
        debug!("Simulated radio: connecting to {}", address);

        if behavior.complete_connect {
            link.emit(
                Some(LinkState::Connected),
                GattEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    state: LinkState::Connected,
                },
            );
        }
        Some(link as Arc<dyn RadioLink>)
    }

    fn bond_state(&self, address: &DeviceAddress) -> BondState {
        self.core
            .bond_states
            .lock()
            .get(address)
            .copied()
            .unwrap_or(BondState::None)
    }

    fn register_bond_receiver(&self, callback: BondCallback) -> Result<BondReceiverId, PlatformError> {
        let id = BondReceiverId(self.core.next_receiver.fetch_add(1, Ordering::SeqCst));
        self.core.receivers.lock().insert(id, callback);
        self.core.stats.lock().receivers_registered += 1;
        Ok(id)
    }

    fn unregister_bond_receiver(&self, id: BondReceiverId) -> Result<(), PlatformError> {
        match self.core.receivers.lock().remove(&id) {
            Some(_) => {
                self.core.stats.lock().receivers_unregistered += 1;
                Ok(())
            }
            None => Err(PlatformError::ReceiverNotRegistered),
        }
    }
}
