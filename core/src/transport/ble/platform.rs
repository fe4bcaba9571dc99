// Radio platform capability
//
// The transport never talks to a radio stack directly. Platform code (an
// Android binding, a BlueZ shim, or the in-process simulator) implements the
// two traits below and delivers asynchronous events through the callbacks
// handed to it. Events may arrive on any thread, including synchronously from
// inside a `RadioLink` call.

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::address::DeviceAddress;
use super::gatt::GattStatus;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("Bond receiver registration failed: {0}")]
    ReceiverRegistration(String),
    #[error("Bond receiver not registered")]
    ReceiverNotRegistered,
}

// ============================================================================
// STATE ENUMS
// ============================================================================

/// Physical link state as reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Pairing state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Asynchronous GATT events delivered for one radio link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged { status: GattStatus, state: LinkState },
    ServicesDiscovered { status: GattStatus },
    CharacteristicWritten { characteristic: Uuid, status: GattStatus },
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
    DescriptorWritten { descriptor: Uuid, status: GattStatus },
    MtuChanged { mtu: usize, status: GattStatus },
}

/// Handle used to unregister a bond receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BondReceiverId(pub u64);

/// Callback receiving GATT events together with the link they belong to
pub type GattCallback = Arc<dyn Fn(&dyn RadioLink, GattEvent) + Send + Sync>;

/// Callback receiving out-of-band bond-state broadcasts
pub type BondCallback = Arc<dyn Fn(&DeviceAddress, BondState) + Send + Sync>;

// ============================================================================
// PLATFORM TRAITS
// ============================================================================

/// An open GATT client connection.
///
/// Methods returning `bool` report whether the platform accepted the request;
/// the outcome of an accepted request arrives later as a [`GattEvent`].
#[cfg_attr(test, mockall::automock)]
pub trait RadioLink: Send + Sync {
    /// Current physical link state
    fn connection_state(&self) -> LinkState;

    /// Start service discovery
    fn discover_services(&self) -> bool;

    /// Whether discovery found `characteristic` inside `service`
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Submit one characteristic write
    fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> bool;

    /// Submit one descriptor write
    fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> bool;

    /// Enable or disable local delivery of notifications for a characteristic
    fn set_characteristic_notification(&self, characteristic: Uuid, enabled: bool) -> bool;

    /// Request a larger MTU
    fn request_mtu(&self, mtu: usize) -> bool;

    /// Request a physical disconnect; completion arrives as an event
    fn disconnect(&self);

    /// Release the link's platform resources
    fn close(&self);
}

/// Radio stack capability consumed by the transport.
pub trait RadioPlatform: Send + Sync {
    /// Whether this platform surface supports MTU negotiation.
    ///
    /// Resolved once when a socket is created.
    fn supports_mtu_request(&self) -> bool;

    /// Open a GATT connection to `address`, delivering its events to `callback`.
    ///
    /// Returns `None` when the platform refuses to start the connection.
    fn connect_gatt(
        &self,
        address: &DeviceAddress,
        callback: GattCallback,
    ) -> Option<Arc<dyn RadioLink>>;

    /// Current bond state of a device
    fn bond_state(&self, address: &DeviceAddress) -> BondState;

    /// Subscribe to bond-state broadcasts
    fn register_bond_receiver(&self, callback: BondCallback) -> Result<BondReceiverId, PlatformError>;

    /// Unsubscribe a bond receiver
    fn unregister_bond_receiver(&self, id: BondReceiverId) -> Result<(), PlatformError>;
}
