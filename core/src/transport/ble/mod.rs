/// BLE (Bluetooth Low Energy) Printer Transport
///
/// Byte-stream sockets over the printer's GATT data service. Several logical
/// sockets to one printer share a single radio link through the registry:
///
/// - **gatt**: Service/characteristic UUIDs, MTU constants, payload chunking
/// - **address**: Canonical device addresses
/// - **platform**: Radio capability traits implemented by platform code
/// - **state**: Per-device shared connection state
/// - **registry**: Reference-counted device table
/// - **events**: Connection state machine driven by GATT events
/// - **bond**: Bond-state observer retrying subscription after pairing
/// - **socket**: Blocking socket with read/write streams
/// - **connector**: Socket factory with platform handle and settle delay
/// - **simulated**: In-process radio for host-side testing
///
/// The radio itself lives behind [`RadioPlatform`]; everything here is
/// testable without hardware.

pub mod address;
pub mod bond;
pub mod connector;
mod events;
pub mod gatt;
pub mod platform;
pub mod registry;
pub mod simulated;
pub mod socket;
pub mod state;

pub use address::DeviceAddress;
pub use bond::BondObserver;
pub use connector::BleConnector;
pub use gatt::{
    chunk_payload, payload_size_for_mtu, GattCharacteristic, GattStatus,
    CLIENT_CONFIG_DESCRIPTOR_UUID, DATA_FROM_PRINTER_UUID, DATA_TO_PRINTER_UUID,
    DEFAULT_MTU_SIZE, ENABLE_INDICATION_VALUE, MAX_MTU_SIZE, MTU_OFFSET, PARSER_DATA_SERVICE_UUID,
};
pub use platform::{
    BondCallback, BondReceiverId, BondState, GattCallback, GattEvent, LinkState, PlatformError,
    RadioLink, RadioPlatform,
};
pub use registry::{DeviceLocks, DeviceRegistry};
pub use simulated::{SimulatedBehavior, SimulatedLink, SimulatedRadio, SimulatedStats};
pub use socket::{BleInputStream, BleOutputStream, BleSocket};
pub use state::{ConnectionPhase, SharedConnectionState};
