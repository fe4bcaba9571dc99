// Transport module: BLE printer links

pub mod ble;

pub use ble::{
    BleConnector, BleInputStream, BleOutputStream, BleSocket, ConnectionPhase, DeviceAddress,
    DeviceRegistry, RadioLink, RadioPlatform, SimulatedRadio,
};
