// ZebraPrint Core: BLE printer transport
//
// Blocking byte-stream sockets over a printer's GATT data service, with one
// shared radio link per printer no matter how many sockets are open.

pub mod config;
pub mod error;
pub mod transport;

pub use config::{ConfigError, TransportConfig};
pub use error::{Result, TimedOperation, TransportError};
pub use transport::ble::{
    BleConnector, BleInputStream, BleOutputStream, BleSocket, BondState, ConnectionPhase,
    DeviceAddress, DeviceRegistry, GattEvent, GattStatus, LinkState, RadioLink, RadioPlatform,
    SimulatedBehavior, SimulatedRadio,
};

// ============================================================================
// LOGGING
// ============================================================================

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialised twice without panicking");
    }
}
