/// Bond-state observer
///
/// Some printers refuse the CCCD write until pairing finishes. The observer
/// listens for bond broadcasts and, once the watched device reports Bonded,
/// retries the subscription on the current link after a short settle delay.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::address::DeviceAddress;
use super::gatt::{CLIENT_CONFIG_DESCRIPTOR_UUID, DATA_FROM_PRINTER_UUID, ENABLE_INDICATION_VALUE};
use super::platform::{BondCallback, BondState};
use super::registry::DeviceRegistry;
use super::state::ConnectionPhase;
use crate::error::TransportError;

pub struct BondObserver {
    address: DeviceAddress,
    registry: Arc<DeviceRegistry>,
    settle_delay: Duration,
}

impl BondObserver {
    pub fn new(address: DeviceAddress, registry: Arc<DeviceRegistry>, settle_delay: Duration) -> Self {
        Self {
            address,
            registry,
            settle_delay,
        }
    }

    /// Wrap the observer in the callback shape expected by the platform.
    pub fn into_callback(self) -> BondCallback {
        let observer = Arc::new(self);
        Arc::new(move |address: &DeviceAddress, state: BondState| {
            observer.on_bond_state_changed(address, state)
        })
    }

    pub fn on_bond_state_changed(&self, address: &DeviceAddress, bond_state: BondState) {
        if *address != self.address {
            return;
        }
        debug!("BLE {}: bond state {:?}", address, bond_state);
        if bond_state != BondState::Bonded {
            return;
        }

        thread::sleep(self.settle_delay);

        let Some(state) = self.registry.find(&self.address) else {
            debug!("BLE {}: bonded but no connection state", self.address);
            return;
        };
        if state.is_paired() || state.is_closing() {
            return;
        }
        if !state.services_resolved() {
            // Discovery has not finished; it will subscribe itself.
            return;
        }
        let Some(link) = state.link() else {
            return;
        };

        info!("BLE {}: bonded, retrying subscription", self.address);
        state.set_phase(ConnectionPhase::AwaitingBond);
        let accepted = link.write_descriptor(
            DATA_FROM_PRINTER_UUID,
            CLIENT_CONFIG_DESCRIPTOR_UUID,
            &ENABLE_INDICATION_VALUE,
        );
        if !accepted {
            let error = TransportError::ConnectionFailed("descriptor write refused after bonding".into());
            if state.fail(error) {
                warn!("BLE {}: descriptor write refused after bonding", self.address);
                link.disconnect();
            }
        }
    }
}
