// GATT event handling
//
// Drives the connection state machine from platform callbacks. One handler is
// bound to each physical link and to the shared state created for it, so late
// events from a retired link can never touch a fresh state.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::address::DeviceAddress;
use super::gatt::{
    payload_size_for_mtu, GattCharacteristic, GattStatus, CLIENT_CONFIG_DESCRIPTOR_UUID,
    DATA_FROM_PRINTER_UUID, ENABLE_INDICATION_VALUE, PARSER_DATA_SERVICE_UUID,
};
use super::platform::{BondState, GattCallback, GattEvent, LinkState, RadioLink, RadioPlatform};
use super::registry::DeviceRegistry;
use super::state::{ConnectionPhase, SharedConnectionState};
use crate::error::TransportError;

pub(crate) struct LinkEventHandler {
    address: DeviceAddress,
    state: Arc<SharedConnectionState>,
    registry: Arc<DeviceRegistry>,
    platform: Arc<dyn RadioPlatform>,
}

impl LinkEventHandler {
    pub(crate) fn new(
        state: Arc<SharedConnectionState>,
        registry: Arc<DeviceRegistry>,
        platform: Arc<dyn RadioPlatform>,
    ) -> Self {
        Self {
            address: state.address().clone(),
            state,
            registry,
            platform,
        }
    }

    /// Wrap the handler in the callback shape expected by `connect_gatt`.
    pub(crate) fn into_callback(self) -> GattCallback {
        let handler = Arc::new(self);
        Arc::new(move |link: &dyn RadioLink, event: GattEvent| handler.handle(link, event))
    }

    pub(crate) fn handle(&self, link: &dyn RadioLink, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state_changed(link, status, state)
            }
            GattEvent::ServicesDiscovered { status } => self.on_services_discovered(link, status),
            GattEvent::CharacteristicWritten {
                characteristic,
                status,
            } => {
                if !status.is_success() {
                    warn!(
                        "BLE {}: write on {} completed with {}",
                        self.address, characteristic, status
                    );
                }
                self.state.complete_write(characteristic);
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                debug!(
                    "BLE {}: {} bytes received on {}",
                    self.address,
                    value.len(),
                    characteristic
                );
                self.state.append_notification(characteristic, &value);
            }
            GattEvent::DescriptorWritten { descriptor, status } => {
                self.on_descriptor_written(link, descriptor, status)
            }
            GattEvent::MtuChanged { mtu, status } => {
                let payload = status.is_success().then(|| payload_size_for_mtu(mtu));
                if self.state.complete_mtu(payload) {
                    match payload {
                        Some(size) => info!("BLE {}: MTU {} negotiated, payload {} bytes", self.address, mtu, size),
                        None => warn!("BLE {}: MTU negotiation failed ({})", self.address, status),
                    }
                } else {
                    debug!("BLE {}: ignoring MTU event ({}, {})", self.address, mtu, status);
                }
            }
        }
    }

    fn on_connection_state_changed(&self, link: &dyn RadioLink, status: GattStatus, state: LinkState) {
        debug!("BLE {}: link state {:?} ({})", self.address, state, status);
        match state {
            LinkState::Connected if status.is_success() => {
                if self.state.is_closing() {
                    return;
                }
                self.state.set_phase(ConnectionPhase::ServicesDiscovering);
                if !link.discover_services() {
                    self.fail(
                        link,
                        TransportError::ConnectionFailed("service discovery request refused".into()),
                    );
                }
            }
            LinkState::Connected => {
                self.fail(
                    link,
                    TransportError::ConnectionFailed(format!("connect completed with {}", status)),
                );
            }
            LinkState::Connecting => {}
            LinkState::Disconnecting => {
                if !self.state.is_closing() {
                    self.fail(
                        link,
                        TransportError::ConnectionFailed("link disconnecting unexpectedly".into()),
                    );
                }
            }
            LinkState::Disconnected => self.on_disconnected(link, status),
        }
    }

    fn on_disconnected(&self, link: &dyn RadioLink, status: GattStatus) {
        let requested = self.state.is_closing();
        if requested {
            info!("BLE {}: disconnected", self.address);
        } else {
            warn!("BLE {}: link lost ({})", self.address, status);
            self.state.fail(TransportError::ConnectionFailed(format!(
                "link lost ({})",
                status
            )));
        }
        self.state.set_phase(ConnectionPhase::Disconnected);
        self.state.take_link();
        link.close();

        if requested || self.registry.reference_count(&self.address) == 0 {
            self.registry.remove_state(&self.address, &self.state);
        }
    }

    fn on_services_discovered(&self, link: &dyn RadioLink, status: GattStatus) {
        if !status.is_success() {
            self.fail(
                link,
                TransportError::ConnectionFailed(format!("service discovery failed ({})", status)),
            );
            return;
        }

        let has_service = GattCharacteristic::ALL
            .iter()
            .all(|c| link.has_characteristic(PARSER_DATA_SERVICE_UUID, c.uuid()));
        if !has_service {
            self.fail(
                link,
                TransportError::Protocol(format!(
                    "device {} does not expose the printer data service",
                    self.address
                )),
            );
            return;
        }

        debug!("BLE {}: services resolved", self.address);
        self.state.set_phase(ConnectionPhase::AwaitingBond);
        self.state.mark_services_resolved();

        if self.platform.bond_state(&self.address) == BondState::Bonding {
            info!("BLE {}: waiting for bonding to finish", self.address);
            return;
        }
        self.subscribe(link);
    }

    fn on_descriptor_written(&self, link: &dyn RadioLink, descriptor: uuid::Uuid, status: GattStatus) {
        if status.is_success() {
            if !link.set_characteristic_notification(DATA_FROM_PRINTER_UUID, true) {
                warn!("BLE {}: local notification enable refused", self.address);
            }
            self.state.mark_paired();
            info!("BLE {}: subscribed, link ready", self.address);
        } else if status == GattStatus::BUSY {
            warn!(
                "BLE {}: descriptor write busy, waiting for bonding to retry",
                self.address
            );
            self.state.set_phase(ConnectionPhase::AwaitingBond);
        } else {
            warn!(
                "BLE {}: descriptor {} write completed with {}",
                self.address, descriptor, status
            );
            self.state.set_phase(ConnectionPhase::AwaitingBond);
        }
    }

    /// Write the CCCD to enable indications from the printer.
    fn subscribe(&self, link: &dyn RadioLink) {
        let accepted = link.write_descriptor(
            DATA_FROM_PRINTER_UUID,
            CLIENT_CONFIG_DESCRIPTOR_UUID,
            &ENABLE_INDICATION_VALUE,
        );
        if accepted {
            return;
        }
        if self.platform.bond_state(&self.address) == BondState::Bonding {
            debug!("BLE {}: descriptor write deferred until bonded", self.address);
        } else {
            self.fail(
                link,
                TransportError::ConnectionFailed("descriptor write refused".into()),
            );
        }
    }

    fn fail(&self, link: &dyn RadioLink, error: TransportError) {
        if self.state.is_closing() {
            return;
        }
        if self.state.fail(error.clone()) {
            warn!("BLE {}: {}", self.address, error);
            link.disconnect();
        }
    }
}
