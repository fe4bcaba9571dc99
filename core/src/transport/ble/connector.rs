/// BLE printer connector
///
/// Entry point for opening printer sockets. Holds the platform handle and
/// configuration; each `open()` produces a connected [`BleSocket`] sharing the
/// device's physical link through the registry.

use std::sync::Arc;
use std::thread;
use tracing::debug;

use super::address::DeviceAddress;
use super::platform::RadioPlatform;
use super::registry::DeviceRegistry;
use super::socket::BleSocket;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

pub struct BleConnector {
    address: DeviceAddress,
    platform: Option<Arc<dyn RadioPlatform>>,
    registry: Arc<DeviceRegistry>,
    config: TransportConfig,
}

impl BleConnector {
    /// Connector for `address` using the process-wide registry and default timings.
    pub fn new(address: &str) -> Result<Self> {
        Ok(Self {
            address: DeviceAddress::parse(address)?,
            platform: None,
            registry: DeviceRegistry::shared(),
            config: TransportConfig::default(),
        })
    }

    pub fn with_registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Supply the radio platform. Must be called before [`open`](Self::open).
    pub fn set_platform(&mut self, platform: Arc<dyn RadioPlatform>) {
        self.platform = Some(platform);
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Open and connect a socket, then give the printer time to settle.
    pub fn open(&self) -> Result<BleSocket> {
        let platform = self.platform.clone().ok_or_else(|| {
            TransportError::Configuration("radio platform not set; call set_platform before open".into())
        })?;

        let mut socket = BleSocket::new(
            self.address.clone(),
            platform,
            self.registry.clone(),
            self.config.clone(),
        )?;
        socket.connect()?;

        let settle = self.config.open_settle_delay();
        debug!("BLE {}: settling for {:?}", self.address, settle);
        thread::sleep(settle);
        Ok(socket)
    }
}
