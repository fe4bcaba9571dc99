// BLE printer socket
//
// A blocking byte-stream endpoint for one printer. Sockets never cache the
// shared state between calls: every operation resolves it through the
// registry, so a reconnect by any socket is picked up by the others.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::address::DeviceAddress;
use super::bond::BondObserver;
use super::events::LinkEventHandler;
use super::gatt::{chunk_payload, GattCharacteristic};
use super::platform::{BondReceiverId, LinkState, RadioLink, RadioPlatform};
use super::registry::DeviceRegistry;
use super::state::{ConnectionPhase, SharedConnectionState, WaitOutcome};
use crate::config::TransportConfig;
use crate::error::{Result, TimedOperation, TransportError};

// ============================================================================
// STREAM CONTEXT
// ============================================================================

/// Everything a stream needs to resolve its device and talk to it.
#[derive(Clone)]
struct StreamContext {
    address: DeviceAddress,
    registry: Arc<DeviceRegistry>,
    config: TransportConfig,
    supports_mtu_request: bool,
}

impl StreamContext {
    fn resolve(&self) -> Result<Arc<SharedConnectionState>> {
        self.registry
            .find(&self.address)
            .ok_or_else(|| TransportError::NotFound(self.address.to_string()))
    }

    fn write_payload(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let locks = self.registry.device_locks(&self.address);
        let result = {
            let _write_guard = locks.write.lock();
            self.write_chunks(data)
        };
        self.registry.release_locks(&self.address, locks);
        result
    }

    fn write_chunks(&self, data: &[u8]) -> Result<()> {
        let state = self.resolve()?;
        if let Some(error) = state.failure() {
            return Err(error);
        }
        let link = state
            .link()
            .ok_or_else(|| TransportError::NotFound(self.address.to_string()))?;

        let channel = GattCharacteristic::DataToPrinter.uuid();
        if state.take_first_write(channel) {
            self.negotiate_mtu(&state, link.as_ref())?;
        }

        let chunk_size = state.mtu();
        let mut sent = 0;
        for chunk in chunk_payload(data, chunk_size) {
            state.begin_write(channel);
            if !link.write_characteristic(channel, chunk) {
                warn!("BLE {}: chunk write refused after {} bytes", self.address, sent);
                return Err(TransportError::WriteRejected);
            }
            match state.wait_write_complete(channel, self.config.write_timeout()) {
                WaitOutcome::Ready => sent += chunk.len(),
                WaitOutcome::Failed(error) => return Err(error),
                WaitOutcome::TimedOut => {
                    warn!("BLE {}: chunk write timed out after {} bytes", self.address, sent);
                    return Err(TransportError::Timeout {
                        operation: TimedOperation::Write,
                        after: self.config.write_timeout(),
                    });
                }
            }
            debug!("BLE {}: wrote {} byte chunk", self.address, chunk.len());
        }

        if sent != data.len() {
            return Err(TransportError::Protocol(format!(
                "sent {} of {} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    /// One-time MTU negotiation for a write channel. Timeouts are not fatal.
    fn negotiate_mtu(&self, state: &SharedConnectionState, link: &dyn RadioLink) -> Result<()> {
        if !self.supports_mtu_request {
            debug!("BLE {}: MTU request unsupported, using {}", self.address, state.mtu());
            return Ok(());
        }

        state.begin_mtu_request();
        if !link.request_mtu(self.config.requested_mtu) {
            state.complete_mtu(None);
            warn!("BLE {}: MTU request refused, using {}", self.address, state.mtu());
            return Ok(());
        }

        match state.wait_mtu(self.config.mtu_wait()) {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::Failed(error) => Err(error),
            WaitOutcome::TimedOut => {
                state.complete_mtu(None);
                warn!(
                    "BLE {}: no MTU response after {:?}, using {}",
                    self.address,
                    self.config.mtu_wait(),
                    state.mtu()
                );
                Ok(())
            }
        }
    }
}

// ============================================================================
// SOCKET
// ============================================================================

pub struct BleSocket {
    ctx: StreamContext,
    platform: Arc<dyn RadioPlatform>,
    bond_receiver: Option<BondReceiverId>,
    opened: bool,
}

impl BleSocket {
    pub fn new(
        address: DeviceAddress,
        platform: Arc<dyn RadioPlatform>,
        registry: Arc<DeviceRegistry>,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        let supports_mtu_request = platform.supports_mtu_request();
        Ok(Self {
            ctx: StreamContext {
                address,
                registry,
                config,
                supports_mtu_request,
            },
            platform,
            bond_receiver: None,
            opened: false,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.ctx.address
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Connect to the printer, blocking until the link is ready.
    ///
    /// Reuses a ready link another socket already holds for the same device.
    pub fn connect(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }

        let locks = self.ctx.registry.device_locks(&self.ctx.address);
        let result = {
            let _connect_guard = locks.connect.lock();
            self.connect_locked()
        };
        self.ctx.registry.release_locks(&self.ctx.address, locks);
        result
    }

    fn connect_locked(&mut self) -> Result<()> {
        let state = match self.ctx.registry.find(&self.ctx.address) {
            Some(state) if Self::is_reusable(&state) => {
                let refs = self.ctx.registry.increment_ref(&self.ctx.address);
                self.opened = true;
                info!("BLE {}: reusing link ({} references)", self.ctx.address, refs);
                return Ok(());
            }
            Some(state)
                if state.link().is_none()
                    && state.failure().is_none()
                    && !state.is_closing() =>
            {
                return Err(TransportError::NotFound(format!(
                    "no radio link for {}",
                    self.ctx.address
                )));
            }
            Some(stale) => {
                debug!("BLE {}: replacing stale link", self.ctx.address);
                stale.begin_closing();
                if let Some(link) = stale.take_link() {
                    link.close();
                }
                self.ctx.registry.reset(&self.ctx.address)
            }
            None => self.ctx.registry.find_or_create(&self.ctx.address),
        };

        if let Err(error) = self.open_link(&state) {
            self.abandon_attempt(&state, &error);
            return Err(error);
        }
        Ok(())
    }

    /// Tear down a failed connect attempt even if other sockets still hold
    /// references, so the next connect replaces the entry instead of reusing it.
    fn abandon_attempt(&mut self, state: &SharedConnectionState, error: &TransportError) {
        if state.fail(error.clone()) {
            debug!("BLE {}: connect attempt failed: {}", self.ctx.address, error);
        }
        if let Some(link) = state.take_link() {
            if matches!(
                link.connection_state(),
                LinkState::Connecting | LinkState::Connected
            ) {
                link.disconnect();
            }
            link.close();
        }
        state.set_phase(ConnectionPhase::Disconnected);
        self.release();
    }

    fn is_reusable(state: &SharedConnectionState) -> bool {
        if state.is_closing() || state.failure().is_some() || state.phase() != ConnectionPhase::Ready {
            return false;
        }
        state
            .link()
            .is_some_and(|link| link.connection_state() == LinkState::Connected)
    }

    fn open_link(&mut self, state: &Arc<SharedConnectionState>) -> Result<()> {
        let address = self.ctx.address.clone();
        state.prepare_read_buffer(GattCharacteristic::DataFromPrinter.uuid());
        state.set_phase(ConnectionPhase::Connecting);
        self.register_bond_receiver();
        self.ctx.registry.increment_ref(&address);
        self.opened = true;

        info!("BLE {}: connecting", address);
        let callback =
            LinkEventHandler::new(state.clone(), self.ctx.registry.clone(), self.platform.clone())
                .into_callback();
        let link = self.platform.connect_gatt(&address, callback).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("platform refused to connect to {}", address))
        })?;
        state.attach_link(link);

        let connect_timeout = self.ctx.config.connect_timeout();
        match state.wait_services_resolved(connect_timeout) {
            WaitOutcome::Ready => {}
            WaitOutcome::Failed(error) => return Err(error),
            WaitOutcome::TimedOut => {
                warn!("BLE {}: services not resolved after {:?}", address, connect_timeout);
                return Err(TransportError::Timeout {
                    operation: TimedOperation::Connect,
                    after: connect_timeout,
                });
            }
        }

        let bond_timeout = self.ctx.config.bond_timeout();
        match state.wait_paired(bond_timeout) {
            WaitOutcome::Ready => {}
            WaitOutcome::Failed(error) => return Err(error),
            WaitOutcome::TimedOut => {
                warn!("BLE {}: not paired after {:?}", address, bond_timeout);
                return Err(TransportError::Timeout {
                    operation: TimedOperation::Bond,
                    after: bond_timeout,
                });
            }
        }

        info!("BLE {}: connected", address);
        Ok(())
    }

    fn register_bond_receiver(&mut self) {
        if self.bond_receiver.is_some() {
            return;
        }
        let observer = BondObserver::new(
            self.ctx.address.clone(),
            self.ctx.registry.clone(),
            self.ctx.config.bond_settle_delay(),
        );
        match self.platform.register_bond_receiver(observer.into_callback()) {
            Ok(id) => self.bond_receiver = Some(id),
            Err(e) => warn!("BLE {}: {}", self.ctx.address, e),
        }
    }

    fn unregister_bond_receiver(&mut self) {
        if let Some(id) = self.bond_receiver.take() {
            if let Err(e) = self.platform.unregister_bond_receiver(id) {
                warn!("BLE {}: {}", self.ctx.address, e);
            }
        }
    }

    /// Write a payload, blocking until every chunk is acknowledged.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_payload(data)
    }

    /// Stream reading data indicated by the printer.
    pub fn read_stream(&self) -> BleInputStream {
        BleInputStream {
            ctx: self.ctx.clone(),
            staged: VecDeque::new(),
        }
    }

    /// `std::io::Write` view over [`BleSocket::write`].
    pub fn write_stream(&self) -> BleOutputStream {
        BleOutputStream {
            ctx: self.ctx.clone(),
        }
    }

    /// Release this socket's reference. The last reference tears the link down.
    pub fn close(&mut self) {
        if !self.opened && self.bond_receiver.is_none() {
            return;
        }
        let locks = self.ctx.registry.device_locks(&self.ctx.address);
        {
            let _connect_guard = locks.connect.lock();
            self.release();
        }
        self.ctx.registry.release_locks(&self.ctx.address, locks);
    }

    fn release(&mut self) {
        self.unregister_bond_receiver();
        if !self.opened {
            return;
        }
        self.opened = false;

        let registry = &self.ctx.registry;
        let address = &self.ctx.address;
        let remaining = registry.decrement_ref(address);
        if remaining > 0 {
            debug!("BLE {}: socket closed, {} references remain", address, remaining);
            return;
        }
        let Some(state) = registry.find(address) else {
            return;
        };

        let previous = state.begin_closing();
        if previous != ConnectionPhase::Disconnected {
            if let Some(link) = state.link() {
                link.disconnect();
                if registry.wait_removed(address, &state, self.ctx.config.close_timeout()) {
                    info!("BLE {}: closed", address);
                    return;
                }
                warn!(
                    "BLE {}: no disconnect after {:?}, forcing removal",
                    address,
                    self.ctx.config.close_timeout()
                );
            }
        }

        if let Some(link) = state.take_link() {
            link.close();
        }
        state.set_phase(ConnectionPhase::Disconnected);
        registry.remove_state(address, &state);
        info!("BLE {}: closed", address);
    }
}

impl Drop for BleSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BleSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSocket")
            .field("address", &self.ctx.address)
            .field("opened", &self.opened)
            .finish()
    }
}

// ============================================================================
// STREAMS
// ============================================================================

/// Reader over notifications from the printer.
///
/// Never reports end of stream: a read with nothing buffered returns zero
/// bytes immediately, and [`BleInputStream::read_timeout`] blocks for data.
pub struct BleInputStream {
    ctx: StreamContext,
    staged: VecDeque<u8>,
}

impl BleInputStream {
    /// Copy buffered bytes into `buf`. Returns 0 when nothing is buffered.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_buffered(buf)
    }

    /// Read one byte, or `None` when nothing is buffered.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.staged.is_empty() {
            self.refill()?;
        }
        Ok(self.staged.pop_front())
    }

    /// Bytes that can be read without blocking.
    pub fn available(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            self.refill()?;
        }
        Ok(self.staged.len())
    }

    /// Like [`read`](Self::read) but waits up to `timeout` for data to arrive.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.staged.is_empty() {
            let state = self.ctx.resolve()?;
            let channel = GattCharacteristic::DataFromPrinter.uuid();
            if let WaitOutcome::Failed(error) = state.wait_for_data(channel, timeout) {
                return Err(error);
            }
        }
        self.read_buffered(buf)
    }

    fn read_buffered(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.staged.is_empty() {
            self.refill()?;
        }
        let count = buf.len().min(self.staged.len());
        for (slot, byte) in buf.iter_mut().zip(self.staged.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn refill(&mut self) -> Result<()> {
        let state = self.ctx.resolve()?;
        self.staged
            .extend(state.drain_read_buffer(GattCharacteristic::DataFromPrinter.uuid()));
        Ok(())
    }
}

impl io::Read for BleInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_buffered(buf)? {
            0 if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }
}

/// Writer sending data to the printer in acknowledged chunks.
pub struct BleOutputStream {
    ctx: StreamContext,
}

impl BleOutputStream {
    pub fn write_payload(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_payload(data)
    }
}

impl io::Write for BleOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.write_payload(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
