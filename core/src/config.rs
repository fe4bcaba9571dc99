// Transport configuration
//
// All timeouts are stored in milliseconds so the struct round-trips through
// JSON without custom Duration handling.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::transport::ble::gatt::{DEFAULT_MTU_SIZE, MAX_MTU_SIZE, MTU_OFFSET};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid timeout for {0}: must be > 0")]
    InvalidTimeout(&'static str),

    #[error("Invalid MTU request {0}: must be between {min} and {max}", min = DEFAULT_MTU_SIZE, max = MAX_MTU_SIZE)]
    InvalidMtu(usize),

    #[error("Invalid MTU wait: attempts and interval must be > 0")]
    InvalidMtuWait,
}

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Timeouts and tuning knobs for BLE printer sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Radio connect + service resolution bound (default 30 s)
    pub connect_timeout_ms: u64,
    /// Pairing / descriptor subscription bound (default 30 s)
    pub bond_timeout_ms: u64,
    /// Per-chunk write completion bound (default 10 s)
    pub write_timeout_ms: u64,
    /// Physical teardown bound before force-removal (default 1.5 s)
    pub close_timeout_ms: u64,
    /// MTU value requested on the first write of a channel
    pub requested_mtu: usize,
    /// Number of MTU-completion checks before giving up
    pub mtu_poll_attempts: u32,
    /// Spacing between MTU-completion checks
    pub mtu_poll_interval_ms: u64,
    /// Pause after a Bonded broadcast before retrying the subscription
    pub bond_settle_delay_ms: u64,
    /// Pause after a connector open before handing out the socket
    pub open_settle_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            bond_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            close_timeout_ms: 1_500,
            requested_mtu: MAX_MTU_SIZE,
            mtu_poll_attempts: 100,
            mtu_poll_interval_ms: 100,
            bond_settle_delay_ms: 1_000,
            open_settle_delay_ms: 1_000,
        }
    }
}

impl TransportConfig {
    /// Load configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: TransportConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connect", self.connect_timeout_ms),
            ("bond", self.bond_timeout_ms),
            ("write", self.write_timeout_ms),
            ("close", self.close_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout(name));
            }
        }
        if self.requested_mtu < DEFAULT_MTU_SIZE || self.requested_mtu > MAX_MTU_SIZE {
            return Err(ConfigError::InvalidMtu(self.requested_mtu));
        }
        if self.mtu_poll_attempts == 0 || self.mtu_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidMtuWait);
        }
        Ok(())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_bond_timeout(mut self, timeout: Duration) -> Self {
        self.bond_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the MTU completion wait as `attempts × interval`.
    pub fn with_mtu_wait(mut self, attempts: u32, interval: Duration) -> Self {
        self.mtu_poll_attempts = attempts;
        self.mtu_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_settle_delays(mut self, bond: Duration, open: Duration) -> Self {
        self.bond_settle_delay_ms = bond.as_millis() as u64;
        self.open_settle_delay_ms = open.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bond_timeout(&self) -> Duration {
        Duration::from_millis(self.bond_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Total time spent waiting for an MTU completion event.
    pub fn mtu_wait(&self) -> Duration {
        Duration::from_millis(self.mtu_poll_interval_ms) * self.mtu_poll_attempts
    }

    pub fn bond_settle_delay(&self) -> Duration {
        Duration::from_millis(self.bond_settle_delay_ms)
    }

    pub fn open_settle_delay(&self) -> Duration {
        Duration::from_millis(self.open_settle_delay_ms)
    }

    /// Payload size in effect before any MTU negotiation.
    pub fn default_payload_size(&self) -> usize {
        DEFAULT_MTU_SIZE - MTU_OFFSET
    }
}
