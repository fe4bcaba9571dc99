/// Canonical Bluetooth device address
///
/// Every registry and state lookup is keyed by the normalized
/// `AA:BB:CC:DD:EE:FF` form so that differently formatted inputs for the same
/// printer always resolve to the same shared link.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse and normalize an address.
    ///
    /// Accepts 12 hex digits, optionally separated by `:` or `-`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let compact: String = trimmed.chars().filter(|c| *c != ':' && *c != '-').collect();
        if compact.len() != 12 {
            return Err(TransportError::InvalidAddress(input.to_string()));
        }
        let separated = trimmed.len() != compact.len();
        if separated && trimmed.len() != 17 {
            return Err(TransportError::InvalidAddress(input.to_string()));
        }
        let bytes =
            hex::decode(&compact).map_err(|_| TransportError::InvalidAddress(input.to_string()))?;
        Ok(Self::from_bytes(&bytes))
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        Self(parts.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
