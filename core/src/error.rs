//! Error types for the BLE printer transport.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Blocking operations that are policed by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOperation {
    /// Radio connect and service resolution
    Connect,
    /// Pairing / notification subscription
    Bond,
    /// Completion of a single characteristic write
    Write,
}

impl std::fmt::Display for TimedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Bond => write!(f, "pairing"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Errors surfaced by sockets, the connector and the registry.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("No radio link found: {0}")]
    NotFound(String),

    #[error("Timed out waiting for {operation} after {after:?}")]
    Timeout {
        operation: TimedOperation,
        after: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Platform refused characteristic write")]
    WriteRejected,
}

impl TransportError {
    /// Whether the reconnection layer may retry with a fresh socket.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionFailed(_) | Self::WriteRejected
        )
    }
}

impl From<ConfigError> for TransportError {
    fn from(err: ConfigError) -> Self {
        TransportError::Configuration(err.to_string())
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Configuration(_) | TransportError::InvalidAddress(_) => {
                io::ErrorKind::InvalidInput
            }
            TransportError::NotFound(_) => io::ErrorKind::NotConnected,
            TransportError::Timeout { .. } => io::ErrorKind::TimedOut,
            TransportError::Protocol(_) => io::ErrorKind::InvalidData,
            TransportError::ConnectionFailed(_) => io::ErrorKind::ConnectionAborted,
            TransportError::WriteRejected => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
