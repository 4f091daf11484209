use thiserror::Error;
use uuid::Uuid;

use crate::{catalog::Characteristic, types::ConnectionState};

/// Errors that can occur when working with Cradle smart lights
#[derive(Error, Debug)]
pub enum CradleError {
    /// Bluetooth Low Energy stack errors
    #[cfg(feature = "btleplug")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// A required runtime permission is missing
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The address is unknown to the radio stack (never seen by a scan)
    #[error("Bluetooth device {address} not found, please scan first")]
    PeripheralUnresolvable {
        /// Address passed to `connect`
        address: String,
    },

    /// `connect` was called while a link is still held
    #[error("Already connected to {address}")]
    AlreadyConnected {
        /// Address of the link currently held
        address: String,
    },

    /// A read or write was attempted before services were discovered
    #[error("Device not ready: connection state is {state}")]
    NotReady {
        /// Connection state at the time of the call
        state: ConnectionState,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Payload parsing failed
    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    /// A characteristic identifier is not part of the service layout
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    /// Two entries of one service layout share an identifier
    #[error("Characteristic {uuid} is mapped to both {first} and {second}")]
    DuplicateCharacteristic {
        /// The shared identifier
        uuid: Uuid,
        /// Logical characteristic registered first
        first: Characteristic,
        /// Logical characteristic that collided
        second: Characteristic,
    },

    /// Radio-level scan failure
    #[error("Scan failed with code {code}")]
    ScanHardwareFailure {
        /// Radio stack error code
        code: i32,
    },

    /// The link was lost unexpectedly
    #[error("Link lost")]
    LinkLost,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Transport-level failure not covered by the other variants
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for Cradle light operations
pub type Result<T> = std::result::Result<T, CradleError>;

impl CradleError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            #[cfg(feature = "btleplug")]
            Self::Ble(_) => true,
            Self::PeripheralUnresolvable { .. }
            | Self::LinkLost
            | Self::Timeout { .. }
            | Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Check if the caller can retry the same call without rescanning
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotReady { .. } | Self::InvalidParameters(_) | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let unresolvable = CradleError::PeripheralUnresolvable {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        assert!(unresolvable.is_connection_error());
        assert!(!unresolvable.is_recoverable());

        let not_ready = CradleError::NotReady {
            state: ConnectionState::Connected,
        };
        assert!(!not_ready.is_connection_error());
        assert!(not_ready.is_recoverable());

        let timeout = CradleError::Timeout { timeout_ms: 5000 };
        assert!(timeout.is_connection_error());
        assert!(timeout.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = CradleError::InvalidParameters("hour 24 is out of range (0-23)".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("hour 24"));

        let error = CradleError::NotReady {
            state: ConnectionState::Disconnected,
        };
        assert_eq!(
            error.to_string(),
            "Device not ready: connection state is Disconnected"
        );
    }
}
