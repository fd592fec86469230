//! Error types for the blelink crate.

use thiserror::Error;

use crate::platform::{GattStatus, PlatformError};

/// A precondition that must hold before the radio can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precondition {
    /// The host has no Bluetooth LE radio.
    RadioUnsupported,
    /// The radio is present but powered off.
    RadioPoweredOff,
    /// The application lacks the permission to use the radio.
    PermissionMissing,
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RadioUnsupported => write!(f, "Bluetooth LE is not supported on this host"),
            Self::RadioPoweredOff => write!(f, "Bluetooth is powered off"),
            Self::PermissionMissing => write!(f, "Bluetooth permission not granted"),
        }
    }
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The platform refused or could not carry out a request.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The radio cannot be used right now; retrying will not help until the
    /// precondition is fixed.
    #[error("Precondition failed: {reason}")]
    PreconditionFailed {
        /// Which precondition was violated.
        reason: Precondition,
    },

    /// The radio reported a failure while scanning. Scanning has stopped.
    #[error("Scan failed with code {code}")]
    ScanFailed {
        /// Platform scan failure code.
        code: i32,
    },

    /// Operation requires a link but none is active.
    #[error("Not connected")]
    NotConnected,

    /// The UUID is not part of the current discovery snapshot.
    #[error("Attribute not found: {uuid}")]
    NotFound {
        /// The UUID that was looked up.
        uuid: String,
    },

    /// The characteristic supports none of the write modes.
    #[error("Characteristic {uuid} cannot be written to")]
    NotWritable {
        /// The UUID of the characteristic.
        uuid: String,
    },

    /// Local delivery of notifications could not be enabled.
    #[error("Unable to register for notifications on {uuid}")]
    NotifyRegistrationFailed {
        /// The UUID of the characteristic.
        uuid: String,
    },

    /// The platform rejected or failed a read or write.
    #[error("GATT operation failed: {status}")]
    OperationFailed {
        /// Status code reported by the platform.
        status: GattStatus,
    },

    /// Failed to establish a connection.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The link was torn down while the request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// The platform did not complete the request in time.
    #[error("GATT operation timed out")]
    Timeout,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed { .. }
                | Self::OperationFailed { .. }
                | Self::ConnectionFailed { .. }
                | Self::ConnectionLost
                | Self::Timeout
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
