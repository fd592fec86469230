//! Runtime configuration.

use std::time::Duration;

use crate::platform::ScanMode;

/// Tunables for [`crate::BleService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleConfig {
    /// Duty cycle requested when scanning.
    pub scan_mode: ScanMode,
    /// Upper bound for connect plus service discovery.
    pub connect_timeout: Duration,
    /// Upper bound for a single in-flight GATT request. When it expires the
    /// request fails with [`crate::Error::Timeout`] and the link is closed.
    pub operation_timeout: Duration,
    /// Capacity of the broadcast event channels.
    pub event_capacity: usize,
}

impl BleConfig {
    /// Default connect timeout (30 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default GATT request timeout (30 seconds), matching common host stacks.
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default broadcast channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Set the scan duty cycle.
    pub fn with_scan_mode(mut self, scan_mode: ScanMode) -> Self {
        self.scan_mode = scan_mode;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the GATT request timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the broadcast channel capacity. Zero is raised to one.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::LowLatency,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}
