//! The boundary between the engine and a host Bluetooth stack.
//!
//! The engine never talks to a radio directly. It issues requests through
//! [`BlePlatform`] and receives the outcome later through the sink handed over
//! when the scan or the link was started, which mirrors how host stacks
//! report advertisement and GATT callbacks.
//!
//! Contract for implementors:
//!
//! - Issue calls return promptly. `Err` means the request was not accepted
//!   and no callback will follow.
//! - Every accepted GATT request yields exactly one completion on the
//!   [`GattSink`] of its link, in issuance order.
//! - Unsolicited value pushes are reported with
//!   [`GattSink::characteristic_changed`] and may interleave with completions.

pub mod native;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::connection::Inbound;
use crate::ble::scanner::ScanShared;
use crate::error::{Error, Precondition};

pub use native::BtleplugPlatform;

/// Identifies one connection attempt. Minted by the connection manager on
/// every `connect`; callbacks tagged with an older id are discarded.
pub type LinkId = u64;

/// Platform handle of a characteristic or descriptor on a link.
pub type AttributeHandle = u16;

/// Status code attached to a GATT completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GattStatus(pub i32);

impl GattStatus {
    /// The request succeeded.
    pub const SUCCESS: Self = Self(0);
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: Self = Self(2);
    /// The attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: Self = Self(3);
    /// The link is not authenticated.
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(5);
    /// The peer does not support the request.
    pub const REQUEST_NOT_SUPPORTED: Self = Self(6);
    /// Read or write offset out of range.
    pub const INVALID_OFFSET: Self = Self(7);
    /// The link is not authorized.
    pub const INSUFFICIENT_AUTHORIZATION: Self = Self(8);
    /// Written value has the wrong length.
    pub const INVALID_ATTRIBUTE_LENGTH: Self = Self(13);
    /// The link is not encrypted.
    pub const INSUFFICIENT_ENCRYPTION: Self = Self(15);
    /// The peer closed the link.
    pub const REMOTE_USER_TERMINATED: Self = Self(19);
    /// Generic stack error.
    pub const GATT_ERROR: Self = Self(133);
    /// Too many requests queued on the link.
    pub const CONNECTION_CONGESTED: Self = Self(143);
    /// Unspecified failure.
    pub const FAILURE: Self = Self(257);

    /// Check if this status reports success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Human readable name of a well-known status.
    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "success",
            2 => "read not permitted",
            3 => "write not permitted",
            5 => "insufficient authentication",
            6 => "request not supported",
            7 => "invalid offset",
            8 => "insufficient authorization",
            13 => "invalid attribute length",
            15 => "insufficient encryption",
            19 => "remote user terminated",
            133 => "gatt error",
            143 => "connection congested",
            257 => "failure",
            _ => "unknown status",
        }
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Scan failure codes reported through [`ScanSink::scan_failed`].
pub mod scan_failure {
    /// A scan with the same callback is already running.
    pub const ALREADY_STARTED: i32 = 1;
    /// The scan could not be registered with the stack.
    pub const APPLICATION_REGISTRATION_FAILED: i32 = 2;
    /// The stack failed internally.
    pub const INTERNAL_ERROR: i32 = 3;
    /// The host does not support the requested scan.
    pub const FEATURE_UNSUPPORTED: i32 = 4;
}

/// Availability of the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    /// No Bluetooth LE radio present.
    Unsupported,
    /// Radio present but switched off.
    PoweredOff,
    /// Permission to use the radio has not been granted.
    Unauthorized,
    /// Ready for use.
    PoweredOn,
}

/// Fail with [`Error::PreconditionFailed`] unless the radio is powered on.
pub(crate) async fn ensure_radio_ready(platform: &dyn BlePlatform) -> crate::error::Result<()> {
    let reason = match platform.radio_state().await {
        RadioState::PoweredOn => return Ok(()),
        RadioState::Unsupported => Precondition::RadioUnsupported,
        RadioState::PoweredOff => Precondition::RadioPoweredOff,
        RadioState::Unauthorized => Precondition::PermissionMissing,
    };
    Err(Error::PreconditionFailed { reason })
}

/// Duty cycle requested for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanMode {
    /// Long scan intervals, lowest power draw.
    LowPower,
    /// Compromise between discovery latency and power.
    Balanced,
    /// Continuous scanning, fastest discovery.
    #[default]
    LowLatency,
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WriteType {
    /// Write request, acknowledged by the peer.
    WithResponse,
    /// Write command, not acknowledged.
    WithoutResponse,
    /// Authenticated signed write command.
    Signed,
}

impl WriteType {
    /// Whether the caller must wait for the peer's acknowledgement.
    pub fn requires_response(&self) -> bool {
        matches!(self, Self::WithResponse)
    }
}

/// Failure to accept a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The stack rejected the request with a status code.
    #[error("request rejected: {0}")]
    Rejected(GattStatus),

    /// No device with this address is known to the stack.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// No link with this id is open.
    #[error("unknown link: {0}")]
    UnknownLink(LinkId),

    /// The handle does not belong to the link.
    #[error("unknown attribute handle: {0}")]
    UnknownHandle(AttributeHandle),

    /// Backend specific failure.
    #[error("{0}")]
    Backend(String),
}

/// A descriptor as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    /// Platform handle.
    pub handle: AttributeHandle,
    /// Descriptor UUID.
    pub uuid: Uuid,
    /// Permission bitmask.
    pub permissions: u16,
}

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCharacteristic {
    /// Platform handle.
    pub handle: AttributeHandle,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bitmask.
    pub properties: u8,
    /// Presentation format byte, when the platform knows it.
    pub format: Option<u8>,
    /// Attached descriptors in discovery order.
    pub descriptors: Vec<RawDescriptor>,
}

/// A service as reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<RawCharacteristic>,
}

/// Callback from the platform for one link.
#[derive(Debug, Clone)]
pub enum GattEvent {
    /// The link-layer connection is up.
    Connected,
    /// The link went down, or the connection attempt failed.
    Disconnected {
        /// Reason reported by the stack.
        status: GattStatus,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Discovery status.
        status: GattStatus,
        /// Discovered services.
        services: Vec<RawService>,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// Characteristic handle.
        handle: AttributeHandle,
        /// Completion status.
        status: GattStatus,
        /// Value read, empty on failure.
        value: Bytes,
    },
    /// A characteristic write finished.
    CharacteristicWritten {
        /// Characteristic handle.
        handle: AttributeHandle,
        /// Completion status.
        status: GattStatus,
    },
    /// A descriptor read finished.
    DescriptorRead {
        /// Descriptor handle.
        handle: AttributeHandle,
        /// Completion status.
        status: GattStatus,
        /// Value read, empty on failure.
        value: Bytes,
    },
    /// A descriptor write finished.
    DescriptorWritten {
        /// Descriptor handle.
        handle: AttributeHandle,
        /// Completion status.
        status: GattStatus,
    },
    /// The peer pushed a notification or indication.
    CharacteristicChanged {
        /// Characteristic handle.
        handle: AttributeHandle,
        /// Pushed value.
        value: Bytes,
    },
}

/// Receives advertisement callbacks for one scan session.
#[derive(Clone)]
pub struct ScanSink {
    shared: Arc<ScanShared>,
    session: u64,
}

impl ScanSink {
    pub(crate) fn new(shared: Arc<ScanShared>, session: u64) -> Self {
        Self { shared, session }
    }

    /// Report an advertisement sighting.
    pub fn advertisement(&self, advertisement: Advertisement) {
        self.shared.on_advertisement(self.session, advertisement);
    }

    /// Report that the stack aborted the scan.
    pub fn scan_failed(&self, code: i32) {
        self.shared.on_scan_failed(self.session, code);
    }
}

impl std::fmt::Debug for ScanSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSink")
            .field("session", &self.session)
            .finish()
    }
}

/// Receives GATT callbacks for one link and forwards them to the
/// connection manager's inbox.
#[derive(Clone)]
pub struct GattSink {
    link: LinkId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl GattSink {
    pub(crate) fn new(link: LinkId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { link, tx }
    }

    /// The link this sink reports for.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Deliver a raw event.
    pub fn send(&self, event: GattEvent) {
        if self
            .tx
            .send(Inbound::Event {
                link: self.link,
                event,
            })
            .is_err()
        {
            trace!("Connection manager gone, dropping callback for link {}", self.link);
        }
    }

    /// The link-layer connection is up.
    pub fn connected(&self) {
        self.send(GattEvent::Connected);
    }

    /// The link went down or could not be established.
    pub fn disconnected(&self, status: GattStatus) {
        self.send(GattEvent::Disconnected { status });
    }

    /// Service discovery finished.
    pub fn services_discovered(&self, status: GattStatus, services: Vec<RawService>) {
        self.send(GattEvent::ServicesDiscovered { status, services });
    }

    /// A characteristic read finished.
    pub fn characteristic_read(&self, handle: AttributeHandle, status: GattStatus, value: Bytes) {
        self.send(GattEvent::CharacteristicRead {
            handle,
            status,
            value,
        });
    }

    /// A characteristic write finished.
    pub fn characteristic_written(&self, handle: AttributeHandle, status: GattStatus) {
        self.send(GattEvent::CharacteristicWritten { handle, status });
    }

    /// A descriptor read finished.
    pub fn descriptor_read(&self, handle: AttributeHandle, status: GattStatus, value: Bytes) {
        self.send(GattEvent::DescriptorRead {
            handle,
            status,
            value,
        });
    }

    /// A descriptor write finished.
    pub fn descriptor_written(&self, handle: AttributeHandle, status: GattStatus) {
        self.send(GattEvent::DescriptorWritten { handle, status });
    }

    /// The peer pushed a new value.
    pub fn characteristic_changed(&self, handle: AttributeHandle, value: Bytes) {
        self.send(GattEvent::CharacteristicChanged { handle, value });
    }
}

impl std::fmt::Debug for GattSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattSink").field("link", &self.link).finish()
    }
}

/// A host Bluetooth LE stack acting as GATT client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Current availability of the radio.
    async fn radio_state(&self) -> RadioState;

    /// Start delivering advertisements to `sink`.
    async fn start_scan(&self, mode: ScanMode, sink: ScanSink) -> Result<(), PlatformError>;

    /// Stop delivering advertisements.
    async fn stop_scan(&self) -> Result<(), PlatformError>;

    /// Open a link to `address`. The outcome arrives as
    /// [`GattEvent::Connected`] or [`GattEvent::Disconnected`].
    async fn connect(&self, address: &str, sink: GattSink) -> Result<(), PlatformError>;

    /// Enumerate the peer's attributes. Completes with
    /// [`GattEvent::ServicesDiscovered`].
    async fn discover_services(&self, link: LinkId) -> Result<(), PlatformError>;

    /// Close the link and release everything held for it. No callback
    /// follows.
    async fn disconnect(&self, link: LinkId) -> Result<(), PlatformError>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> Result<(), PlatformError>;

    /// Write a characteristic value.
    async fn write_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), PlatformError>;

    /// Read a descriptor value.
    async fn read_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> Result<(), PlatformError>;

    /// Write a descriptor value.
    async fn write_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
    ) -> Result<(), PlatformError>;

    /// Locally enable or disable delivery of value pushes for a
    /// characteristic. Does not talk to the peer.
    async fn set_notifications(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        enable: bool,
    ) -> Result<(), PlatformError>;
}
