//! GATT attribute model.
//!
//! Immutable value types describing what service discovery found on a
//! peer. Capability flags are derived once, when a raw discovery record is
//! mapped into the model, and never recomputed afterwards.
//!
//! The tree is built from `Arc`s at every level so that replacing a single
//! cached value only reallocates the path from the root to that leaf.

use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

use crate::ble::names;
use crate::platform::{RawCharacteristic, RawDescriptor, RawService, WriteType};

/// A characteristic property bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum Property {
    /// Value may be broadcast in advertisements.
    Broadcast = 0x01,
    /// Value may be read.
    Read = 0x02,
    /// Value may be written without response.
    WriteWithoutResponse = 0x04,
    /// Value may be written with response.
    Write = 0x08,
    /// Peer may push notifications.
    Notify = 0x10,
    /// Peer may push indications.
    Indicate = 0x20,
    /// Value may be written with an authenticated signature.
    SignedWrite = 0x40,
    /// Extended properties descriptor is present.
    ExtendedProperties = 0x80,
}

impl Property {
    /// All properties in bit order.
    pub const ALL: [Property; 8] = [
        Self::Broadcast,
        Self::Read,
        Self::WriteWithoutResponse,
        Self::Write,
        Self::Notify,
        Self::Indicate,
        Self::SignedWrite,
        Self::ExtendedProperties,
    ];

    /// The bit this property occupies in the property bitmask.
    pub fn bit(&self) -> u8 {
        *self as u8
    }

    /// Decode a property bitmask into the set of properties it contains.
    pub fn from_bits(bits: u8) -> Vec<Property> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| bits & p.bit() != 0)
            .collect()
    }

    /// Readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Broadcast => "Broadcast",
            Self::Read => "Read",
            Self::WriteWithoutResponse => "Write No Response",
            Self::Write => "Write",
            Self::Notify => "Notify",
            Self::Indicate => "Indicate",
            Self::SignedWrite => "Signed Write",
            Self::ExtendedProperties => "Extended Properties",
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A descriptor permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u16)]
pub enum Permission {
    /// Readable.
    Read = 0x0001,
    /// Readable over an encrypted link.
    ReadEncrypted = 0x0002,
    /// Readable over an encrypted, MITM-protected link.
    ReadEncryptedMitm = 0x0004,
    /// Writable.
    Write = 0x0010,
    /// Writable over an encrypted link.
    WriteEncrypted = 0x0020,
    /// Writable over an encrypted, MITM-protected link.
    WriteEncryptedMitm = 0x0040,
    /// Writable with a signature.
    WriteSigned = 0x0080,
    /// Writable with a signature over a MITM-protected link.
    WriteSignedMitm = 0x0100,
}

impl Permission {
    /// All permissions in bit order.
    pub const ALL: [Permission; 8] = [
        Self::Read,
        Self::ReadEncrypted,
        Self::ReadEncryptedMitm,
        Self::Write,
        Self::WriteEncrypted,
        Self::WriteEncryptedMitm,
        Self::WriteSigned,
        Self::WriteSignedMitm,
    ];

    /// The bit this permission occupies in the permission bitmask.
    pub fn bit(&self) -> u16 {
        *self as u16
    }

    /// Decode a permission bitmask into the set of permissions it contains.
    pub fn from_bits(bits: u16) -> Vec<Permission> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| bits & p.bit() != 0)
            .collect()
    }

    /// Whether this permission grants reading.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::Read | Self::ReadEncrypted | Self::ReadEncryptedMitm
        )
    }

    /// Whether this permission grants writing.
    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    /// Readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::ReadEncrypted => "Read Encrypted",
            Self::ReadEncryptedMitm => "Read Encrypted MITM",
            Self::Write => "Write",
            Self::WriteEncrypted => "Write Encrypted",
            Self::WriteEncryptedMitm => "Write Encrypted MITM",
            Self::WriteSigned => "Write Signed",
            Self::WriteSignedMitm => "Write Signed MITM",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Value format from a Characteristic Presentation Format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FormatType {
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 8-bit integer.
    SInt8,
    /// Signed 16-bit integer.
    SInt16,
    /// Signed 32-bit integer.
    SInt32,
    /// IEEE-11073 16-bit float.
    SFloat,
    /// IEEE-11073 32-bit float.
    Float,
    /// Not reported or not recognised.
    #[default]
    Unknown,
}

impl FormatType {
    /// Create from the raw format byte.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x11 => Self::UInt8,
            0x12 => Self::UInt16,
            0x14 => Self::UInt32,
            0x21 => Self::SInt8,
            0x22 => Self::SInt16,
            0x24 => Self::SInt32,
            0x32 => Self::SFloat,
            0x34 => Self::Float,
            _ => Self::Unknown,
        }
    }

    /// Upper-case type name, e.g. `UINT16`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UInt8 => "UINT8",
            Self::UInt16 => "UINT16",
            Self::UInt32 => "UINT32",
            Self::SInt8 => "SINT8",
            Self::SInt16 => "SINT16",
            Self::SInt32 => "SINT32",
            Self::SFloat => "SFLOAT",
            Self::Float => "FLOAT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// What a characteristic allows, derived from its property bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    /// READ is set.
    pub readable: bool,
    /// WRITE, WRITE_NO_RESPONSE or SIGNED_WRITE is set.
    pub writable: bool,
    /// NOTIFY is set.
    pub notifiable: bool,
    /// INDICATE is set.
    pub indicatable: bool,
    /// Preferred write mode: with response, then without, then signed.
    pub write_type: Option<WriteType>,
}

impl Capabilities {
    /// Derive capabilities from a property bitmask.
    pub fn from_properties(bits: u8) -> Self {
        let has = |p: Property| bits & p.bit() != 0;

        let write_type = if has(Property::Write) {
            Some(WriteType::WithResponse)
        } else if has(Property::WriteWithoutResponse) {
            Some(WriteType::WithoutResponse)
        } else if has(Property::SignedWrite) {
            Some(WriteType::Signed)
        } else {
            None
        };

        Self {
            readable: has(Property::Read),
            writable: write_type.is_some(),
            notifiable: has(Property::Notify),
            indicatable: has(Property::Indicate),
            write_type,
        }
    }
}

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GattDescriptor {
    /// Descriptor UUID.
    pub uuid: Uuid,
    /// Readable name.
    pub name: &'static str,
    /// Permissions reported by the platform.
    pub permissions: Vec<Permission>,
    /// Any read permission is present.
    pub is_readable: bool,
    /// Any write permission is present.
    pub is_writable: bool,
    /// Value from the last successful read.
    pub last_read_value: Option<Bytes>,
}

impl GattDescriptor {
    /// Map a raw discovery record.
    pub fn from_raw(raw: &RawDescriptor) -> Self {
        let permissions = Permission::from_bits(raw.permissions);
        Self {
            uuid: raw.uuid,
            name: names::descriptor_name(&raw.uuid),
            is_readable: permissions.iter().any(Permission::is_read),
            is_writable: permissions.iter().any(Permission::is_write),
            permissions,
            last_read_value: None,
        }
    }

    /// Copy with a new cached value.
    pub fn with_value(&self, value: Bytes) -> Self {
        Self {
            last_read_value: Some(value),
            ..self.clone()
        }
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Readable name.
    pub name: &'static str,
    /// Properties reported by the platform.
    pub properties: Vec<Property>,
    /// READ is set.
    pub is_readable: bool,
    /// Any write property is set.
    pub is_writable: bool,
    /// NOTIFY is set.
    pub is_notifiable: bool,
    /// INDICATE is set.
    pub is_indicatable: bool,
    /// Write mode used by `write_characteristic`.
    pub write_type: Option<WriteType>,
    /// Presentation format.
    pub format_type: FormatType,
    /// Value from the last read or notification.
    pub last_read_value: Option<Bytes>,
    /// Attached descriptors in discovery order.
    pub descriptors: Vec<Arc<GattDescriptor>>,
}

impl GattCharacteristic {
    /// Map a raw discovery record.
    pub fn from_raw(raw: &RawCharacteristic) -> Self {
        let caps = Capabilities::from_properties(raw.properties);
        Self {
            uuid: raw.uuid,
            name: names::characteristic_name(&raw.uuid),
            properties: Property::from_bits(raw.properties),
            is_readable: caps.readable,
            is_writable: caps.writable,
            is_notifiable: caps.notifiable,
            is_indicatable: caps.indicatable,
            write_type: caps.write_type,
            format_type: raw.format.map(FormatType::from_raw).unwrap_or_default(),
            last_read_value: None,
            descriptors: raw
                .descriptors
                .iter()
                .map(|d| Arc::new(GattDescriptor::from_raw(d)))
                .collect(),
        }
    }

    /// Copy with a new cached value. Descriptors are shared, not cloned.
    pub fn with_value(&self, value: Bytes) -> Self {
        Self {
            last_read_value: Some(value),
            ..self.clone()
        }
    }

    /// Find an attached descriptor.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Arc<GattDescriptor>> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    /// Whether the peer can push values.
    pub fn supports_push(&self) -> bool {
        self.is_notifiable || self.is_indicatable
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Readable name.
    pub name: &'static str,
    /// Characteristics in discovery order.
    pub characteristics: Vec<Arc<GattCharacteristic>>,
}

impl GattService {
    /// Map a raw discovery record.
    pub fn from_raw(raw: &RawService) -> Self {
        Self {
            uuid: raw.uuid,
            name: names::service_name(&raw.uuid),
            characteristics: raw
                .characteristics
                .iter()
                .map(|c| Arc::new(GattCharacteristic::from_raw(c)))
                .collect(),
        }
    }

    /// Find a characteristic in this service.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Arc<GattCharacteristic>> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Find a characteristic anywhere in a service list.
pub fn find_characteristic<'a>(
    services: &'a [Arc<GattService>],
    uuid: &Uuid,
) -> Option<&'a Arc<GattCharacteristic>> {
    services.iter().find_map(|s| s.characteristic(uuid))
}
