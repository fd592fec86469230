//! Advertisement sightings and the scan results built from them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::ble::names;

/// Display name used when a device does not advertise one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// RSSI reported when the platform could not measure signal strength.
pub const RSSI_UNAVAILABLE: i16 = -127;

/// One advertisement as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Stable device identifier (MAC address or platform id).
    pub address: String,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Bytes>,
}

impl Advertisement {
    /// Create an advertisement without name or manufacturer data.
    pub fn new(address: impl Into<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            rssi,
            local_name: None,
            manufacturer_data: BTreeMap::new(),
        }
    }

    /// Set the advertised local name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Add a manufacturer specific data entry.
    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Bytes>) -> Self {
        self.manufacturer_data.insert(company_id, data.into());
        self
    }
}

/// Manufacturer of an advertising device.
///
/// `Unknown` and `Unavailable` are kept apart: the former means the device
/// sent manufacturer data under a company id missing from the table, the
/// latter that it sent none at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Manufacturer {
    /// Company identifier found in the table.
    Known {
        /// Bluetooth SIG company identifier.
        company_id: u16,
        /// Company name.
        name: &'static str,
    },
    /// Manufacturer data present, company not recognised.
    Unknown,
    /// No manufacturer data in the advertisement.
    Unavailable,
}

impl Manufacturer {
    /// Resolve from manufacturer specific data. The lowest recognised
    /// company id wins.
    pub fn resolve(manufacturer_data: &BTreeMap<u16, Bytes>) -> Self {
        if manufacturer_data.is_empty() {
            return Self::Unavailable;
        }

        manufacturer_data
            .keys()
            .find_map(|&company_id| {
                names::manufacturer_name(company_id).map(|name| Self::Known { company_id, name })
            })
            .unwrap_or(Self::Unknown)
    }

    /// Readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Known { name, .. } => *name,
            Self::Unknown => "Unknown Manufacturer",
            Self::Unavailable => "Unknown Manufacturer [Manufacturer Specific Data unavailable]",
        }
    }
}

impl std::fmt::Display for Manufacturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A device found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ScanResult {
    /// Stable device identifier; unique within a scan session.
    pub address: String,
    /// Advertised name or [`UNKNOWN_DEVICE_NAME`].
    pub display_name: String,
    /// Latest signal strength in dBm.
    pub rssi: i16,
    /// Manufacturer resolved from the first sighting.
    pub manufacturer: Manufacturer,
    /// Time of the first sighting in this session.
    pub discovered_at: DateTime<Utc>,
}

impl ScanResult {
    /// Build a result from the first sighting of a device.
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        Self {
            address: advertisement.address.clone(),
            display_name: advertisement
                .local_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            rssi: advertisement.rssi,
            manufacturer: Manufacturer::resolve(&advertisement.manufacturer_data),
            discovered_at: Utc::now(),
        }
    }
}
