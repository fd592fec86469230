//! Well-known Bluetooth SIG UUIDs.
//!
//! Contains the UUID constants the engine itself depends on. Names for
//! display live in [`crate::ble::names`].

use uuid::Uuid;

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

// GATT Services (Standard BLE)
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_00805f9b34fb);
/// Generic Attribute service UUID.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1801_0000_1000_8000_00805f9b34fb);
/// Device Information service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
/// Battery service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);

// Descriptors
/// Characteristic Extended Properties descriptor UUID.
pub const EXTENDED_PROPERTIES_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2900_0000_1000_8000_00805f9b34fb);
/// Characteristic User Description descriptor UUID.
pub const USER_DESCRIPTION_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2901_0000_1000_8000_00805f9b34fb);
/// Client Characteristic Configuration descriptor UUID (CCCD).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);
/// Characteristic Presentation Format descriptor UUID.
pub const PRESENTATION_FORMAT_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2904_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16-bit SIG-assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit SIG-assigned number if `uuid` is built on the base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask: u128 = (1u128 << 96) - 1;
    if value & base_mask != BLUETOOTH_BASE_UUID.as_u128() || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}
