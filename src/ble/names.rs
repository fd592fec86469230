//! Human readable names for services, characteristics, descriptors and
//! manufacturer company identifiers.
//!
//! Lookups are pure functions over static tables. Unknown UUIDs resolve to
//! `"Unknown Service"`, `"Unknown Characteristic"` or `"Unknown Descriptor"`.

use uuid::Uuid;

use crate::ble::uuids::uuid_from_u16;

/// Fallback name for an unrecognised service.
pub const UNKNOWN_SERVICE: &str = "Unknown Service";
/// Fallback name for an unrecognised characteristic.
pub const UNKNOWN_CHARACTERISTIC: &str = "Unknown Characteristic";
/// Fallback name for an unrecognised descriptor.
pub const UNKNOWN_DESCRIPTOR: &str = "Unknown Descriptor";

const KNOWN_SERVICES: &[(Uuid, &str)] = &[
    (uuid_from_u16(0x1800), "Generic Access"),
    (uuid_from_u16(0x1801), "Generic Attribute"),
    (uuid_from_u16(0x1802), "Immediate Alert"),
    (uuid_from_u16(0x1803), "Link Loss"),
    (uuid_from_u16(0x1804), "Tx Power"),
    (uuid_from_u16(0x1805), "Current Time"),
    (uuid_from_u16(0x1809), "Health Thermometer"),
    (uuid_from_u16(0x180a), "Device Information"),
    (uuid_from_u16(0x180d), "Heart Rate"),
    (uuid_from_u16(0x180f), "Battery"),
    (uuid_from_u16(0x1810), "Blood Pressure"),
    (uuid_from_u16(0x1812), "Human Interface Device"),
    (uuid_from_u16(0x1816), "Cycling Speed and Cadence"),
    (uuid_from_u16(0x181a), "Environmental Sensing"),
    (
        Uuid::from_u128(0x1618_7f00_0000_1000_8000_00807f9b34fb),
        "Xiaomi Wear Service",
    ),
    (
        Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e),
        "Nordic UART Service",
    ),
];

const KNOWN_CHARACTERISTICS: &[(Uuid, &str)] = &[
    (uuid_from_u16(0x2a00), "Device Name"),
    (uuid_from_u16(0x2a01), "Appearance"),
    (uuid_from_u16(0x2a04), "Peripheral Preferred Connection Parameters"),
    (uuid_from_u16(0x2a05), "Service Changed"),
    (uuid_from_u16(0x2a06), "Alert Level"),
    (uuid_from_u16(0x2a07), "Tx Power Level"),
    (uuid_from_u16(0x2a19), "Battery Level"),
    (uuid_from_u16(0x2a1c), "Temperature Measurement"),
    (uuid_from_u16(0x2a24), "Model Number String"),
    (uuid_from_u16(0x2a25), "Serial Number String"),
    (uuid_from_u16(0x2a26), "Firmware Revision String"),
    (uuid_from_u16(0x2a27), "Hardware Revision String"),
    (uuid_from_u16(0x2a28), "Software Revision String"),
    (uuid_from_u16(0x2a29), "Manufacturer Name String"),
    (uuid_from_u16(0x2a37), "Heart Rate Measurement"),
    (uuid_from_u16(0x2a38), "Body Sensor Location"),
    (uuid_from_u16(0x2a6e), "Temperature"),
    (uuid_from_u16(0x2a6f), "Humidity"),
    (uuid_from_u16(0x2aa6), "Central Address Resolution"),
    (
        Uuid::from_u128(0x1618_7f01_0000_1000_8000_00807f9b34fb),
        "Xiaomi Wear Authentication",
    ),
    (
        Uuid::from_u128(0x1618_7f02_0000_1000_8000_00807f9b34fb),
        "Xiaomi Wear Encrypted Channel",
    ),
    (
        Uuid::from_u128(0x1618_7f03_0000_1000_8000_00807f9b34fb),
        "Xiaomi Wear Notifications",
    ),
    (
        Uuid::from_u128(0x1618_7f04_0000_1000_8000_00807f9b34fb),
        "Xiaomi Wear Data",
    ),
    (
        Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e),
        "Nordic UART RX",
    ),
    (
        Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e),
        "Nordic UART TX",
    ),
];

const KNOWN_DESCRIPTORS: &[(Uuid, &str)] = &[
    (uuid_from_u16(0x2900), "Characteristic Extended Properties"),
    (uuid_from_u16(0x2901), "Characteristic User Description"),
    (uuid_from_u16(0x2902), "Client Characteristic Configuration"),
    (uuid_from_u16(0x2903), "Server Characteristic Configuration"),
    (uuid_from_u16(0x2904), "Characteristic Presentation Format"),
    (uuid_from_u16(0x2905), "Characteristic Aggregate Format"),
    (uuid_from_u16(0x2906), "Valid Range"),
];

const KNOWN_MANUFACTURERS: &[(u16, &str)] = &[
    (0x0006, "Microsoft"),
    (0x000F, "Broadcom"),
    (0x004C, "Apple Inc."),
    (0x0059, "Nordic Semiconductor"),
    (0x0075, "Samsung"),
    (0x00D2, "Motorola Mobility LLC"),
    (0x00E0, "Google"),
    (0x0131, "Sony Corporation"),
    (0x016D, "Fitbit Inc."),
    (0x0171, "Huawei Technologies"),
    (0x029A, "OnePlus Technology"),
    (0x038F, "Xiaomi Inc."),
    (0x0426, "Realtek Semiconductor Corp."),
];

fn lookup(table: &[(Uuid, &'static str)], uuid: &Uuid) -> Option<&'static str> {
    table
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// Readable name of a service.
pub fn service_name(uuid: &Uuid) -> &'static str {
    lookup(KNOWN_SERVICES, uuid).unwrap_or(UNKNOWN_SERVICE)
}

/// Readable name of a characteristic.
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    lookup(KNOWN_CHARACTERISTICS, uuid).unwrap_or(UNKNOWN_CHARACTERISTIC)
}

/// Readable name of a descriptor.
pub fn descriptor_name(uuid: &Uuid) -> &'static str {
    lookup(KNOWN_DESCRIPTORS, uuid).unwrap_or(UNKNOWN_DESCRIPTOR)
}

/// Company name for a Bluetooth SIG company identifier.
pub fn manufacturer_name(company_id: u16) -> Option<&'static str> {
    KNOWN_MANUFACTURERS
        .iter()
        .find(|(id, _)| *id == company_id)
        .map(|(_, name)| *name)
}
