// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # blelink
//!
//! A Bluetooth Low Energy scanner and GATT client engine.
//!
//! ## Features
//!
//! - **Deduplicated Scanning**: One stable entry per device, RSSI refreshed in place
//! - **Manufacturer Names**: Resolved from manufacturer specific data
//! - **Single-link GATT Client**: Connect, discover, read, write and subscribe
//!   with requests serialized against the link
//! - **Observable State**: Scan results, connection state and the attribute
//!   tree published through `tokio::sync::watch`
//! - **Pluggable Platform**: Runs on `btleplug` or any [`BlePlatform`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blelink::{BleConfig, BleService, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let service = BleService::with_native(BleConfig::default()).await?;
//!     service.start_scan().await?;
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let results = service.scan_results();
//!     for device in &results {
//!         println!("{} {} ({} dBm)", device.address, device.display_name, device.rssi);
//!     }
//!
//!     if let Some(device) = results.first() {
//!         service.connect(&device.address).await?;
//!         for gatt_service in service.services() {
//!             println!("{} ({})", gatt_service.name, gatt_service.uuid);
//!         }
//!     }
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization for the attribute model and scan results

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod platform;
pub mod service;
pub mod utils;

// Re-exports for convenience
pub use config::BleConfig;
pub use error::{Error, Precondition, Result};
pub use platform::{BlePlatform, BtleplugPlatform, GattStatus, RadioState, ScanMode, WriteType};
pub use service::BleService;
pub use utils::to_hex_string;

// Re-export commonly used types from submodules
pub use ble::advertising::{Manufacturer, ScanResult};
pub use ble::attributes::{GattCharacteristic, GattDescriptor, GattService};
pub use ble::connection::{ConnectionEvent, ConnectionState, NotificationEvent};
pub use ble::scanner::ScanFailure;
