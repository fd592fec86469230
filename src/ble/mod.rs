//! BLE communication module.
//!
//! The scanner and the connection manager, plus the attribute model they
//! publish and the lookup tables used to name what they find.

pub mod advertising;
pub mod attributes;
pub mod connection;
pub(crate) mod link;
pub mod names;
pub mod scanner;
pub mod uuids;

pub use advertising::{Advertisement, Manufacturer, ScanResult};
pub use attributes::{
    Capabilities, FormatType, GattCharacteristic, GattDescriptor, GattService, Permission,
    Property,
};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, NotificationEvent};
pub use scanner::{ScanFailure, Scanner};
pub use uuids::*;
