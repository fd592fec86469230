//! Single entry point combining the scanner and the connection manager.
//!
//! Scanning and connecting contend for the same radio, so [`BleService::connect`]
//! always stops a running scan before the link is attempted.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::advertising::ScanResult;
use crate::ble::attributes::GattService;
use crate::ble::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, NotificationEvent,
};
use crate::ble::scanner::{ScanFailure, Scanner};
use crate::config::BleConfig;
use crate::error::Result;
use crate::platform::{ensure_radio_ready, BlePlatform, BtleplugPlatform};

/// BLE scanner and GATT client behind one interface.
pub struct BleService {
    /// Platform shared by both components.
    platform: Arc<dyn BlePlatform>,
    /// Deduplicating scanner.
    scanner: Scanner,
    /// Owner of the single link.
    connection: ConnectionManager,
}

impl BleService {
    /// Create a service on `platform`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(platform: Arc<dyn BlePlatform>, config: BleConfig) -> Self {
        let scanner = Scanner::new(platform.clone(), config.scan_mode, config.event_capacity);
        let connection = ConnectionManager::new(platform.clone(), &config);

        Self {
            platform,
            scanner,
            connection,
        }
    }

    /// Create a service on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_native(config: BleConfig) -> Result<Self> {
        let platform = BtleplugPlatform::new().await?;
        Ok(Self::new(Arc::new(platform), config))
    }

    // Scanning

    /// Start scanning, clearing previous results.
    pub async fn start_scan(&self) -> Result<()> {
        self.scanner.start().await
    }

    /// Stop scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Snapshot of the scan results in discovery order.
    pub fn scan_results(&self) -> Vec<ScanResult> {
        self.scanner.results()
    }

    /// Watch the scanning flag.
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanner.watch_scanning()
    }

    /// Watch the scan results.
    pub fn watch_scan_results(&self) -> watch::Receiver<Vec<ScanResult>> {
        self.scanner.watch_results()
    }

    /// Subscribe to scan failures.
    pub fn subscribe_scan_failures(&self) -> broadcast::Receiver<ScanFailure> {
        self.scanner.subscribe_failures()
    }

    // Connection

    /// Stop any scan, then connect to `address` and discover its services.
    pub async fn connect(&self, address: &str) -> Result<()> {
        ensure_radio_ready(self.platform.as_ref()).await?;

        if self.scanner.is_scanning() {
            debug!("Stopping scan before connecting");
        }
        self.scanner.stop().await?;

        self.connection.connect(address).await
    }

    /// Close the link.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of the discovered services.
    pub fn services(&self) -> Vec<Arc<GattService>> {
        self.connection.services()
    }

    /// Watch the connection state.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Watch the discovered services.
    pub fn watch_services(&self) -> watch::Receiver<Vec<Arc<GattService>>> {
        self.connection.watch_services()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Subscribe to values pushed by the peer.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.connection.subscribe_notifications()
    }

    // GATT

    /// Read a characteristic.
    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Bytes> {
        self.connection.read_characteristic(uuid).await
    }

    /// Write a characteristic.
    pub async fn write_characteristic(&self, uuid: Uuid, value: impl Into<Bytes>) -> Result<()> {
        self.connection.write_characteristic(uuid, value).await
    }

    /// Read a descriptor.
    pub async fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<Bytes> {
        self.connection
            .read_descriptor(characteristic, descriptor)
            .await
    }

    /// Write a descriptor.
    pub async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.connection
            .write_descriptor(characteristic, descriptor, value)
            .await
    }

    /// Enable notifications or indications on a characteristic.
    pub async fn enable_notifications(&self, uuid: Uuid) -> Result<()> {
        self.connection.enable_notifications(uuid).await
    }

    /// Stop scanning, close the link and stop the connection manager.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down BLE service");

        if let Err(e) = self.scanner.stop().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }

        let result = self.connection.disconnect().await;
        self.connection.shutdown();
        result
    }
}
