//! BLE scanning functionality.
//!
//! Advertisement callbacks for the same device keep arriving for as long as
//! the scan runs, because the RSSI keeps changing. The scanner folds them into
//! a stable list: the first sighting of an address appends an entry, later
//! sightings only refresh that entry's RSSI in place.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

use crate::ble::advertising::{Advertisement, ScanResult};
use crate::error::{Error, Result};
use crate::platform::{ensure_radio_ready, BlePlatform, ScanMode, ScanSink};

/// The radio aborted a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanFailure {
    /// Platform scan failure code.
    pub code: i32,
}

impl From<ScanFailure> for Error {
    fn from(failure: ScanFailure) -> Self {
        Error::ScanFailed { code: failure.code }
    }
}

#[derive(Debug, Default)]
struct ScanState {
    /// Incremented on every start; sinks of older sessions are ignored.
    session: u64,
    is_scanning: bool,
    /// Address to index into the published result list.
    seen: HashMap<String, usize>,
}

/// State shared between the scanner and the sinks it hands to the platform.
pub(crate) struct ScanShared {
    state: Mutex<ScanState>,
    scanning_tx: watch::Sender<bool>,
    results_tx: watch::Sender<Vec<ScanResult>>,
    failure_tx: broadcast::Sender<ScanFailure>,
}

impl ScanShared {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (scanning_tx, _) = watch::channel(false);
        let (results_tx, _) = watch::channel(Vec::new());
        let (failure_tx, _) = broadcast::channel(event_capacity.max(1));

        Self {
            state: Mutex::new(ScanState::default()),
            scanning_tx,
            results_tx,
            failure_tx,
        }
    }

    /// Open a new session with an empty result list.
    fn begin_session(&self) -> u64 {
        let mut state = self.state.lock();
        state.session += 1;
        state.is_scanning = true;
        state.seen.clear();
        self.results_tx.send_replace(Vec::new());
        self.scanning_tx.send_replace(true);
        state.session
    }

    /// Close `session` if it is still current. Returns whether it was.
    fn end_session(&self, session: u64) -> bool {
        let mut state = self.state.lock();
        if state.session != session || !state.is_scanning {
            return false;
        }
        state.is_scanning = false;
        self.scanning_tx.send_replace(false);
        true
    }

    fn current_session(&self) -> Option<u64> {
        let state = self.state.lock();
        state.is_scanning.then_some(state.session)
    }

    pub(crate) fn on_advertisement(&self, session: u64, advertisement: Advertisement) {
        let mut state = self.state.lock();
        if !state.is_scanning || state.session != session {
            trace!(
                "Dropping advertisement from {} for stale scan session",
                advertisement.address
            );
            return;
        }

        match state.seen.get(&advertisement.address).copied() {
            Some(index) => {
                let rssi = advertisement.rssi;
                self.results_tx.send_if_modified(|results| match results.get_mut(index) {
                    Some(existing) if existing.rssi != rssi => {
                        trace!("RSSI of {} now {} dBm", existing.address, rssi);
                        existing.rssi = rssi;
                        true
                    }
                    _ => false,
                });
            }
            None => {
                let result = ScanResult::from_advertisement(&advertisement);
                info!(
                    "Found BLE device! Name: {}, address: {}, manufacturer: {}",
                    result.display_name, result.address, result.manufacturer
                );
                let seen = &mut state.seen;
                self.results_tx.send_modify(|results| {
                    seen.insert(result.address.clone(), results.len());
                    results.push(result);
                });
            }
        }
    }

    pub(crate) fn on_scan_failed(&self, session: u64, code: i32) {
        if !self.end_session(session) {
            debug!("Ignoring failure code {} from stale scan session", code);
            return;
        }
        error!("Scan failed: code {}", code);
        let _ = self.failure_tx.send(ScanFailure { code });
    }
}

/// Deduplicating BLE scanner.
pub struct Scanner {
    /// Platform the scan runs on.
    platform: Arc<dyn BlePlatform>,
    /// Requested duty cycle.
    scan_mode: ScanMode,
    /// Session state shared with the platform sinks.
    shared: Arc<ScanShared>,
    /// Serializes start/stop.
    op_lock: tokio::sync::Mutex<()>,
}

impl Scanner {
    /// Create a scanner on `platform`.
    pub fn new(platform: Arc<dyn BlePlatform>, scan_mode: ScanMode, event_capacity: usize) -> Self {
        Self {
            platform,
            scan_mode,
            shared: Arc::new(ScanShared::new(event_capacity)),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start scanning, clearing previous results.
    ///
    /// A running scan is stopped and restarted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] if the radio cannot be used and
    /// [`Error::Platform`] if the platform refuses to start the scan.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        ensure_radio_ready(self.platform.as_ref()).await?;

        if self.shared.current_session().is_some() {
            debug!("Already scanning, restarting");
            self.stop_locked().await?;
        }

        let session = self.shared.begin_session();
        info!("Starting BLE scan ({:?})", self.scan_mode);

        let sink = ScanSink::new(self.shared.clone(), session);
        if let Err(e) = self.platform.start_scan(self.scan_mode, sink).await {
            error!("Failed to start scan: {}", e);
            self.shared.end_session(session);
            return Err(e.into());
        }

        Ok(())
    }

    /// Stop scanning. Results are kept until the next start.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<()> {
        let Some(session) = self.shared.current_session() else {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        };

        self.shared.end_session(session);
        info!("Stopping BLE scan");

        if let Err(e) = self.platform.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
            return Err(e.into());
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning_tx.borrow()
    }

    /// Snapshot of the results in discovery order.
    pub fn results(&self) -> Vec<ScanResult> {
        self.shared.results_tx.borrow().clone()
    }

    /// Watch the scanning flag.
    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.shared.scanning_tx.subscribe()
    }

    /// Watch the result list.
    pub fn watch_results(&self) -> watch::Receiver<Vec<ScanResult>> {
        self.shared.results_tx.subscribe()
    }

    /// Subscribe to scan failures.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ScanFailure> {
        self.shared.failure_tx.subscribe()
    }
}
