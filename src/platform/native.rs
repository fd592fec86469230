//! [`BlePlatform`] on the host stack via `btleplug`.
//!
//! btleplug exposes awaitable calls, not callbacks. Every accepted request is
//! run on its own task which posts the outcome to the link's [`GattSink`],
//! and a single pump task turns the adapter event stream into
//! advertisements, radio state changes and link-loss callbacks.
//!
//! btleplug owns the CCCD. A write of an enable or disable value to it is
//! carried out as subscribe or unsubscribe on the owning characteristic.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    AttributeHandle, BlePlatform, GattSink, GattStatus, LinkId, PlatformError, RadioState,
    RawCharacteristic, RawDescriptor, RawService, ScanMode, ScanSink, WriteType,
};
use crate::ble::advertising::{Advertisement, RSSI_UNAVAILABLE};
use crate::ble::uuids::{
    CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    PRESENTATION_FORMAT_DESCRIPTOR_UUID,
};
use crate::error::{Error, Precondition, Result};

/// Permission bits reported for descriptors. btleplug does not expose
/// descriptor permissions, so the CCCD is reported read/write and every
/// other descriptor read-only.
const CCCD_PERMISSIONS: u16 = 0x0011;
const DESCRIPTOR_PERMISSIONS: u16 = 0x0001;

/// Everything held for one open link.
struct LinkEntry {
    peripheral: Peripheral,
    sink: GattSink,
    characteristics: HashMap<AttributeHandle, Characteristic>,
    descriptors: HashMap<AttributeHandle, Descriptor>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkEntry {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type Links = Arc<Mutex<HashMap<LinkId, LinkEntry>>>;

/// Host Bluetooth stack accessed through `btleplug`.
pub struct BtleplugPlatform {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Last radio state reported by the adapter.
    radio: Arc<Mutex<RadioState>>,
    /// Sink of the running scan.
    scan: Arc<Mutex<Option<ScanSink>>>,
    /// Open links.
    links: Links,
    /// Adapter event pump.
    pump: JoinHandle<()>,
}

impl BtleplugPlatform {
    /// Use the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::PreconditionFailed {
                reason: Precondition::RadioUnsupported,
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let events = adapter.events().await?;
        let initial = adapter
            .adapter_state()
            .await
            .map(radio_state_from)
            .unwrap_or(RadioState::PoweredOn);
        debug!("Initial radio state: {:?}", initial);

        let radio = Arc::new(Mutex::new(initial));
        let scan: Arc<Mutex<Option<ScanSink>>> = Arc::new(Mutex::new(None));
        let links: Links = Arc::new(Mutex::new(HashMap::new()));

        let pump = tokio::spawn(pump_events(
            events,
            adapter.clone(),
            radio.clone(),
            scan.clone(),
            links.clone(),
        ));

        Ok(Self {
            adapter,
            radio,
            scan,
            links,
            pump,
        })
    }

    async fn find_peripheral(&self, address: &str) -> std::result::Result<Peripheral, PlatformError> {
        let peripherals = self.adapter.peripherals().await.map_err(backend)?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| PlatformError::UnknownDevice(address.to_string()))
    }

    fn with_link<T>(
        &self,
        link: LinkId,
        f: impl FnOnce(&LinkEntry) -> std::result::Result<T, PlatformError>,
    ) -> std::result::Result<T, PlatformError> {
        let links = self.links.lock();
        let entry = links.get(&link).ok_or(PlatformError::UnknownLink(link))?;
        f(entry)
    }

    /// Run `task` and keep its handle with the link so disconnect can abort it.
    fn spawn_for(&self, link: LinkId, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut links = self.links.lock();
        match links.get_mut(&link) {
            Some(entry) => {
                entry.tasks.retain(|t| !t.is_finished());
                entry.tasks.push(handle);
            }
            None => handle.abort(),
        }
    }

    fn characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> std::result::Result<(Peripheral, GattSink, Characteristic), PlatformError> {
        self.with_link(link, |entry| {
            let characteristic = entry
                .characteristics
                .get(&handle)
                .cloned()
                .ok_or(PlatformError::UnknownHandle(handle))?;
            Ok((entry.peripheral.clone(), entry.sink.clone(), characteristic))
        })
    }

    fn descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> std::result::Result<(Peripheral, GattSink, Descriptor), PlatformError> {
        self.with_link(link, |entry| {
            let descriptor = entry
                .descriptors
                .get(&handle)
                .cloned()
                .ok_or(PlatformError::UnknownHandle(handle))?;
            Ok((entry.peripheral.clone(), entry.sink.clone(), descriptor))
        })
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        self.pump.abort();
        for entry in self.links.lock().values_mut() {
            entry.abort_tasks();
        }
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn radio_state(&self) -> RadioState {
        *self.radio.lock()
    }

    async fn start_scan(
        &self,
        mode: ScanMode,
        sink: ScanSink,
    ) -> std::result::Result<(), PlatformError> {
        // btleplug does not expose the scan duty cycle
        debug!("Starting adapter scan (requested {:?})", mode);

        *self.scan.lock() = Some(sink);
        if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
            *self.scan.lock() = None;
            return Err(backend(e));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> std::result::Result<(), PlatformError> {
        *self.scan.lock() = None;
        self.adapter.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, address: &str, sink: GattSink) -> std::result::Result<(), PlatformError> {
        let peripheral = self.find_peripheral(address).await?;
        let link = sink.link();

        self.links.lock().insert(
            link,
            LinkEntry {
                peripheral: peripheral.clone(),
                sink: sink.clone(),
                characteristics: HashMap::new(),
                descriptors: HashMap::new(),
                tasks: Vec::new(),
            },
        );

        self.spawn_for(link, async move {
            match peripheral.connect().await {
                Ok(()) => sink.connected(),
                Err(e) => {
                    warn!("Connection to {} failed: {}", peripheral.id(), e);
                    sink.disconnected(status_of(&e, GattStatus::GATT_ERROR));
                }
            }
        });

        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> std::result::Result<(), PlatformError> {
        let (peripheral, sink) =
            self.with_link(link, |entry| Ok((entry.peripheral.clone(), entry.sink.clone())))?;
        let links = self.links.clone();

        self.spawn_for(link, async move {
            if let Err(e) = peripheral.discover_services().await {
                error!("Service discovery failed: {}", e);
                sink.services_discovered(status_of(&e, GattStatus::GATT_ERROR), Vec::new());
                return;
            }

            let discovered = DiscoveredTree::build(&peripheral).await;

            let forwarder = match peripheral.notifications().await {
                Ok(mut stream) => {
                    let sink = sink.clone();
                    let handles = discovered.handles_by_uuid();
                    Some(tokio::spawn(async move {
                        while let Some(notification) = stream.next().await {
                            match handles.get(&notification.uuid) {
                                Some(&handle) => sink
                                    .characteristic_changed(handle, Bytes::from(notification.value)),
                                None => trace!(
                                    "Notification for unknown characteristic {}",
                                    notification.uuid
                                ),
                            }
                        }
                    }))
                }
                Err(e) => {
                    warn!("Notification stream unavailable: {}", e);
                    None
                }
            };

            {
                let mut links = links.lock();
                let Some(entry) = links.get_mut(&link) else {
                    if let Some(forwarder) = forwarder {
                        forwarder.abort();
                    }
                    return;
                };
                entry.characteristics = discovered.characteristics;
                entry.descriptors = discovered.descriptors;
                entry.tasks.extend(forwarder);
            }

            sink.services_discovered(GattStatus::SUCCESS, discovered.services);
        });

        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> std::result::Result<(), PlatformError> {
        let entry = self.links.lock().remove(&link);
        let Some(mut entry) = entry else {
            return Err(PlatformError::UnknownLink(link));
        };
        entry.abort_tasks();

        if entry.peripheral.is_connected().await.unwrap_or(false) {
            entry.peripheral.disconnect().await.map_err(backend)?;
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> std::result::Result<(), PlatformError> {
        let (peripheral, sink, characteristic) = self.characteristic(link, handle)?;

        self.spawn_for(link, async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => sink.characteristic_read(handle, GattStatus::SUCCESS, Bytes::from(value)),
                Err(e) => sink.characteristic_read(
                    handle,
                    status_of(&e, GattStatus::READ_NOT_PERMITTED),
                    Bytes::new(),
                ),
            }
        });

        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
        write_type: WriteType,
    ) -> std::result::Result<(), PlatformError> {
        let (peripheral, sink, characteristic) = self.characteristic(link, handle)?;
        let write_type = match write_type {
            WriteType::WithResponse => btleplug::api::WriteType::WithResponse,
            // No signed write in btleplug
            WriteType::WithoutResponse | WriteType::Signed => {
                btleplug::api::WriteType::WithoutResponse
            }
        };

        self.spawn_for(link, async move {
            let status = match peripheral.write(&characteristic, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => status_of(&e, GattStatus::WRITE_NOT_PERMITTED),
            };
            sink.characteristic_written(handle, status);
        });

        Ok(())
    }

    async fn read_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> std::result::Result<(), PlatformError> {
        let (peripheral, sink, descriptor) = self.descriptor(link, handle)?;

        self.spawn_for(link, async move {
            match peripheral.read_descriptor(&descriptor).await {
                Ok(value) => sink.descriptor_read(handle, GattStatus::SUCCESS, Bytes::from(value)),
                Err(e) => sink.descriptor_read(
                    handle,
                    status_of(&e, GattStatus::READ_NOT_PERMITTED),
                    Bytes::new(),
                ),
            }
        });

        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
    ) -> std::result::Result<(), PlatformError> {
        let (peripheral, sink, descriptor) = self.descriptor(link, handle)?;

        self.spawn_for(link, async move {
            let status = match descriptor_write_kind(&descriptor.uuid, &value) {
                DescriptorWrite::Plain => match peripheral.write_descriptor(&descriptor, &value).await {
                    Ok(()) => GattStatus::SUCCESS,
                    Err(e) => status_of(&e, GattStatus::WRITE_NOT_PERMITTED),
                },
                DescriptorWrite::Subscribe => cccd_write(&peripheral, &descriptor, true).await,
                DescriptorWrite::Unsubscribe => cccd_write(&peripheral, &descriptor, false).await,
            };
            sink.descriptor_written(handle, status);
        });

        Ok(())
    }

    async fn set_notifications(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        enable: bool,
    ) -> std::result::Result<(), PlatformError> {
        let (peripheral, _, characteristic) = self.characteristic(link, handle)?;

        let result = if enable {
            peripheral.subscribe(&characteristic).await
        } else {
            peripheral.unsubscribe(&characteristic).await
        };
        result.map_err(backend)
    }
}

/// How a descriptor write is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorWrite {
    Subscribe,
    Unsubscribe,
    Plain,
}

fn descriptor_write_kind(uuid: &Uuid, value: &[u8]) -> DescriptorWrite {
    if *uuid != CCCD_UUID {
        return DescriptorWrite::Plain;
    }

    if value == DISABLE_NOTIFICATION_VALUE {
        DescriptorWrite::Unsubscribe
    } else if value == ENABLE_NOTIFICATION_VALUE || value == ENABLE_INDICATION_VALUE {
        DescriptorWrite::Subscribe
    } else {
        DescriptorWrite::Plain
    }
}

/// Apply a CCCD write through subscribe/unsubscribe. Subscribing again after
/// [`BlePlatform::set_notifications`] is a no-op on the peer.
async fn cccd_write(peripheral: &Peripheral, descriptor: &Descriptor, enable: bool) -> GattStatus {
    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == descriptor.characteristic_uuid && c.service_uuid == descriptor.service_uuid);

    let Some(characteristic) = characteristic else {
        return GattStatus::FAILURE;
    };

    trace!(
        "CCCD of {} written as {}",
        characteristic.uuid,
        if enable { "subscribe" } else { "unsubscribe" }
    );

    let result = if enable {
        peripheral.subscribe(&characteristic).await
    } else {
        peripheral.unsubscribe(&characteristic).await
    };
    match result {
        Ok(()) => GattStatus::SUCCESS,
        Err(e) => status_of(&e, GattStatus::WRITE_NOT_PERMITTED),
    }
}

/// Format byte of a Characteristic Presentation Format value, translated
/// from the SIG format code to the platform encoding.
fn presentation_format(value: &[u8]) -> Option<u8> {
    let format = match value.first()? {
        0x04 => 0x11, // uint8
        0x06 => 0x12, // uint16
        0x08 => 0x14, // uint32
        0x0c => 0x21, // sint8
        0x0e => 0x22, // sint16
        0x10 => 0x24, // sint32
        0x16 => 0x32, // medfloat16
        0x17 => 0x34, // medfloat32
        _ => return None,
    };
    Some(format)
}

/// Read the presentation format descriptor of `characteristic`, if it has one.
async fn read_format(peripheral: &Peripheral, characteristic: &Characteristic) -> Option<u8> {
    let descriptor = characteristic
        .descriptors
        .iter()
        .find(|d| d.uuid == PRESENTATION_FORMAT_DESCRIPTOR_UUID)?;

    match peripheral.read_descriptor(descriptor).await {
        Ok(value) => presentation_format(&value),
        Err(e) => {
            debug!("Presentation format of {} unreadable: {}", characteristic.uuid, e);
            None
        }
    }
}

/// Discovery result with sequentially assigned handles.
struct DiscoveredTree {
    services: Vec<RawService>,
    characteristics: HashMap<AttributeHandle, Characteristic>,
    descriptors: HashMap<AttributeHandle, Descriptor>,
}

impl DiscoveredTree {
    async fn build(peripheral: &Peripheral) -> Self {
        let mut next: AttributeHandle = 0;
        let mut assign = || {
            next = next.wrapping_add(1);
            next
        };

        let mut services = Vec::new();
        let mut characteristics = HashMap::new();
        let mut descriptors = HashMap::new();

        for service in peripheral.services() {
            let mut raw_characteristics = Vec::new();

            for characteristic in &service.characteristics {
                let handle = assign();
                let mut raw_descriptors = Vec::new();

                for descriptor in &characteristic.descriptors {
                    let descriptor_handle = assign();
                    raw_descriptors.push(RawDescriptor {
                        handle: descriptor_handle,
                        uuid: descriptor.uuid,
                        permissions: descriptor_permissions(&descriptor.uuid),
                    });
                    descriptors.insert(descriptor_handle, descriptor.clone());
                }

                raw_characteristics.push(RawCharacteristic {
                    handle,
                    uuid: characteristic.uuid,
                    properties: characteristic.properties.bits(),
                    format: read_format(peripheral, characteristic).await,
                    descriptors: raw_descriptors,
                });
                characteristics.insert(handle, characteristic.clone());
            }

            services.push(RawService {
                uuid: service.uuid,
                characteristics: raw_characteristics,
            });
        }

        debug!(
            "Assigned handles to {} characteristics and {} descriptors",
            characteristics.len(),
            descriptors.len()
        );

        Self {
            services,
            characteristics,
            descriptors,
        }
    }

    /// First handle seen for each characteristic UUID.
    fn handles_by_uuid(&self) -> HashMap<Uuid, AttributeHandle> {
        let mut handles = HashMap::new();
        for characteristic in self.services.iter().flat_map(|s| &s.characteristics) {
            handles
                .entry(characteristic.uuid)
                .or_insert(characteristic.handle);
        }
        handles
    }
}

async fn pump_events(
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    adapter: Adapter,
    radio: Arc<Mutex<RadioState>>,
    scan: Arc<Mutex<Option<ScanSink>>>,
    links: Links,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                let sink = scan.lock().clone();
                let Some(sink) = sink else {
                    continue;
                };
                forward_advertisement(&adapter, &id, &sink).await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                notify_link_loss(&links, &id);
            }
            CentralEvent::StateUpdate(state) => {
                let state = radio_state_from(state);
                info!("Adapter state changed: {:?}", state);
                *radio.lock() = state;
            }
            _ => {}
        }
    }

    debug!("Adapter event stream ended");
}

async fn forward_advertisement(adapter: &Adapter, id: &PeripheralId, sink: &ScanSink) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return;
        }
    };

    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return,
    };

    sink.advertisement(advertisement_from(id.to_string(), &properties));
}

fn notify_link_loss(links: &Links, id: &PeripheralId) {
    let mut links = links.lock();
    let lost: Vec<LinkId> = links
        .iter()
        .filter(|(_, entry)| entry.peripheral.id() == *id)
        .map(|(link, _)| *link)
        .collect();

    for link in lost {
        if let Some(mut entry) = links.remove(&link) {
            entry.abort_tasks();
            entry.sink.disconnected(GattStatus::REMOTE_USER_TERMINATED);
        }
    }
}

fn advertisement_from(address: String, properties: &PeripheralProperties) -> Advertisement {
    Advertisement {
        address,
        rssi: properties.rssi.unwrap_or(RSSI_UNAVAILABLE),
        local_name: properties.local_name.clone(),
        manufacturer_data: properties
            .manufacturer_data
            .iter()
            .map(|(id, data)| (*id, Bytes::copy_from_slice(data)))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn radio_state_from(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::PoweredOn,
    }
}

fn descriptor_permissions(uuid: &Uuid) -> u16 {
    if *uuid == CCCD_UUID {
        CCCD_PERMISSIONS
    } else {
        DESCRIPTOR_PERMISSIONS
    }
}

/// Status reported for a failed request. `denied` is used when the stack
/// refused access to the attribute.
fn status_of(error: &btleplug::Error, denied: GattStatus) -> GattStatus {
    match error {
        btleplug::Error::PermissionDenied => denied,
        btleplug::Error::NotSupported(_) => GattStatus::REQUEST_NOT_SUPPORTED,
        btleplug::Error::NotConnected => GattStatus::REMOTE_USER_TERMINATED,
        _ => GattStatus::FAILURE,
    }
}

fn backend(error: btleplug::Error) -> PlatformError {
    PlatformError::Backend(error.to_string())
}
