//! Scriptable in-memory platform for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use blelink::ble::advertising::Advertisement;
use blelink::ble::uuids::{uuid_from_u16, CCCD_UUID, USER_DESCRIPTION_DESCRIPTOR_UUID};
use blelink::platform::{
    AttributeHandle, BlePlatform, GattEvent, GattSink, GattStatus, LinkId, PlatformError,
    RadioState, RawCharacteristic, RawDescriptor, RawService, ScanMode, ScanSink, WriteType,
};
use blelink::ConnectionState;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
pub const HR_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
pub const HR_CONTROL_POINT: Uuid = uuid_from_u16(0x2a39);
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180f);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);
pub const GENERIC_ACCESS: Uuid = uuid_from_u16(0x1800);
pub const DEVICE_NAME: Uuid = uuid_from_u16(0x2a00);
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
pub const SIGNED_ONLY: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);

pub const HR_MEASUREMENT_HANDLE: AttributeHandle = 10;
pub const HR_MEASUREMENT_CCCD: AttributeHandle = 11;
pub const HR_CONTROL_POINT_HANDLE: AttributeHandle = 12;
pub const BATTERY_LEVEL_HANDLE: AttributeHandle = 20;
pub const BATTERY_LEVEL_CCCD: AttributeHandle = 21;
pub const BATTERY_LEVEL_DESCRIPTION: AttributeHandle = 22;
pub const UART_RX_HANDLE: AttributeHandle = 30;
pub const UART_TX_HANDLE: AttributeHandle = 31;
pub const UART_TX_CCCD: AttributeHandle = 32;
pub const SIGNED_ONLY_HANDLE: AttributeHandle = 33;
pub const DEVICE_NAME_HANDLE: AttributeHandle = 40;

fn characteristic(
    handle: AttributeHandle,
    uuid: Uuid,
    properties: u8,
    descriptors: Vec<RawDescriptor>,
) -> RawCharacteristic {
    RawCharacteristic {
        handle,
        uuid,
        properties,
        format: None,
        descriptors,
    }
}

fn cccd(handle: AttributeHandle) -> RawDescriptor {
    RawDescriptor {
        handle,
        uuid: CCCD_UUID,
        permissions: 0x0011,
    }
}

/// Heart rate, battery, UART-style and GAP services.
pub fn sample_tree() -> Vec<RawService> {
    vec![
        RawService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                characteristic(
                    HR_MEASUREMENT_HANDLE,
                    HR_MEASUREMENT,
                    0x10,
                    vec![cccd(HR_MEASUREMENT_CCCD)],
                ),
                // write, write without response and signed write
                characteristic(HR_CONTROL_POINT_HANDLE, HR_CONTROL_POINT, 0x4c, vec![]),
            ],
        },
        RawService {
            uuid: BATTERY_SERVICE,
            characteristics: vec![characteristic(
                BATTERY_LEVEL_HANDLE,
                BATTERY_LEVEL,
                0x12,
                vec![
                    cccd(BATTERY_LEVEL_CCCD),
                    RawDescriptor {
                        handle: BATTERY_LEVEL_DESCRIPTION,
                        uuid: USER_DESCRIPTION_DESCRIPTOR_UUID,
                        permissions: 0x0001,
                    },
                ],
            )],
        },
        RawService {
            uuid: UART_SERVICE,
            characteristics: vec![
                characteristic(UART_RX_HANDLE, UART_RX, 0x04, vec![]),
                characteristic(UART_TX_HANDLE, UART_TX, 0x20, vec![cccd(UART_TX_CCCD)]),
                characteristic(SIGNED_ONLY_HANDLE, SIGNED_ONLY, 0x40, vec![]),
            ],
        },
        RawService {
            uuid: GENERIC_ACCESS,
            characteristics: vec![characteristic(DEVICE_NAME_HANDLE, DEVICE_NAME, 0x02, vec![])],
        },
    ]
}

/// A request the engine issued to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(ScanMode),
    StopScan,
    Connect(String),
    DiscoverServices(LinkId),
    Disconnect(LinkId),
    ReadCharacteristic(AttributeHandle),
    WriteCharacteristic(AttributeHandle, Vec<u8>, WriteType),
    ReadDescriptor(AttributeHandle),
    WriteDescriptor(AttributeHandle, Vec<u8>),
    SetNotifications(AttributeHandle, bool),
}

/// How the fake answers a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    /// Report `Connected`.
    Succeed,
    /// Report `Disconnected` with this status.
    Fail(GattStatus),
    /// Accept and never answer.
    Silent,
}

struct FakeState {
    radio: RadioState,
    connect: ConnectBehaviour,
    services: Vec<RawService>,
    discovery_status: GattStatus,
    values: HashMap<AttributeHandle, Bytes>,
    read_status: GattStatus,
    write_status: GattStatus,
    descriptor_write_status: GattStatus,
    reject_notifications: bool,
    hold_completions: bool,
    held: Vec<GattEvent>,
    scan_sink: Option<ScanSink>,
    gatt_sink: Option<GattSink>,
    calls: Vec<Call>,
}

/// In-memory [`BlePlatform`] whose behaviour tests can script.
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                radio: RadioState::PoweredOn,
                connect: ConnectBehaviour::Succeed,
                services: sample_tree(),
                discovery_status: GattStatus::SUCCESS,
                values: HashMap::new(),
                read_status: GattStatus::SUCCESS,
                write_status: GattStatus::SUCCESS,
                descriptor_write_status: GattStatus::SUCCESS,
                reject_notifications: false,
                hold_completions: false,
                held: Vec::new(),
                scan_sink: None,
                gatt_sink: None,
                calls: Vec::new(),
            }),
        })
    }

    pub fn set_radio(&self, radio: RadioState) {
        self.state.lock().radio = radio;
    }

    pub fn set_connect_behaviour(&self, behaviour: ConnectBehaviour) {
        self.state.lock().connect = behaviour;
    }

    pub fn set_services(&self, services: Vec<RawService>) {
        self.state.lock().services = services;
    }

    pub fn set_discovery_status(&self, status: GattStatus) {
        self.state.lock().discovery_status = status;
    }

    pub fn set_value(&self, handle: AttributeHandle, value: impl Into<Bytes>) {
        self.state.lock().values.insert(handle, value.into());
    }

    pub fn set_read_status(&self, status: GattStatus) {
        self.state.lock().read_status = status;
    }

    pub fn set_write_status(&self, status: GattStatus) {
        self.state.lock().write_status = status;
    }

    pub fn set_descriptor_write_status(&self, status: GattStatus) {
        self.state.lock().descriptor_write_status = status;
    }

    pub fn reject_notifications(&self, reject: bool) {
        self.state.lock().reject_notifications = reject;
    }

    /// Keep completions until [`FakePlatform::release_completions`].
    pub fn hold_completions(&self) {
        self.state.lock().hold_completions = true;
    }

    /// Deliver held completions in order and stop holding.
    pub fn release_completions(&self) {
        let (sink, held) = {
            let mut state = self.state.lock();
            state.hold_completions = false;
            (state.gatt_sink.clone(), std::mem::take(&mut state.held))
        };
        if let Some(sink) = sink {
            for event in held {
                sink.send(event);
            }
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Sink of the most recent connect.
    pub fn gatt_sink(&self) -> Option<GattSink> {
        self.state.lock().gatt_sink.clone()
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let sink = self.state.lock().scan_sink.clone();
        if let Some(sink) = sink {
            sink.advertisement(advertisement);
        }
    }

    pub fn fail_scan(&self, code: i32) {
        let sink = self.state.lock().scan_sink.take();
        if let Some(sink) = sink {
            sink.scan_failed(code);
        }
    }

    /// Push a value on the current link.
    pub fn notify(&self, handle: AttributeHandle, value: impl Into<Bytes>) {
        if let Some(sink) = self.gatt_sink() {
            sink.characteristic_changed(handle, value.into());
        }
    }

    /// Simulate the peer dropping the link.
    pub fn drop_link(&self, status: GattStatus) {
        if let Some(sink) = self.gatt_sink() {
            sink.disconnected(status);
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn complete(&self, event: GattEvent) {
        let sink = {
            let mut state = self.state.lock();
            if state.hold_completions {
                state.held.push(event);
                return;
            }
            state.gatt_sink.clone()
        };
        if let Some(sink) = sink {
            sink.send(event);
        }
    }

    fn check_link(&self, link: LinkId) -> Result<(), PlatformError> {
        match &self.state.lock().gatt_sink {
            Some(sink) if sink.link() == link => Ok(()),
            _ => Err(PlatformError::UnknownLink(link)),
        }
    }
}

#[async_trait]
impl BlePlatform for FakePlatform {
    async fn radio_state(&self) -> RadioState {
        self.state.lock().radio
    }

    async fn start_scan(&self, mode: ScanMode, sink: ScanSink) -> Result<(), PlatformError> {
        self.record(Call::StartScan(mode));
        self.state.lock().scan_sink = Some(sink);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), PlatformError> {
        self.record(Call::StopScan);
        self.state.lock().scan_sink = None;
        Ok(())
    }

    async fn connect(&self, address: &str, sink: GattSink) -> Result<(), PlatformError> {
        self.record(Call::Connect(address.to_string()));
        let behaviour = {
            let mut state = self.state.lock();
            state.gatt_sink = Some(sink.clone());
            state.held.clear();
            state.connect
        };

        match behaviour {
            ConnectBehaviour::Succeed => sink.connected(),
            ConnectBehaviour::Fail(status) => sink.disconnected(status),
            ConnectBehaviour::Silent => {}
        }
        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> Result<(), PlatformError> {
        self.record(Call::DiscoverServices(link));
        self.check_link(link)?;

        let (status, services) = {
            let state = self.state.lock();
            (state.discovery_status, state.services.clone())
        };
        if let Some(sink) = self.gatt_sink() {
            if status.is_success() {
                sink.services_discovered(status, services);
            } else {
                sink.services_discovered(status, Vec::new());
            }
        }
        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> Result<(), PlatformError> {
        self.record(Call::Disconnect(link));
        let mut state = self.state.lock();
        if state.gatt_sink.as_ref().map(|s| s.link()) == Some(link) {
            state.held.clear();
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> Result<(), PlatformError> {
        self.record(Call::ReadCharacteristic(handle));
        self.check_link(link)?;

        let (status, value) = {
            let state = self.state.lock();
            (
                state.read_status,
                state.values.get(&handle).cloned().unwrap_or_default(),
            )
        };
        let value = if status.is_success() { value } else { Bytes::new() };
        self.complete(GattEvent::CharacteristicRead {
            handle,
            status,
            value,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
        write_type: WriteType,
    ) -> Result<(), PlatformError> {
        self.record(Call::WriteCharacteristic(handle, value.to_vec(), write_type));
        self.check_link(link)?;

        let status = self.state.lock().write_status;
        self.complete(GattEvent::CharacteristicWritten { handle, status });
        Ok(())
    }

    async fn read_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
    ) -> Result<(), PlatformError> {
        self.record(Call::ReadDescriptor(handle));
        self.check_link(link)?;

        let (status, value) = {
            let state = self.state.lock();
            (
                state.read_status,
                state.values.get(&handle).cloned().unwrap_or_default(),
            )
        };
        self.complete(GattEvent::DescriptorRead {
            handle,
            status,
            value,
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        value: Bytes,
    ) -> Result<(), PlatformError> {
        self.record(Call::WriteDescriptor(handle, value.to_vec()));
        self.check_link(link)?;

        let status = self.state.lock().descriptor_write_status;
        self.complete(GattEvent::DescriptorWritten { handle, status });
        Ok(())
    }

    async fn set_notifications(
        &self,
        link: LinkId,
        handle: AttributeHandle,
        enable: bool,
    ) -> Result<(), PlatformError> {
        self.record(Call::SetNotifications(handle, enable));
        self.check_link(link)?;

        if enable && self.state.lock().reject_notifications {
            return Err(PlatformError::Backend("no notification slots".to_string()));
        }
        Ok(())
    }
}

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait until the watched state equals `expected`.
pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while *rx.borrow_and_update() != expected {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", expected));
}
