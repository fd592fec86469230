//! BLE connection management.
//!
//! A single task owns the active link. Commands from callers and callbacks
//! from the platform both arrive in its inbox and are handled one at a time,
//! so the link state, the attribute tree and the in-flight request are never
//! touched concurrently.
//!
//! At most one GATT request is outstanding on the link. Requests issued while
//! another is in flight are queued and issued in order once the platform
//! reports the previous completion.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::attributes::GattService;
use crate::ble::link::Link;
use crate::ble::uuids::{CCCD_UUID, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
use crate::config::BleConfig;
use crate::error::{Error, Result};
use crate::platform::{
    AttributeHandle, BlePlatform, GattEvent, GattSink, GattStatus, LinkId, PlatformError,
};
use crate::utils::to_hex_string;

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Link-layer connection being established.
    Connecting,
    /// Link up.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Address of the peer.
    pub address: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// A value pushed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Characteristic the value belongs to.
    pub characteristic_uuid: Uuid,
    /// Pushed value.
    pub value: Bytes,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// A GATT request waiting to be issued.
#[derive(Debug)]
pub(crate) enum Request {
    ReadCharacteristic {
        uuid: Uuid,
        reply: Reply<Bytes>,
    },
    WriteCharacteristic {
        uuid: Uuid,
        value: Bytes,
        reply: Reply<()>,
    },
    ReadDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        reply: Reply<Bytes>,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
        reply: Reply<()>,
    },
    EnableNotifications {
        uuid: Uuid,
        reply: Reply<()>,
    },
}

impl Request {
    fn fail(self, error: Error) {
        match self {
            Self::ReadCharacteristic { reply, .. } | Self::ReadDescriptor { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::WriteCharacteristic { reply, .. }
            | Self::WriteDescriptor { reply, .. }
            | Self::EnableNotifications { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Message in the connection manager's inbox.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Callback from the platform.
    Event { link: LinkId, event: GattEvent },
    Connect { address: String, reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    Request(Request),
    Shutdown,
}

/// Completion kinds, used to match callbacks against the in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
}

/// An issued request awaiting its completion.
enum Op {
    ReadCharacteristic {
        handle: AttributeHandle,
        uuid: Uuid,
        reply: Reply<Bytes>,
    },
    /// `reply` is `None` once an unacknowledged write has been answered.
    WriteCharacteristic {
        handle: AttributeHandle,
        reply: Option<Reply<()>>,
    },
    ReadDescriptor {
        handle: AttributeHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        reply: Reply<Bytes>,
    },
    WriteDescriptor {
        handle: AttributeHandle,
        reply: Reply<()>,
    },
    /// CCCD write, the second step of enabling notifications.
    EnableNotifications {
        handle: AttributeHandle,
        characteristic_handle: AttributeHandle,
        uuid: Uuid,
        reply: Reply<()>,
    },
}

impl Op {
    fn kind(&self) -> OpKind {
        match self {
            Self::ReadCharacteristic { .. } => OpKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => OpKind::WriteCharacteristic,
            Self::ReadDescriptor { .. } => OpKind::ReadDescriptor,
            Self::WriteDescriptor { .. } | Self::EnableNotifications { .. } => {
                OpKind::WriteDescriptor
            }
        }
    }

    fn handle(&self) -> AttributeHandle {
        match self {
            Self::ReadCharacteristic { handle, .. }
            | Self::WriteCharacteristic { handle, .. }
            | Self::ReadDescriptor { handle, .. }
            | Self::WriteDescriptor { handle, .. }
            | Self::EnableNotifications { handle, .. } => *handle,
        }
    }

    fn fail(self, error: Error) {
        match self {
            Self::ReadCharacteristic { reply, .. } | Self::ReadDescriptor { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::WriteCharacteristic {
                reply: Some(reply), ..
            }
            | Self::WriteDescriptor { reply, .. }
            | Self::EnableNotifications { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::WriteCharacteristic { reply: None, .. } => {}
        }
    }
}

struct InFlight {
    op: Op,
    deadline: Instant,
}

struct PendingConnect {
    reply: Reply<()>,
    deadline: Instant,
}

fn not_found(uuid: &Uuid) -> Error {
    Error::NotFound {
        uuid: uuid.to_string(),
    }
}

/// Map an issue-time rejection to the error reported to the caller.
fn rejected(error: PlatformError) -> Error {
    match error {
        PlatformError::Rejected(status) => Error::OperationFailed { status },
        other => Error::Platform(other),
    }
}

fn status_result(status: GattStatus) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { status })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The task owning the link.
struct Actor {
    platform: Arc<dyn BlePlatform>,
    /// Handed to every new [`GattSink`].
    tx: mpsc::UnboundedSender<Inbound>,
    connect_timeout: Duration,
    operation_timeout: Duration,
    next_link: LinkId,
    link: Option<Link>,
    pending_connect: Option<PendingConnect>,
    in_flight: Option<InFlight>,
    queue: VecDeque<Request>,
    state_tx: watch::Sender<ConnectionState>,
    services_tx: watch::Sender<Vec<Arc<GattService>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    notification_tx: broadcast::Sender<NotificationEvent>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        debug!("Connection manager started");

        loop {
            let deadline = self.next_deadline();

            let msg = tokio::select! {
                biased;
                msg = rx.recv() => msg,
                _ = sleep_until(deadline) => {
                    self.on_deadline().await;
                    continue;
                }
            };

            match msg {
                Some(Inbound::Event { link, event }) => self.on_event(link, event).await,
                Some(Inbound::Connect { address, reply }) => self.on_connect(address, reply).await,
                Some(Inbound::Disconnect { reply }) => self.on_disconnect(reply).await,
                Some(Inbound::Request(request)) => self.on_request(request).await,
                Some(Inbound::Shutdown) | None => break,
            }
        }

        self.close_link("connection manager shut down").await;
        debug!("Connection manager stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, address: &str, new_state: ConnectionState) {
        let old_state = self.state_tx.send_replace(new_state);

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                address: address.to_string(),
                state: new_state,
            });
        }
    }

    fn publish_services(&self) {
        let services = self
            .link
            .as_ref()
            .map(|link| link.services().to_vec())
            .unwrap_or_default();
        self.services_tx.send_replace(services);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let connect = self.pending_connect.as_ref().map(|p| p.deadline);
        let request = self.in_flight.as_ref().map(|f| f.deadline);
        match (connect, request) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if self
            .pending_connect
            .as_ref()
            .is_some_and(|pending| pending.deadline <= now)
        {
            let pending = self.pending_connect.take();
            warn!("Connection attempt timed out");
            self.close_link("connection attempt timed out").await;
            if let Some(pending) = pending {
                let _ = pending.reply.send(Err(Error::Timeout));
            }
            return;
        }

        if self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.deadline <= now)
        {
            let Some(in_flight) = self.in_flight.take() else {
                return;
            };
            warn!(
                "{:?} on handle {} timed out, closing link",
                in_flight.op.kind(),
                in_flight.op.handle()
            );
            self.close_link("request timed out").await;
            in_flight.op.fail(Error::Timeout);
        }
    }

    /// Release the link, report `Disconnected`, then fail everything that
    /// was waiting on it.
    async fn close_link(&mut self, reason: &str) {
        let Some(link) = self.link.take() else {
            return;
        };

        if let Err(e) = self.platform.disconnect(link.id).await {
            warn!("Failed to release link to {}: {}", link.address, e);
        }

        self.services_tx.send_if_modified(|services| {
            let had_services = !services.is_empty();
            services.clear();
            had_services
        });

        info!("Link to {} closed: {}", link.address, reason);
        self.set_state(&link.address, ConnectionState::Disconnected);

        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.reply.send(Err(Error::ConnectionFailed {
                reason: reason.to_string(),
            }));
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.op.fail(Error::ConnectionLost);
        }
        for request in self.queue.drain(..) {
            request.fail(Error::ConnectionLost);
        }
    }

    async fn on_connect(&mut self, address: String, reply: Reply<()>) {
        if let Some(link) = &self.link {
            if link.address == address && self.state().is_connected() {
                debug!("Already connected to {}", address);
                let _ = reply.send(Ok(()));
                return;
            }

            info!(
                "Closing link to {} before connecting to {}",
                link.address, address
            );
            self.close_link("superseded by a new connection").await;
        }

        self.next_link += 1;
        let id = self.next_link;
        self.link = Some(Link::new(id, address.clone()));
        self.set_state(&address, ConnectionState::Connecting);

        info!("Connecting to {}", address);

        let sink = GattSink::new(id, self.tx.clone());
        match self.platform.connect(&address, sink).await {
            Ok(()) => {
                self.pending_connect = Some(PendingConnect {
                    reply,
                    deadline: Instant::now() + self.connect_timeout,
                });
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                // Never accepted, so there is nothing to release
                self.link = None;
                self.set_state(&address, ConnectionState::Disconnected);
                let _ = reply.send(Err(Error::ConnectionFailed {
                    reason: e.to_string(),
                }));
            }
        }
    }

    async fn on_disconnect(&mut self, reply: Reply<()>) {
        let Some(address) = self.link.as_ref().map(|link| link.address.clone()) else {
            debug!("Already disconnected");
            let _ = reply.send(Ok(()));
            return;
        };

        info!("Disconnecting from {}", address);
        self.set_state(&address, ConnectionState::Disconnecting);
        self.close_link("disconnect requested").await;
        let _ = reply.send(Ok(()));
    }

    async fn on_event(&mut self, link: LinkId, event: GattEvent) {
        if self.link.as_ref().map(|l| l.id) != Some(link) {
            trace!("Dropping callback for stale link {}: {:?}", link, event);
            return;
        }

        match event {
            GattEvent::Connected => self.on_connected(link).await,
            GattEvent::Disconnected { status } => {
                warn!("Link lost: {}", status);
                self.close_link(&format!("link lost: {}", status)).await;
            }
            GattEvent::ServicesDiscovered { status, services } => {
                if !status.is_success() {
                    error!("Service discovery failed: {}", status);
                    self.close_link(&format!("service discovery failed: {}", status))
                        .await;
                    return;
                }

                let Some(current) = self.link.as_mut() else {
                    return;
                };
                current.replace_services(&services);

                info!(
                    "Discovered {} services on {}",
                    current.services().len(),
                    current.address
                );
                for service in current.services() {
                    debug!(
                        "  {} ({}): {} characteristics",
                        service.name,
                        service.uuid,
                        service.characteristics.len()
                    );
                }
                self.publish_services();

                if let Some(pending) = self.pending_connect.take() {
                    let _ = pending.reply.send(Ok(()));
                }
            }
            GattEvent::CharacteristicRead {
                handle,
                status,
                value,
            } => {
                self.on_completion(OpKind::ReadCharacteristic, handle, status, value)
                    .await
            }
            GattEvent::CharacteristicWritten { handle, status } => {
                self.on_completion(OpKind::WriteCharacteristic, handle, status, Bytes::new())
                    .await
            }
            GattEvent::DescriptorRead {
                handle,
                status,
                value,
            } => {
                self.on_completion(OpKind::ReadDescriptor, handle, status, value)
                    .await
            }
            GattEvent::DescriptorWritten { handle, status } => {
                self.on_completion(OpKind::WriteDescriptor, handle, status, Bytes::new())
                    .await
            }
            GattEvent::CharacteristicChanged { handle, value } => {
                self.on_value_changed(handle, value)
            }
        }
    }

    async fn on_connected(&mut self, link: LinkId) {
        if self.state() != ConnectionState::Connecting {
            debug!("Ignoring repeated connected callback");
            return;
        }

        let address = self
            .link
            .as_ref()
            .map(|l| l.address.clone())
            .unwrap_or_default();
        self.set_state(&address, ConnectionState::Connected);
        info!("Connected to {}, discovering services", address);

        if let Err(e) = self.platform.discover_services(link).await {
            error!("Failed to start service discovery: {}", e);
            self.close_link(&format!("service discovery failed: {}", e))
                .await;
        }
    }

    fn on_value_changed(&mut self, handle: AttributeHandle, value: Bytes) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let Some(uuid) = link.characteristic_at(handle) else {
            debug!("Value pushed for unknown handle {}", handle);
            return;
        };

        trace!("Notification from {}: {}", uuid, to_hex_string(&value));

        if link.update_characteristic(&uuid, value.clone()) {
            self.publish_services();
        }

        let _ = self.notification_tx.send(NotificationEvent {
            characteristic_uuid: uuid,
            value,
        });
    }

    async fn on_request(&mut self, request: Request) {
        if self.link.is_none() || !self.state().is_connected() {
            request.fail(Error::NotConnected);
            return;
        }

        if self.in_flight.is_some() {
            trace!("Request in flight, queueing ({} waiting)", self.queue.len());
            self.queue.push_back(request);
            return;
        }

        self.issue(request).await;
    }

    async fn issue_next(&mut self) {
        while self.in_flight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.issue(request).await;
        }
    }

    /// Resolve the request against the current tree and hand it to the
    /// platform. UUIDs are looked up here, not when the request was queued.
    async fn issue(&mut self, request: Request) {
        let Some(link) = self.link.as_ref() else {
            request.fail(Error::NotConnected);
            return;
        };
        let link_id = link.id;

        let op = match request {
            Request::ReadCharacteristic { uuid, reply } => {
                let Some((handle, _)) = link.characteristic(&uuid) else {
                    let _ = reply.send(Err(not_found(&uuid)));
                    return;
                };

                debug!("Reading characteristic {}", uuid);
                if let Err(e) = self.platform.read_characteristic(link_id, handle).await {
                    let _ = reply.send(Err(rejected(e)));
                    return;
                }
                Op::ReadCharacteristic {
                    handle,
                    uuid,
                    reply,
                }
            }
            Request::WriteCharacteristic { uuid, value, reply } => {
                let Some((handle, characteristic)) = link.characteristic(&uuid) else {
                    let _ = reply.send(Err(not_found(&uuid)));
                    return;
                };
                let Some(write_type) = characteristic.write_type else {
                    let _ = reply.send(Err(Error::NotWritable {
                        uuid: uuid.to_string(),
                    }));
                    return;
                };

                debug!(
                    "Writing {} to {} ({:?})",
                    to_hex_string(&value),
                    uuid,
                    write_type
                );
                if let Err(e) = self
                    .platform
                    .write_characteristic(link_id, handle, value, write_type)
                    .await
                {
                    let _ = reply.send(Err(rejected(e)));
                    return;
                }

                if write_type.requires_response() {
                    Op::WriteCharacteristic {
                        handle,
                        reply: Some(reply),
                    }
                } else {
                    let _ = reply.send(Ok(()));
                    Op::WriteCharacteristic {
                        handle,
                        reply: None,
                    }
                }
            }
            Request::ReadDescriptor {
                characteristic,
                descriptor,
                reply,
            } => {
                let handle = match descriptor_handle(link, &characteristic, &descriptor) {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                debug!("Reading descriptor {} of {}", descriptor, characteristic);
                if let Err(e) = self.platform.read_descriptor(link_id, handle).await {
                    let _ = reply.send(Err(rejected(e)));
                    return;
                }
                Op::ReadDescriptor {
                    handle,
                    characteristic,
                    descriptor,
                    reply,
                }
            }
            Request::WriteDescriptor {
                characteristic,
                descriptor,
                value,
                reply,
            } => {
                let handle = match descriptor_handle(link, &characteristic, &descriptor) {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                debug!(
                    "Writing {} to descriptor {} of {}",
                    to_hex_string(&value),
                    descriptor,
                    characteristic
                );
                if let Err(e) = self.platform.write_descriptor(link_id, handle, value).await {
                    let _ = reply.send(Err(rejected(e)));
                    return;
                }
                Op::WriteDescriptor { handle, reply }
            }
            Request::EnableNotifications { uuid, reply } => {
                let Some((characteristic_handle, characteristic)) = link.characteristic(&uuid)
                else {
                    let _ = reply.send(Err(not_found(&uuid)));
                    return;
                };

                if !characteristic.supports_push() {
                    warn!("{} supports neither notify nor indicate", uuid);
                    let _ = reply.send(Err(Error::NotifyRegistrationFailed {
                        uuid: uuid.to_string(),
                    }));
                    return;
                }

                let Some(handle) = link.descriptor_handle(&uuid, &CCCD_UUID) else {
                    let _ = reply.send(Err(not_found(&CCCD_UUID)));
                    return;
                };

                let value = if characteristic.is_notifiable {
                    ENABLE_NOTIFICATION_VALUE
                } else {
                    ENABLE_INDICATION_VALUE
                };

                if let Err(e) = self
                    .platform
                    .set_notifications(link_id, characteristic_handle, true)
                    .await
                {
                    warn!("Failed to enable notification delivery for {}: {}", uuid, e);
                    let _ = reply.send(Err(Error::NotifyRegistrationFailed {
                        uuid: uuid.to_string(),
                    }));
                    return;
                }

                debug!("Writing {} to CCCD of {}", to_hex_string(&value), uuid);
                if let Err(e) = self
                    .platform
                    .write_descriptor(link_id, handle, Bytes::copy_from_slice(&value))
                    .await
                {
                    self.disable_delivery(link_id, characteristic_handle).await;
                    let _ = reply.send(Err(rejected(e)));
                    return;
                }
                Op::EnableNotifications {
                    handle,
                    characteristic_handle,
                    uuid,
                    reply,
                }
            }
        };

        self.in_flight = Some(InFlight {
            op,
            deadline: Instant::now() + self.operation_timeout,
        });
    }

    async fn disable_delivery(&self, link: LinkId, handle: AttributeHandle) {
        if let Err(e) = self.platform.set_notifications(link, handle, false).await {
            warn!("Failed to disable notification delivery: {}", e);
        }
    }

    async fn on_completion(
        &mut self,
        kind: OpKind,
        handle: AttributeHandle,
        status: GattStatus,
        value: Bytes,
    ) {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.op.kind() == kind && f.op.handle() == handle);
        if !matches {
            warn!("Dropping unexpected {:?} completion for handle {}", kind, handle);
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        trace!("{:?} on handle {} completed: {}", kind, handle, status);

        match in_flight.op {
            Op::ReadCharacteristic { uuid, reply, .. } => {
                if status.is_success() {
                    if let Some(link) = self.link.as_mut() {
                        if link.update_characteristic(&uuid, value.clone()) {
                            self.publish_services();
                        }
                    }
                    let _ = reply.send(Ok(value));
                } else {
                    warn!("Read of {} failed: {}", uuid, status);
                    let _ = reply.send(Err(Error::OperationFailed { status }));
                }
            }
            Op::ReadDescriptor {
                characteristic,
                descriptor,
                reply,
                ..
            } => {
                if status.is_success() {
                    if let Some(link) = self.link.as_mut() {
                        if link.update_descriptor(&characteristic, &descriptor, value.clone()) {
                            self.publish_services();
                        }
                    }
                    let _ = reply.send(Ok(value));
                } else {
                    warn!("Read of descriptor {} failed: {}", descriptor, status);
                    let _ = reply.send(Err(Error::OperationFailed { status }));
                }
            }
            Op::WriteCharacteristic {
                reply: Some(reply), ..
            }
            | Op::WriteDescriptor { reply, .. } => {
                let _ = reply.send(status_result(status));
            }
            Op::WriteCharacteristic { reply: None, .. } => {
                if !status.is_success() {
                    warn!("Unacknowledged write to handle {} failed: {}", handle, status);
                }
            }
            Op::EnableNotifications {
                characteristic_handle,
                uuid,
                reply,
                ..
            } => {
                if status.is_success() {
                    info!("Notifications enabled for {}", uuid);
                } else {
                    warn!("CCCD write for {} failed: {}", uuid, status);
                    if let Some(link) = self.link.as_ref().map(|l| l.id) {
                        self.disable_delivery(link, characteristic_handle).await;
                    }
                }
                let _ = reply.send(status_result(status));
            }
        }

        self.issue_next().await;
    }
}

fn descriptor_handle(
    link: &Link,
    characteristic: &Uuid,
    descriptor: &Uuid,
) -> Result<AttributeHandle> {
    if link.characteristic(characteristic).is_none() {
        return Err(not_found(characteristic));
    }
    link.descriptor_handle(characteristic, descriptor)
        .ok_or_else(|| not_found(descriptor))
}

/// Manages the single GATT client link.
///
/// Dropping the manager stops its task and closes any open link.
pub struct ConnectionManager {
    /// Inbox of the task owning the link.
    tx: mpsc::UnboundedSender<Inbound>,
    /// Current connection state.
    state_rx: watch::Receiver<ConnectionState>,
    /// Current attribute tree.
    services_rx: watch::Receiver<Vec<Arc<GattService>>>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Channel for pushed values.
    notification_tx: broadcast::Sender<NotificationEvent>,
}

impl ConnectionManager {
    /// Create a connection manager on `platform` and start its task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(platform: Arc<dyn BlePlatform>, config: &BleConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (services_tx, services_rx) = watch::channel(Vec::new());
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (notification_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let actor = Actor {
            platform,
            tx: tx.clone(),
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
            next_link: 0,
            link: None,
            pending_connect: None,
            in_flight: None,
            queue: VecDeque::new(),
            state_tx,
            services_tx,
            event_tx: event_tx.clone(),
            notification_tx: notification_tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            state_rx,
            services_rx,
            event_tx,
            notification_tx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Snapshot of the discovered services.
    pub fn services(&self) -> Vec<Arc<GattService>> {
        self.services_rx.borrow().clone()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Watch the discovered services.
    pub fn watch_services(&self) -> watch::Receiver<Vec<Arc<GattService>>> {
        self.services_rx.clone()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to pushed values.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notification_tx.subscribe()
    }

    /// Connect to `address` and discover its services.
    ///
    /// Resolves once discovery has finished. Any existing link to another
    /// peer is closed first.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.call(|reply| Inbound::Connect { address, reply }).await
    }

    /// Close the link. Does nothing if there is none.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| Inbound::Disconnect { reply }).await
    }

    /// Read a characteristic and cache its value.
    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Bytes> {
        self.call(|reply| Inbound::Request(Request::ReadCharacteristic { uuid, reply }))
            .await
    }

    /// Write a characteristic using the best write mode it supports.
    ///
    /// For writes without response this resolves once the platform has
    /// accepted the request.
    pub async fn write_characteristic(&self, uuid: Uuid, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        self.call(|reply| {
            Inbound::Request(Request::WriteCharacteristic { uuid, value, reply })
        })
        .await
    }

    /// Read a descriptor and cache its value.
    pub async fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<Bytes> {
        self.call(|reply| {
            Inbound::Request(Request::ReadDescriptor {
                characteristic,
                descriptor,
                reply,
            })
        })
        .await
    }

    /// Write a descriptor.
    pub async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let value = value.into();
        self.call(|reply| {
            Inbound::Request(Request::WriteDescriptor {
                characteristic,
                descriptor,
                value,
                reply,
            })
        })
        .await
    }

    /// Enable value pushes for a characteristic.
    ///
    /// Turns on local delivery, then writes the CCCD. If the CCCD write
    /// fails, local delivery is turned off again.
    pub async fn enable_notifications(&self, uuid: Uuid) -> Result<()> {
        self.call(|reply| Inbound::Request(Request::EnableNotifications { uuid, reply }))
            .await
    }

    /// Stop the task, closing any open link.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Inbound::Shutdown);
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Inbound) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::Internal("connection manager stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("connection manager dropped the request".to_string()))?
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
