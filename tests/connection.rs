mod common;

use blelink::ble::uuids::{uuid_from_u16, CCCD_UUID, USER_DESCRIPTION_DESCRIPTOR_UUID};
use blelink::ble::ConnectionManager;
use blelink::{BleConfig, BlePlatform, ConnectionState, Error, GattStatus, WriteType};
use bytes::Bytes;
use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn manager(fake: &Arc<FakePlatform>) -> ConnectionManager {
    manager_with(fake, BleConfig::default())
}

fn manager_with(fake: &Arc<FakePlatform>, config: BleConfig) -> ConnectionManager {
    init_tracing();
    let platform: Arc<dyn BlePlatform> = fake.clone();
    ConnectionManager::new(platform, &config)
}

async fn connected(fake: &Arc<FakePlatform>) -> ConnectionManager {
    let manager = manager(fake);
    manager.connect(ADDRESS).await.unwrap();
    fake.clear_calls();
    manager
}

#[tokio::test]
async fn test_connect_publishes_services_and_events() {
    let fake = FakePlatform::new();
    let manager = manager(&fake);
    let mut events = manager.subscribe();

    manager.connect(ADDRESS).await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    let names: Vec<_> = manager.services().iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Heart Rate", "Battery", "Nordic UART Service", "Generic Access"]);

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!(first.state, ConnectionState::Connecting);
    assert_eq!(second.state, ConnectionState::Connected);
    assert_eq!(second.address, ADDRESS);

    let calls = fake.calls();
    assert_eq!(calls[0], Call::Connect(ADDRESS.to_string()));
    assert!(matches!(calls[1], Call::DiscoverServices(_)));
}

#[tokio::test]
async fn test_connect_to_same_peer_twice_is_a_noop() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    manager.connect(ADDRESS).await.unwrap();
    assert!(fake.calls().is_empty());
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_failed_connect_reports_connection_failed() {
    let fake = FakePlatform::new();
    fake.set_connect_behaviour(ConnectBehaviour::Fail(GattStatus::GATT_ERROR));
    let manager = manager(&fake);

    let result = manager.connect(ADDRESS).await;
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.services().is_empty());
}

#[tokio::test]
async fn test_failed_discovery_closes_the_link() {
    let fake = FakePlatform::new();
    fake.set_discovery_status(GattStatus::GATT_ERROR);
    let manager = manager(&fake);

    let result = manager.connect(ADDRESS).await;
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(fake
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Disconnect(_))));
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    let fake = FakePlatform::new();
    fake.set_connect_behaviour(ConnectBehaviour::Silent);
    let manager = manager(&fake);
    let mut state = manager.watch_state();

    let (connect, disconnect) = tokio::join!(manager.connect(ADDRESS), async {
        wait_for_state(&mut state, ConnectionState::Connecting).await;
        manager.disconnect().await
    });

    assert!(matches!(connect, Err(Error::ConnectionFailed { .. })));
    disconnect.unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.services().is_empty());
}

#[tokio::test]
async fn test_connect_timeout() {
    let fake = FakePlatform::new();
    fake.set_connect_behaviour(ConnectBehaviour::Silent);
    let manager = manager_with(
        &fake,
        BleConfig::default().with_connect_timeout(Duration::from_millis(50)),
    );

    let result = manager.connect(ADDRESS).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    manager.disconnect().await.unwrap();
    manager.disconnect().await.unwrap();

    let disconnects = fake
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Disconnect(_)))
        .count();
    assert_eq!(disconnects, 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.services().is_empty());
}

#[tokio::test]
async fn test_read_caches_value_and_replaces_only_its_path() {
    let fake = FakePlatform::new();
    fake.set_value(BATTERY_LEVEL_HANDLE, vec![0x64]);
    let manager = connected(&fake).await;
    let before = manager.services();

    let value = manager.read_characteristic(BATTERY_LEVEL).await.unwrap();
    assert_eq!(&value[..], &[0x64]);

    let after = manager.services();
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert!(!Arc::ptr_eq(&before[1], &after[1]));
    assert!(Arc::ptr_eq(&before[2], &after[2]));
    assert!(Arc::ptr_eq(&before[3], &after[3]));

    let level = after[1].characteristic(&BATTERY_LEVEL).unwrap();
    assert_eq!(level.last_read_value.as_deref(), Some(&[0x64][..]));
    assert_eq!(fake.calls(), vec![Call::ReadCharacteristic(BATTERY_LEVEL_HANDLE)]);
}

#[tokio::test]
async fn test_failed_read_leaves_tree_untouched() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    fake.set_read_status(GattStatus::READ_NOT_PERMITTED);
    let before = manager.services();

    let result = manager.read_characteristic(BATTERY_LEVEL).await;
    match result {
        Err(Error::OperationFailed { status }) => {
            assert_eq!(status, GattStatus::READ_NOT_PERMITTED)
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let after = manager.services();
    assert!(Arc::ptr_eq(&before[1], &after[1]));
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_read_descriptor_caches_on_descriptor() {
    let fake = FakePlatform::new();
    fake.set_value(BATTERY_LEVEL_DESCRIPTION, Bytes::from_static(b"Level"));
    let manager = connected(&fake).await;

    let value = manager
        .read_descriptor(BATTERY_LEVEL, USER_DESCRIPTION_DESCRIPTOR_UUID)
        .await
        .unwrap();
    assert_eq!(&value[..], b"Level");

    let services = manager.services();
    let level = services[1].characteristic(&BATTERY_LEVEL).unwrap();
    let description = level.descriptor(&USER_DESCRIPTION_DESCRIPTOR_UUID).unwrap();
    assert_eq!(description.last_read_value.as_deref(), Some(&b"Level"[..]));
    assert_eq!(level.last_read_value, None);
}

#[tokio::test]
async fn test_descriptor_lookup_errors() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    let missing_char = manager
        .read_descriptor(uuid_from_u16(0x2a6e), CCCD_UUID)
        .await;
    assert!(matches!(missing_char, Err(Error::NotFound { .. })));

    let missing_desc = manager
        .write_descriptor(DEVICE_NAME, CCCD_UUID, vec![1, 0])
        .await;
    match missing_desc {
        Err(Error::NotFound { uuid }) => assert_eq!(uuid, CCCD_UUID.to_string()),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_write_type_follows_properties() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    manager
        .write_characteristic(HR_CONTROL_POINT, vec![0x01])
        .await
        .unwrap();
    manager.write_characteristic(UART_RX, vec![0x02]).await.unwrap();
    manager
        .write_characteristic(SIGNED_ONLY, vec![0x03])
        .await
        .unwrap();

    // Let the last unacknowledged completion drain
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        fake.calls(),
        vec![
            Call::WriteCharacteristic(HR_CONTROL_POINT_HANDLE, vec![0x01], WriteType::WithResponse),
            Call::WriteCharacteristic(UART_RX_HANDLE, vec![0x02], WriteType::WithoutResponse),
            Call::WriteCharacteristic(SIGNED_ONLY_HANDLE, vec![0x03], WriteType::Signed),
        ]
    );
}

#[tokio::test]
async fn test_write_not_permitted() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    fake.set_write_status(GattStatus::WRITE_NOT_PERMITTED);

    let result = manager.write_characteristic(HR_CONTROL_POINT, vec![0x01]).await;
    assert!(matches!(
        result,
        Err(Error::OperationFailed {
            status: GattStatus::WRITE_NOT_PERMITTED
        })
    ));

    let result = manager.write_characteristic(DEVICE_NAME, vec![0x01]).await;
    assert!(matches!(result, Err(Error::NotWritable { .. })));
}

#[tokio::test]
async fn test_unacknowledged_write_resolves_before_completion() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    fake.set_value(BATTERY_LEVEL_HANDLE, vec![0x42]);
    fake.hold_completions();

    timeout(
        Duration::from_secs(1),
        manager.write_characteristic(UART_RX, vec![0x02, 0x00]),
    )
    .await
    .expect("write should not wait for its completion")
    .unwrap();

    // The write still owns the link, so the read waits for its completion
    let (read, _) = tokio::join!(manager.read_characteristic(BATTERY_LEVEL), async {
        sleep(Duration::from_millis(50)).await;
        assert!(!fake
            .calls()
            .contains(&Call::ReadCharacteristic(BATTERY_LEVEL_HANDLE)));
        fake.release_completions();
    });

    assert_eq!(&read.unwrap()[..], &[0x42]);
}

#[tokio::test]
async fn test_requests_are_issued_in_order() {
    let fake = FakePlatform::new();
    fake.set_value(BATTERY_LEVEL_HANDLE, vec![1]);
    fake.set_value(DEVICE_NAME_HANDLE, Bytes::from_static(b"HRM"));
    let manager = connected(&fake).await;
    fake.hold_completions();

    let (level, name, write, _) = tokio::join!(
        manager.read_characteristic(BATTERY_LEVEL),
        manager.read_characteristic(DEVICE_NAME),
        manager.write_characteristic(HR_CONTROL_POINT, vec![0x01]),
        async {
            sleep(Duration::from_millis(50)).await;
            // Only the first request reached the platform
            assert_eq!(fake.calls().len(), 1);
            fake.release_completions();
        }
    );

    assert_eq!(&level.unwrap()[..], &[1]);
    assert_eq!(&name.unwrap()[..], b"HRM");
    write.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            Call::ReadCharacteristic(BATTERY_LEVEL_HANDLE),
            Call::ReadCharacteristic(DEVICE_NAME_HANDLE),
            Call::WriteCharacteristic(HR_CONTROL_POINT_HANDLE, vec![0x01], WriteType::WithResponse),
        ]
    );
}

#[tokio::test]
async fn test_enable_notifications_writes_cccd() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    manager.enable_notifications(HR_MEASUREMENT).await.unwrap();
    manager.enable_notifications(UART_TX).await.unwrap();

    assert_eq!(
        fake.calls(),
        vec![
            Call::SetNotifications(HR_MEASUREMENT_HANDLE, true),
            Call::WriteDescriptor(HR_MEASUREMENT_CCCD, vec![0x01, 0x00]),
            Call::SetNotifications(UART_TX_HANDLE, true),
            Call::WriteDescriptor(UART_TX_CCCD, vec![0x02, 0x00]),
        ]
    );
}

#[tokio::test]
async fn test_enable_notifications_on_plain_characteristic() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;

    let result = manager.enable_notifications(DEVICE_NAME).await;
    assert!(matches!(result, Err(Error::NotifyRegistrationFailed { .. })));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_registration_failure_skips_cccd_write() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    fake.reject_notifications(true);

    let result = manager.enable_notifications(HR_MEASUREMENT).await;
    assert!(matches!(result, Err(Error::NotifyRegistrationFailed { .. })));
    assert_eq!(
        fake.calls(),
        vec![Call::SetNotifications(HR_MEASUREMENT_HANDLE, true)]
    );
}

#[tokio::test]
async fn test_failed_cccd_write_disables_delivery() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    fake.set_descriptor_write_status(GattStatus::INSUFFICIENT_AUTHENTICATION);

    let result = manager.enable_notifications(BATTERY_LEVEL).await;
    assert!(matches!(
        result,
        Err(Error::OperationFailed {
            status: GattStatus::INSUFFICIENT_AUTHENTICATION
        })
    ));
    assert_eq!(
        fake.calls(),
        vec![
            Call::SetNotifications(BATTERY_LEVEL_HANDLE, true),
            Call::WriteDescriptor(BATTERY_LEVEL_CCCD, vec![0x01, 0x00]),
            Call::SetNotifications(BATTERY_LEVEL_HANDLE, false),
        ]
    );
}

#[tokio::test]
async fn test_notification_updates_only_its_characteristic() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    manager.enable_notifications(HR_MEASUREMENT).await.unwrap();
    let mut notifications = manager.subscribe_notifications();
    let mut services = manager.watch_services();
    services.borrow_and_update();
    let before = manager.services();

    fake.notify(HR_MEASUREMENT_HANDLE, vec![0x00, 0x48]);

    let event = timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.characteristic_uuid, HR_MEASUREMENT);
    assert_eq!(&event.value[..], &[0x00, 0x48]);

    timeout(Duration::from_secs(1), services.changed())
        .await
        .unwrap()
        .unwrap();
    let after = manager.services();

    let measurement = after[0].characteristic(&HR_MEASUREMENT).unwrap();
    assert_eq!(measurement.last_read_value.as_deref(), Some(&[0x00, 0x48][..]));

    let old_control = before[0].characteristic(&HR_CONTROL_POINT).unwrap();
    let new_control = after[0].characteristic(&HR_CONTROL_POINT).unwrap();
    assert!(Arc::ptr_eq(old_control, new_control));
    for (old, new) in before.iter().zip(after.iter()).skip(1) {
        assert!(Arc::ptr_eq(old, new));
    }
}

#[tokio::test]
async fn test_link_loss_fails_outstanding_requests() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    let mut state = manager.watch_state();
    fake.hold_completions();

    let (first, second, _) = tokio::join!(
        manager.read_characteristic(BATTERY_LEVEL),
        manager.read_characteristic(DEVICE_NAME),
        async {
            sleep(Duration::from_millis(50)).await;
            fake.drop_link(GattStatus::REMOTE_USER_TERMINATED);
        }
    );

    assert!(matches!(first, Err(Error::ConnectionLost)));
    assert!(matches!(second, Err(Error::ConnectionLost)));
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    assert!(manager.services().is_empty());

    let after = manager.read_characteristic(BATTERY_LEVEL).await;
    assert!(matches!(after, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_operation_timeout_closes_link() {
    let fake = FakePlatform::new();
    let manager = manager_with(
        &fake,
        BleConfig::default().with_operation_timeout(Duration::from_millis(50)),
    );
    manager.connect(ADDRESS).await.unwrap();
    fake.hold_completions();

    let result = manager.read_characteristic(BATTERY_LEVEL).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.services().is_empty());
    assert!(matches!(fake.calls().last(), Some(Call::Disconnect(_))));
}

#[tokio::test]
async fn test_stale_link_callbacks_are_ignored() {
    let fake = FakePlatform::new();
    let manager = connected(&fake).await;
    let old_sink = fake.gatt_sink().unwrap();

    manager.disconnect().await.unwrap();
    manager.connect(ADDRESS).await.unwrap();
    let new_sink = fake.gatt_sink().unwrap();
    assert_ne!(old_sink.link(), new_sink.link());

    let mut notifications = manager.subscribe_notifications();
    old_sink.characteristic_changed(HR_MEASUREMENT_HANDLE, Bytes::from_static(&[9]));
    old_sink.disconnected(GattStatus::REMOTE_USER_TERMINATED);

    let received = timeout(Duration::from_millis(100), notifications.recv()).await;
    assert!(received.is_err());
    assert!(manager.is_connected());
    let services = manager.services();
    assert_eq!(
        services[0]
            .characteristic(&HR_MEASUREMENT)
            .unwrap()
            .last_read_value,
        None
    );
}

#[tokio::test]
async fn test_reconnect_drops_cached_values_and_resolves_against_new_tree() {
    let fake = FakePlatform::new();
    fake.set_value(BATTERY_LEVEL_HANDLE, vec![0x10]);
    let manager = connected(&fake).await;
    manager.read_characteristic(BATTERY_LEVEL).await.unwrap();
    manager.disconnect().await.unwrap();

    let mut tree = sample_tree();
    tree.retain(|service| service.uuid != BATTERY_SERVICE);
    fake.set_services(tree);
    manager.connect(ADDRESS).await.unwrap();
    fake.clear_calls();

    assert_eq!(manager.services().len(), 3);
    let result = manager.read_characteristic(BATTERY_LEVEL).await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_requests_without_link() {
    let fake = FakePlatform::new();
    let manager = manager(&fake);

    assert!(matches!(
        manager.read_characteristic(BATTERY_LEVEL).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        manager.enable_notifications(HR_MEASUREMENT).await,
        Err(Error::NotConnected)
    ));
    assert!(fake.calls().is_empty());
}
