//! The per-peripheral GATT serializer: the connection state machine, read
//! coalescing, write exclusivity, back-pressure and notification dispatch.

mod common;

use bluekit::api::WriteType;
use bluekit::central::CentralManager;
use bluekit::peripheral::PeripheralState;
use bluekit::testing::MockHost;
use bluekit::Error;
use common::*;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn connected_is_observable_only_after_discovery() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(20));
    let peripheral = discover(&host, &central, &mock).await;

    let mut states = peripheral.state_stream();
    peripheral.connect().await.unwrap();

    // the service table is populated by the time `connected` is reported
    assert!(peripheral.services().is_some());
    assert!(peripheral.characteristic(BP_SERVICE, BP_MEASUREMENT).is_some());

    let mut observed = Vec::new();
    while let Ok(Some(state)) =
        tokio::time::timeout(Duration::from_millis(100), states.next()).await
    {
        observed.push(state);
        if state == PeripheralState::Connected {
            break;
        }
    }
    assert_eq!(observed.last(), Some(&PeripheralState::Connected));
}

#[tokio::test]
async fn connect_failure_surfaces_and_does_not_retry() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(21));
    let peripheral = discover(&host, &central, &mock).await;

    mock.fail_next_connect(Error::Host("link setup failed".into()));
    let result = peripheral.connect().await;
    assert_eq!(result, Err(Error::Host("link setup failed".into())));
    assert_eq!(peripheral.state(), PeripheralState::Disconnected);
    assert!(!mock.is_connected());

    // the next attempt is a fresh one and succeeds
    peripheral.connect().await.unwrap();
    assert_eq!(peripheral.state(), PeripheralState::Connected);
}

#[tokio::test]
async fn read_returns_the_peripheral_value() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(22));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    let value = peripheral.read(BP_SERVICE, BP_FEATURE).await.unwrap();
    assert_eq!(value, vec![0x04, 0x00]);

    // the value is retained on the characteristic
    wait_until("value stored", || {
        peripheral
            .characteristic(BP_SERVICE, BP_FEATURE)
            .and_then(|c| c.value)
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn reads_of_undiscovered_characteristics_fail_synchronously() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(23));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    let bogus = Uuid::from_u128(0xdead);
    assert_eq!(
        peripheral.read(BP_SERVICE, bogus).await,
        Err(Error::NotPresent {
            service: BP_SERVICE,
            characteristic: bogus,
        })
    );
    assert_eq!(mock.read_count(BP_SERVICE, bogus), 0);
}

#[tokio::test]
async fn simultaneous_reads_coalesce_onto_one_request() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(24));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_reads(true);
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move {
            peripheral.read(BP_SERVICE, BP_FEATURE).await
        }));
    }
    wait_until("host saw the read", || {
        mock.read_count(BP_SERVICE, BP_FEATURE) >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    mock.complete_read(BP_SERVICE, BP_FEATURE, Ok(vec![0x2a]));
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec![0x2a]);
    }
    // exactly one request reached the host
    assert_eq!(mock.read_count(BP_SERVICE, BP_FEATURE), 1);
}

#[tokio::test]
async fn sequential_writes_complete_in_order() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(25));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    peripheral
        .write(BP_SERVICE, RACP, vec![0x01])
        .await
        .unwrap();
    peripheral
        .write(BP_SERVICE, RACP, vec![0x02])
        .await
        .unwrap();

    let writes = mock.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].1, vec![0x01]);
    assert_eq!(writes[1].1, vec![0x02]);
}

#[tokio::test]
async fn concurrent_write_is_rejected() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(26));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_writes(true);
    let first = {
        let peripheral = peripheral.clone();
        tokio::spawn(async move { peripheral.write(BP_SERVICE, RACP, vec![0x01]).await })
    };
    wait_until("first write submitted", || mock.writes().len() == 1).await;

    assert_eq!(
        peripheral.write(BP_SERVICE, RACP, vec![0x02]).await,
        Err(Error::ConcurrentWrite {
            service: BP_SERVICE,
            characteristic: RACP,
        })
    );
    // a different characteristic is unaffected
    mock.set_manual_writes(false);
    peripheral
        .write(BP_SERVICE, BP_MEASUREMENT, vec![0x03])
        .await
        .unwrap();

    mock.complete_write(BP_SERVICE, RACP, Ok(()));
    first.await.unwrap().unwrap();
    // the rejected write never reached the host
    assert_eq!(mock.writes().len(), 2);
}

#[tokio::test]
async fn write_without_response_waits_for_the_ready_signal() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(27));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_can_send_write_without_response(false);
    let completions = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for index in 0..3u8 {
        let peripheral = peripheral.clone();
        let completions = Arc::clone(&completions);
        tasks.push(tokio::spawn(async move {
            let result = peripheral
                .write_without_response(BP_SERVICE, RACP, vec![index])
                .await;
            completions.fetch_add(1, Ordering::SeqCst);
            result
        }));
        // keep submission order deterministic
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert!(mock.writes().is_empty());

    mock.set_can_send_write_without_response(true);
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let writes = mock.writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|(_, _, t)| *t == WriteType::WithoutResponse));
    // queued callers resumed in FIFO order
    let payloads: Vec<u8> = writes.iter().map(|(_, data, _)| data[0]).collect();
    assert_eq!(payloads, vec![0, 1, 2]);
}

#[tokio::test]
async fn rssi_reads_coalesce() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(28));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_rssi(true);
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let peripheral = peripheral.clone();
        tasks.push(tokio::spawn(async move { peripheral.read_rssi().await }));
    }
    wait_until("host saw the rssi read", || mock.rssi_read_count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    mock.complete_rssi(Ok(-63));
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), -63);
    }
    assert_eq!(mock.rssi_read_count(), 1);
    assert_eq!(peripheral.rssi(), -63);
}

#[tokio::test]
async fn notifications_reach_streams_and_handlers() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(29));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    peripheral
        .enable_notifications(BP_SERVICE, BP_MEASUREMENT, true)
        .await
        .unwrap();
    wait_until("notifying", || {
        peripheral
            .characteristic(BP_SERVICE, BP_MEASUREMENT)
            .is_some_and(|c| c.is_notifying)
    })
    .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let _registration = {
        let seen = Arc::clone(&seen);
        peripheral.on_change(BP_SERVICE, BP_MEASUREMENT, false, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut stream = peripheral.notifications();

    mock.notify_value(BP_SERVICE, BP_MEASUREMENT, vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x5a, 0x00]);

    let notification = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.uuid, BP_MEASUREMENT);
    assert_eq!(notification.value[0], 0x00);
    wait_until("handler fired", || seen.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn initial_on_change_fires_with_the_known_value() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(30));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    peripheral.read(BP_SERVICE, BP_FEATURE).await.unwrap();
    wait_until("value stored", || {
        peripheral
            .characteristic(BP_SERVICE, BP_FEATURE)
            .and_then(|c| c.value)
            .is_some()
    })
    .await;

    let initial_count = Arc::new(AtomicUsize::new(0));
    let _initial = {
        let count = Arc::clone(&initial_count);
        peripheral.on_change(BP_SERVICE, BP_FEATURE, true, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    // fires exactly once with the current value
    assert_eq!(initial_count.load(Ordering::SeqCst), 1);

    let late_count = Arc::new(AtomicUsize::new(0));
    let _late = {
        let count = Arc::clone(&late_count);
        peripheral.on_change(BP_SERVICE, BP_FEATURE, false, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    // non-initial subscribers see nothing until a fresh value arrives
    assert_eq!(late_count.load(Ordering::SeqCst), 0);

    mock.notify_value(BP_SERVICE, BP_FEATURE, vec![0x05, 0x00]);
    wait_until("both fired on the fresh value", || {
        initial_count.load(Ordering::SeqCst) == 2 && late_count.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn cancelled_registration_stops_receiving() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(31));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    let count = Arc::new(AtomicUsize::new(0));
    let registration = {
        let count = Arc::clone(&count);
        peripheral.on_change(BP_SERVICE, BP_FEATURE, false, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    mock.notify_value(BP_SERVICE, BP_FEATURE, vec![0x01, 0x00]);
    wait_until("first delivery", || count.load(Ordering::SeqCst) == 1).await;

    registration.cancel();
    mock.notify_value(BP_SERVICE, BP_FEATURE, vec![0x02, 0x00]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_cancels_in_flight_operations() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(32));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_reads(true);
    let pending = {
        let peripheral = peripheral.clone();
        tokio::spawn(async move { peripheral.read(BP_SERVICE, BP_FEATURE).await })
    };
    wait_until("read in flight", || {
        mock.read_count(BP_SERVICE, BP_FEATURE) == 1
    })
    .await;

    mock.drop_connection(None);
    assert_eq!(pending.await.unwrap(), Err(Error::Cancelled));
    wait_until("disconnected", || {
        peripheral.state() == PeripheralState::Disconnected
    })
    .await;
    assert_eq!(peripheral.services(), None);
}

#[tokio::test]
async fn service_invalidation_fails_in_flight_and_rediscovers() {
    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(33));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    mock.set_manual_reads(true);
    let pending = {
        let peripheral = peripheral.clone();
        tokio::spawn(async move { peripheral.read(BP_SERVICE, BP_FEATURE).await })
    };
    wait_until("read in flight", || {
        mock.read_count(BP_SERVICE, BP_FEATURE) == 1
    })
    .await;

    mock.modify_services(vec![BP_SERVICE]);
    assert_eq!(
        pending.await.unwrap(),
        Err(Error::NotPresent {
            service: BP_SERVICE,
            characteristic: BP_FEATURE,
        })
    );

    // the runtime rediscovers the invalidated service id; the mock no
    // longer offers it, so it stays gone
    wait_until("service gone", || {
        peripheral.characteristic(BP_SERVICE, BP_FEATURE).is_none()
    })
    .await;
    assert_eq!(peripheral.state(), PeripheralState::Connected);
}

#[tokio::test]
async fn auto_read_runs_for_described_characteristics() {
    use bluekit::discovery::{
        CharacteristicDescription, DeviceDescription, DiscoveryCriteria, DiscoveryDescription,
        ServiceDescription,
    };

    let host = MockHost::new();
    let description = DiscoveryDescription::new(
        DiscoveryCriteria::advertising_service(BP_SERVICE),
        DeviceDescription::with_services(vec![ServiceDescription::with_characteristics(
            BP_SERVICE,
            vec![
                CharacteristicDescription::new(BP_FEATURE),
                CharacteristicDescription::new(BP_MEASUREMENT).without_auto_read(),
                CharacteristicDescription::new(RACP).without_auto_read(),
            ],
        )]),
    );
    let config = bluekit::central::CentralConfiguration::default().with_description(description);
    let central = CentralManager::new(host.clone(), config);
    let mock = add_bp_peripheral(&host, Uuid::from_u128(34));
    let peripheral = discover_and_connect(&host, &central, &mock).await;

    // the readable described characteristic is read automatically
    wait_until("auto-read happened", || {
        mock.read_count(BP_SERVICE, BP_FEATURE) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.read_count(BP_SERVICE, BP_MEASUREMENT), 0);
    assert_eq!(
        peripheral
            .characteristic(BP_SERVICE, BP_FEATURE)
            .and_then(|c| c.value),
        Some(vec![0x04, 0x00])
    );
}

#[tokio::test]
async fn gap_name_only_matching_uses_the_peripheral_name() {
    use bluekit::discovery::{DiscoveryCriteria, DiscoveryDescription};

    let host = MockHost::new();
    let config = bluekit::central::CentralConfiguration::default().with_description(
        DiscoveryDescription::discover_all(
            DiscoveryCriteria::advertising_service(BP_SERVICE).and_name_substring("Ward 7"),
        ),
    );
    let central = CentralManager::new(host.clone(), config);
    let mock = add_bp_peripheral(&host, Uuid::from_u128(35));
    mock.set_gap_name("Ward 7 BP Monitor");

    central.scan_nearby_devices(false).await.unwrap();
    // no local name in the advertisement: the GAP name is consulted
    let mut advertisement = advertisement("ignored");
    advertisement.local_name = None;
    host.advertise(&mock, advertisement, -40);
    wait_until("matched via GAP name", || {
        !central.nearby_peripherals().is_empty()
    })
    .await;

    assert_eq!(
        central.nearby_peripherals()[0].name().as_deref(),
        Some("Ward 7 BP Monitor")
    );
}

#[tokio::test]
async fn default_notify_is_enabled_after_discovery() {
    use bluekit::binding::{BluetoothDevice, BluetoothService, CharacteristicAccessor, DeviceBinding};
    use bluekit::gatt::blood_pressure::BloodPressureFeature;
    use std::sync::Arc as StdArc;

    struct BpService {
        feature: CharacteristicAccessor<BloodPressureFeature>,
    }

    impl BluetoothService for BpService {
        fn service_uuid(&self) -> Uuid {
            BP_SERVICE
        }

        fn injections(&self) -> Vec<StdArc<dyn bluekit::binding::AnyInjection>> {
            vec![StdArc::new(self.feature.clone()) as StdArc<dyn bluekit::binding::AnyInjection>]
        }
    }

    struct BpDevice {
        service: BpService,
    }

    impl BluetoothDevice for BpDevice {
        fn services(&self) -> Vec<&dyn BluetoothService> {
            vec![&self.service]
        }
    }

    let host = MockHost::new();
    let central = CentralManager::new(host.clone(), bp_config());
    let mock = add_bp_peripheral(&host, Uuid::from_u128(36));
    let peripheral = discover(&host, &central, &mock).await;

    let device = BpDevice {
        service: BpService {
            feature: CharacteristicAccessor::new(BP_SERVICE, BP_FEATURE).with_default_notify(),
        },
    };
    let _binding = DeviceBinding::bind(&device, &peripheral);

    peripheral.connect().await.unwrap();
    wait_until("default notify enabled", || {
        peripheral
            .characteristic(BP_SERVICE, BP_FEATURE)
            .is_some_and(|c| c.is_notifying)
    })
    .await;

    // the typed accessor decodes incoming values
    mock.notify_value(BP_SERVICE, BP_FEATURE, vec![0x08, 0x00]);
    wait_until("typed value decoded", || {
        device.service.feature.value()
            == Some(BloodPressureFeature::PULSE_RATE_RANGE_DETECTION)
    })
    .await;
}
