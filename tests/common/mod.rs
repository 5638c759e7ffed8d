//! Shared scaffolding for the integration tests: a mock host with one
//! blood-pressure peripheral and polling helpers.

use bluekit::api::bleuuid::uuid_from_u16;
use bluekit::api::{AdvertisementData, CharPropFlags};
use bluekit::central::{CentralConfiguration, CentralManager};
use bluekit::discovery::{DiscoveryCriteria, DiscoveryDescription};
use bluekit::peripheral::Peripheral;
use bluekit::testing::{MockHost, MockPeripheralHost};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const BP_SERVICE: Uuid = uuid_from_u16(0x1810);
pub const BP_MEASUREMENT: Uuid = uuid_from_u16(0x2a35);
pub const BP_FEATURE: Uuid = uuid_from_u16(0x2a49);
pub const RACP: Uuid = uuid_from_u16(0x2a52);

pub fn advertisement(local_name: &str) -> AdvertisementData {
    AdvertisementData {
        local_name: Some(local_name.to_owned()),
        service_uuids: vec![BP_SERVICE],
        ..Default::default()
    }
}

/// Polls `condition` every few milliseconds, panicking if it does not hold
/// within two seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn bp_config() -> CentralConfiguration {
    CentralConfiguration::default().with_description(DiscoveryDescription::discover_all(
        DiscoveryCriteria::advertising_service(BP_SERVICE),
    ))
}

/// Registers a blood-pressure peripheral on the mock host: measurement
/// (indicate), feature (read) and record access control point
/// (write + indicate).
pub fn add_bp_peripheral(host: &Arc<MockHost>, id: Uuid) -> Arc<MockPeripheralHost> {
    let peripheral = host.add_peripheral(id);
    peripheral.add_service(
        BP_SERVICE,
        vec![
            (
                BP_MEASUREMENT,
                CharPropFlags::INDICATE | CharPropFlags::READ,
                None,
            ),
            (BP_FEATURE, CharPropFlags::READ, Some(vec![0x04, 0x00])),
            (RACP, CharPropFlags::WRITE | CharPropFlags::INDICATE, None),
        ],
    );
    peripheral
}

/// Scans, advertises `mock`, and returns the discovered runtime.
pub async fn discover(
    host: &Arc<MockHost>,
    central: &CentralManager,
    mock: &Arc<MockPeripheralHost>,
) -> Peripheral {
    central.scan_nearby_devices(false).await.unwrap();
    host.advertise(mock, advertisement("BP Monitor"), -40);
    let id = bluekit::api::PeripheralId(mock_id(mock));
    wait_until("peripheral discovered", || central.peripheral(&id).is_some()).await;
    central.peripheral(&id).unwrap()
}

fn mock_id(mock: &Arc<MockPeripheralHost>) -> Uuid {
    use bluekit::api::HostPeripheral as _;
    mock.identifier().0
}

/// Discovers and connects in one go.
pub async fn discover_and_connect(
    host: &Arc<MockHost>,
    central: &CentralManager,
    mock: &Arc<MockPeripheralHost>,
) -> Peripheral {
    let peripheral = discover(host, central, mock).await;
    peripheral.connect().await.unwrap();
    peripheral
}
