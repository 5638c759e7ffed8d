// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The observable, thread-safe record of one peripheral's mutable state.
//!
//! Small scalars (state, RSSI, nearby flag, last activity) live in atomics
//! and are readable off the runtime's executor without taking a lock;
//! composite values (name, advertisement, the service table) sit behind a
//! reader-writer lock and are returned as snapshots.

use super::PeripheralState;
use crate::api::{AdvertisementData, Characteristic, PeripheralId, Service};
use crate::sync::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

// Process-wide epoch for the packed last-activity instant.
fn activity_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

#[derive(Debug)]
pub struct PeripheralStorage {
    id: PeripheralId,
    name: RwLock<Option<String>>,
    advertisement: RwLock<AdvertisementData>,
    rssi: AtomicI16,
    state: AtomicU8,
    nearby: AtomicBool,
    // seconds since `activity_epoch()`, stored as raw f64 bits
    last_activity: AtomicU64,
    services: RwLock<Option<HashMap<Uuid, Service>>>,
}

impl PeripheralStorage {
    pub fn new(
        id: PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: i16,
    ) -> Self {
        let storage = PeripheralStorage {
            id,
            name: RwLock::new(name),
            advertisement: RwLock::new(advertisement),
            rssi: AtomicI16::new(rssi),
            state: AtomicU8::new(PeripheralState::Disconnected as u8),
            nearby: AtomicBool::new(false),
            last_activity: AtomicU64::new(0),
            services: RwLock::new(None),
        };
        storage.mark_activity();
        storage
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    /// The GAP device name, if one is known.
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.write() = name;
    }

    pub fn advertisement(&self) -> AdvertisementData {
        self.advertisement.read().clone()
    }

    pub fn update_advertisement(&self, advertisement: AdvertisementData) {
        *self.advertisement.write() = advertisement;
    }

    pub fn rssi(&self) -> i16 {
        self.rssi.load(Ordering::Relaxed)
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.rssi.store(rssi, Ordering::Relaxed);
    }

    pub fn state(&self) -> PeripheralState {
        PeripheralState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PeripheralState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_nearby(&self) -> bool {
        self.nearby.load(Ordering::Relaxed)
    }

    pub fn set_nearby(&self, nearby: bool) {
        self.nearby.store(nearby, Ordering::Relaxed);
    }

    /// The moment the peripheral last showed activity. While connected the
    /// link itself is the activity, so this reads as "now".
    pub fn last_activity(&self) -> Instant {
        if self.state() == PeripheralState::Connected {
            return Instant::now();
        }
        let seconds = f64::from_bits(self.last_activity.load(Ordering::Relaxed));
        activity_epoch() + Duration::from_secs_f64(seconds)
    }

    /// Stamps the last-activity instant with "now".
    pub fn mark_activity(&self) {
        let seconds = (Instant::now() - activity_epoch()).as_secs_f64();
        self.last_activity.store(seconds.to_bits(), Ordering::Relaxed);
    }

    /// Moves the last-activity instant into the past, so a disconnected
    /// peripheral lingers only a fraction of the stale interval.
    pub fn backdate_activity(&self, by: Duration) {
        let now = Instant::now() - activity_epoch();
        let seconds = now.as_secs_f64() - by.as_secs_f64();
        self.last_activity
            .store(seconds.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// A snapshot of the discovered services, `None` before discovery.
    pub fn services(&self) -> Option<Vec<Service>> {
        self.services
            .read()
            .as_ref()
            .map(|services| services.values().cloned().collect())
    }

    pub fn service(&self, uuid: Uuid) -> Option<Service> {
        self.services.read().as_ref()?.get(&uuid).cloned()
    }

    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.services
            .read()
            .as_ref()?
            .get(&service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned()
    }

    /// Replaces the service table with freshly discovered services. Their
    /// characteristic sets start out as delivered and are refined by
    /// [`Self::set_characteristics`].
    pub fn set_services(&self, services: Vec<Service>) {
        let map = services
            .into_iter()
            .map(|service| (service.uuid, service))
            .collect();
        *self.services.write() = Some(map);
    }

    /// Inserts or replaces the given services, leaving others untouched.
    /// Used for partial rediscovery after service invalidation.
    pub fn merge_services(&self, services: Vec<Service>) {
        let mut table = self.services.write();
        let map = table.get_or_insert_with(HashMap::new);
        for service in services {
            map.insert(service.uuid, service);
        }
    }

    /// Replaces the characteristics of one service.
    pub fn set_characteristics(&self, service: Uuid, characteristics: Vec<Characteristic>) {
        let mut services = self.services.write();
        if let Some(entry) = services.as_mut().and_then(|map| map.get_mut(&service)) {
            entry.characteristics = characteristics.into_iter().collect();
        }
    }

    /// Drops invalidated services. Returns the UUIDs that were actually
    /// present.
    pub fn remove_services(&self, invalidated: &[Uuid]) -> Vec<Uuid> {
        let mut services = self.services.write();
        let Some(map) = services.as_mut() else {
            return Vec::new();
        };
        invalidated
            .iter()
            .filter(|uuid| map.remove(uuid).is_some())
            .copied()
            .collect()
    }

    /// Forgets the service table entirely, as on disconnect.
    pub fn clear_services(&self) {
        *self.services.write() = None;
    }

    fn update_characteristic<R>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        update: impl FnOnce(&mut Characteristic) -> R,
    ) -> Option<R> {
        let mut services = self.services.write();
        let entry = services.as_mut()?.get_mut(&service)?;
        let mut found = entry
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned()?;
        entry.characteristics.retain(|c| c.uuid != characteristic);
        let result = update(&mut found);
        entry.characteristics.insert(found);
        Some(result)
    }

    /// Stores a received value on the characteristic. Returns false if the
    /// characteristic is unknown.
    pub fn store_value(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> bool {
        self.update_characteristic(service, characteristic, |c| {
            c.value = Some(value.to_vec());
        })
        .is_some()
    }

    /// Records the notifying state reported by the host.
    pub fn set_notifying(&self, service: Uuid, characteristic: Uuid, notifying: bool) -> bool {
        self.update_characteristic(service, characteristic, |c| {
            c.is_notifying = notifying;
        })
        .is_some()
    }

    /// Attaches discovered descriptors to the characteristic.
    pub fn set_descriptors(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptors: Vec<crate::api::Descriptor>,
    ) -> bool {
        self.update_characteristic(service, characteristic, |c| {
            c.descriptors = descriptors.into_iter().collect();
        })
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use crate::api::CharPropFlags;
    use uuid::Uuid;

    fn storage() -> PeripheralStorage {
        PeripheralStorage::new(
            PeripheralId(Uuid::nil()),
            Some("Thermo".into()),
            AdvertisementData::default(),
            -40,
        )
    }

    fn service_with_characteristic(service: Uuid, characteristic: Uuid) -> Service {
        Service {
            uuid: service,
            primary: true,
            characteristics: [Characteristic {
                uuid: characteristic,
                service_uuid: service,
                properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
                ..Default::default()
            }]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn scalar_state() {
        let storage = storage();
        assert_eq!(storage.state(), PeripheralState::Disconnected);
        assert_eq!(storage.rssi(), -40);
        storage.set_state(PeripheralState::Connecting);
        storage.set_rssi(-55);
        assert_eq!(storage.state(), PeripheralState::Connecting);
        assert_eq!(storage.rssi(), -55);
    }

    #[test]
    fn last_activity_reads_now_while_connected() {
        let storage = storage();
        storage.backdate_activity(Duration::from_secs(60));
        let stale = storage.last_activity();
        assert!(Instant::now() - stale >= Duration::from_secs(59));

        storage.set_state(PeripheralState::Connected);
        let fresh = storage.last_activity();
        assert!(Instant::now() - fresh < Duration::from_secs(1));
    }

    #[test]
    fn service_table_updates() {
        let storage = storage();
        let service = uuid_from_u16(0x1809);
        let characteristic = uuid_from_u16(0x2a1c);
        assert_eq!(storage.services(), None);

        storage.set_services(vec![service_with_characteristic(service, characteristic)]);
        assert!(storage.characteristic(service, characteristic).is_some());

        assert!(storage.store_value(service, characteristic, &[0x01, 0x02]));
        assert_eq!(
            storage.characteristic(service, characteristic).unwrap().value,
            Some(vec![0x01, 0x02])
        );

        assert!(storage.set_notifying(service, characteristic, true));
        assert!(storage.characteristic(service, characteristic).unwrap().is_notifying);

        let removed = storage.remove_services(&[service, uuid_from_u16(0x1810)]);
        assert_eq!(removed, vec![service]);
        assert_eq!(storage.characteristic(service, characteristic), None);
    }

    #[test]
    fn unknown_characteristic_updates_are_rejected() {
        let storage = storage();
        let service = uuid_from_u16(0x1809);
        storage.set_services(vec![service_with_characteristic(
            service,
            uuid_from_u16(0x2a1c),
        )]);
        assert!(!storage.store_value(service, uuid_from_u16(0x2a1d), &[0x00]));
        assert!(!storage.store_value(uuid_from_u16(0x1810), uuid_from_u16(0x2a1c), &[0x00]));
    }
}
