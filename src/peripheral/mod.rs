// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The per-peripheral runtime: the connection state machine, the GATT
//! operation serializer, notification dispatch and control-point
//! transactions.
//!
//! A [`Peripheral`] is a cheap clone around shared state owned by the
//! central's dispatcher. GATT operations submit a request to the host stack
//! and park a continuation; the dispatcher resolves it when the matching
//! [`HostEvent`](crate::api::HostEvent) arrives. Per characteristic, reads
//! coalesce onto one in-flight request, a second write is rejected, and
//! writes-without-response park behind the host's ready signal.

pub mod control_point;
pub mod storage;

pub use storage::PeripheralStorage;

use crate::api::bleuuid::BleUuid;
use crate::api::{
    AdvertisementData, CharPropFlags, Characteristic, HostCentral, HostPeripheral, PeripheralId,
    Service, ValueNotification, WriteType,
};
use crate::binding::AnyInjection;
use crate::codec::{decode_value, encode_value, ByteDecode, ByteEncode};
use crate::sync::{AsyncSemaphore, ManagedAsynchronousAccess, RecursiveRwLock};
use crate::{Error, Result};
use futures::stream::Stream;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

/// The connection state of a peripheral. `Connected` is reached only after
/// service and characteristic discovery has completed, so an observer of
/// this state can rely on the service table being populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeripheralState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl PeripheralState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => PeripheralState::Connecting,
            2 => PeripheralState::Connected,
            3 => PeripheralState::Disconnecting,
            _ => PeripheralState::Disconnected,
        }
    }
}

/// A cancellable token for an on-change handler. Dropping the token (or
/// calling [`cancel`](Self::cancel)) unregisters the handler.
#[derive(Debug)]
pub struct OnChangeRegistration {
    peripheral: Weak<Shared>,
    key: CharKey,
    id: u64,
}

impl OnChangeRegistration {
    pub fn cancel(&self) {
        if let Some(shared) = self.peripheral.upgrade() {
            let _ordering = shared.handler_lock.read();
            let mut handlers = shared.handlers.lock().unwrap();
            if let Some(entries) = handlers.get_mut(&self.key) {
                entries.retain(|entry| entry.id != self.id);
            }
        }
    }
}

impl Drop for OnChangeRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}

type CharKey = (Uuid, Uuid);

struct HandlerEntry {
    id: u64,
    handler: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

impl Debug for HandlerEntry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("HandlerEntry").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
struct ControlPointTransaction {
    id: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct GattState {
    reads: HashMap<CharKey, Vec<oneshot::Sender<Result<Vec<u8>>>>>,
    writes: HashMap<CharKey, oneshot::Sender<Result<()>>>,
    notify_waiters: HashMap<CharKey, Vec<oneshot::Sender<Result<bool>>>>,
    rssi_waiters: Vec<oneshot::Sender<Result<i16>>>,
    control_points: HashMap<CharKey, ControlPointTransaction>,
    // services whose characteristic discovery has not come back yet
    pending_discovery: HashSet<Uuid>,
    discovering: bool,
}

pub(crate) struct Shared {
    host: Arc<dyn HostPeripheral>,
    central: Weak<dyn HostCentral>,
    storage: PeripheralStorage,
    state_tx: watch::Sender<PeripheralState>,
    gatt: Mutex<GattState>,
    notifications: broadcast::Sender<ValueNotification>,
    handlers: Mutex<HashMap<CharKey, Vec<HandlerEntry>>>,
    // orders handler dispatch against teardown; handlers re-enter in read
    // mode when they register or cancel registrations
    handler_lock: RecursiveRwLock,
    injections: Mutex<HashMap<CharKey, Vec<Arc<dyn AnyInjection>>>>,
    notify_requested: Mutex<HashSet<CharKey>>,
    wwr_ready: AsyncSemaphore,
    disconnect_access: ManagedAsynchronousAccess<(), Error>,
    description: Mutex<Option<crate::discovery::DeviceDescription>>,
    connect_error: Mutex<Option<Error>>,
    next_registration_id: AtomicU64,
    next_transaction_id: AtomicU64,
    control_point_timeout: Duration,
    stale_backdate: Duration,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.storage.id())
            .field("state", &self.storage.state())
            .finish()
    }
}

/// A discovered peripheral and its runtime.
#[derive(Clone, Debug)]
pub struct Peripheral {
    shared: Arc<Shared>,
}

/// A non-owning handle on a peripheral runtime, used where a back-reference
/// must not keep the peripheral alive.
#[derive(Clone, Debug)]
pub struct WeakPeripheral(Weak<Shared>);

impl WeakPeripheral {
    pub fn upgrade(&self) -> Option<Peripheral> {
        self.0.upgrade().map(|shared| Peripheral { shared })
    }
}

impl Peripheral {
    pub(crate) fn new(
        host: Arc<dyn HostPeripheral>,
        central: Weak<dyn HostCentral>,
        advertisement: AdvertisementData,
        rssi: i16,
        control_point_timeout: Duration,
        stale_interval: Duration,
    ) -> Self {
        let storage = PeripheralStorage::new(host.identifier(), host.gap_name(), advertisement, rssi);
        let (state_tx, _) = watch::channel(PeripheralState::Disconnected);
        let (notifications, _) = broadcast::channel(64);
        Peripheral {
            shared: Arc::new(Shared {
                host,
                central,
                storage,
                state_tx,
                gatt: Mutex::new(GattState::default()),
                notifications,
                handlers: Mutex::new(HashMap::new()),
                handler_lock: RecursiveRwLock::new(),
                injections: Mutex::new(HashMap::new()),
                notify_requested: Mutex::new(HashSet::new()),
                wwr_ready: AsyncSemaphore::new(0),
                disconnect_access: ManagedAsynchronousAccess::new(),
                description: Mutex::new(None),
                connect_error: Mutex::new(None),
                next_registration_id: AtomicU64::new(0),
                next_transaction_id: AtomicU64::new(0),
                control_point_timeout,
                stale_backdate: stale_interval / 4,
            }),
        }
    }

    /// A non-owning handle on this peripheral.
    pub fn downgrade(&self) -> WeakPeripheral {
        WeakPeripheral(Arc::downgrade(&self.shared))
    }

    /// The stable identifier assigned by the host stack.
    pub fn id(&self) -> PeripheralId {
        self.shared.storage.id()
    }

    /// The GAP device name, if one is known.
    pub fn name(&self) -> Option<String> {
        self.shared.storage.name()
    }

    /// The most recent advertisement.
    pub fn advertisement(&self) -> AdvertisementData {
        self.shared.storage.advertisement()
    }

    /// The most recent RSSI value.
    pub fn rssi(&self) -> i16 {
        self.shared.storage.rssi()
    }

    pub fn state(&self) -> PeripheralState {
        self.shared.storage.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeripheralState::Connected
    }

    /// A stream of state transitions, starting with the current state.
    pub fn state_stream(&self) -> Pin<Box<dyn Stream<Item = PeripheralState> + Send>> {
        Box::pin(WatchStream::new(self.shared.state_tx.subscribe()))
    }

    /// The discovered services, `None` before discovery has completed.
    pub fn services(&self) -> Option<Vec<Service>> {
        self.shared.storage.services()
    }

    /// One discovered characteristic by its service and characteristic UUID.
    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.shared.storage.characteristic(service, characteristic)
    }

    pub(crate) fn storage(&self) -> &PeripheralStorage {
        &self.shared.storage
    }

    pub(crate) fn set_device_description(
        &self,
        description: Option<crate::discovery::DeviceDescription>,
    ) {
        *self.shared.description.lock().unwrap() = description;
    }

    fn central(&self) -> Result<Arc<dyn HostCentral>> {
        self.shared.central.upgrade().ok_or(Error::Cancelled)
    }

    fn set_state(&self, state: PeripheralState) {
        self.shared.storage.set_state(state);
        let _ = self.shared.state_tx.send(state);
    }

    fn require_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.shared
            .storage
            .characteristic(service, characteristic)
            .ok_or(Error::NotPresent {
                service,
                characteristic,
            })
    }

    /// Connects and waits until service discovery has completed. Concurrent
    /// callers join the same attempt. Connect failures surface as the error
    /// reported by the host; the runtime does not retry.
    pub async fn connect(&self) -> Result<()> {
        let mut states = self.shared.state_tx.subscribe();
        match self.state() {
            PeripheralState::Connected => return Ok(()),
            PeripheralState::Connecting | PeripheralState::Disconnecting => {}
            PeripheralState::Disconnected => {
                *self.shared.connect_error.lock().unwrap() = None;
                self.set_state(PeripheralState::Connecting);
                let central = self.central()?;
                if let Err(error) = central.connect(self.id()).await {
                    self.set_state(PeripheralState::Disconnected);
                    return Err(error);
                }
            }
        }
        loop {
            if states.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
            let state = *states.borrow_and_update();
            match state {
                PeripheralState::Connected => return Ok(()),
                PeripheralState::Disconnected => {
                    let error = self.shared.connect_error.lock().unwrap().take();
                    return Err(error.unwrap_or(Error::NotConnected));
                }
                _ => {}
            }
        }
    }

    /// Disconnects and waits for the link to go down. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() == PeripheralState::Disconnected {
            return Ok(());
        }
        let central = self.central()?;
        let id = self.id();
        self.shared
            .disconnect_access
            .perform(async {
                self.set_state(PeripheralState::Disconnecting);
                central.cancel_connection(id).await
            })
            .await
    }

    /// Reads the characteristic value. Simultaneous reads of the same
    /// characteristic coalesce onto one request and all observe the same
    /// result.
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.require_characteristic(service, characteristic)?;
        let key = (service, characteristic);
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut gatt = self.shared.gatt.lock().unwrap();
            match gatt.reads.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    gatt.reads.insert(key, vec![tx]);
                    true
                }
            }
        };
        if leader {
            if let Err(error) = self.shared.host.read(service, characteristic).await {
                self.fail_reads(key, &error);
                return Err(error);
            }
        }
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Reads and decodes the characteristic value.
    pub async fn read_value<V: ByteDecode>(&self, service: Uuid, characteristic: Uuid) -> Result<V> {
        let raw = self.read(service, characteristic).await?;
        decode_value(&raw).ok_or(Error::IncompatibleDataFormat)
    }

    /// Writes with response. A second write to the same characteristic while
    /// one is pending fails with [`Error::ConcurrentWrite`].
    pub async fn write(&self, service: Uuid, characteristic: Uuid, data: Vec<u8>) -> Result<()> {
        self.require_characteristic(service, characteristic)?;
        let key = (service, characteristic);
        let (tx, rx) = oneshot::channel();
        {
            let mut gatt = self.shared.gatt.lock().unwrap();
            if gatt.writes.contains_key(&key) {
                return Err(Error::ConcurrentWrite {
                    service,
                    characteristic,
                });
            }
            gatt.writes.insert(key, tx);
        }
        if let Err(error) = self
            .shared
            .host
            .write(service, characteristic, data, WriteType::WithResponse)
            .await
        {
            self.shared.gatt.lock().unwrap().writes.remove(&key);
            return Err(error);
        }
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Encodes and writes a value with response.
    pub async fn write_value<V: ByteEncode>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &V,
    ) -> Result<()> {
        self.write(service, characteristic, encode_value(value)).await
    }

    /// Writes without response, honoring the host's back-pressure: when the
    /// stack reports it cannot take another command, callers park in FIFO
    /// order until the ready signal resumes all of them.
    pub async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
    ) -> Result<()> {
        self.require_characteristic(service, characteristic)?;
        while !self.shared.host.can_send_write_without_response() {
            self.shared.wwr_ready.wait().await;
        }
        self.shared
            .host
            .write(service, characteristic, data, WriteType::WithoutResponse)
            .await
    }

    /// Encodes and writes a value without response.
    pub async fn write_value_without_response<V: ByteEncode>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &V,
    ) -> Result<()> {
        self.write_without_response(service, characteristic, encode_value(value))
            .await
    }

    /// Reads the current RSSI. Simultaneous callers coalesce onto one
    /// request.
    pub async fn read_rssi(&self) -> Result<i16> {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut gatt = self.shared.gatt.lock().unwrap();
            let leader = gatt.rssi_waiters.is_empty();
            gatt.rssi_waiters.push(tx);
            leader
        };
        if leader {
            if let Err(error) = self.shared.host.read_rssi().await {
                let waiters = std::mem::take(&mut self.shared.gatt.lock().unwrap().rssi_waiters);
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                return Err(error);
            }
        }
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Enables or disables notifications/indications and waits for the
    /// host's acknowledgement. Returns the new notifying state.
    pub async fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<bool> {
        self.require_characteristic(service, characteristic)?;
        let key = (service, characteristic);
        {
            let mut requested = self.shared.notify_requested.lock().unwrap();
            if enabled {
                requested.insert(key);
            } else {
                requested.remove(&key);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.shared
            .gatt
            .lock()
            .unwrap()
            .notify_waiters
            .entry(key)
            .or_default()
            .push(tx);
        if let Err(error) = self.shared.host.set_notify(service, characteristic, enabled).await {
            let waiters = self
                .shared
                .gatt
                .lock()
                .unwrap()
                .notify_waiters
                .remove(&key)
                .unwrap_or_default();
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
            return Err(error);
        }
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// A stream of raw value notifications for every characteristic of this
    /// peripheral. The stream survives reconnections.
    pub fn notifications(&self) -> Pin<Box<dyn Stream<Item = ValueNotification> + Send>> {
        let receiver = self.shared.notifications.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|item| item.ok()))
    }

    /// Registers an on-change handler for one characteristic.
    ///
    /// With `initial` the handler fires immediately with the current value
    /// when one is known, then on every subsequent change; without it, only
    /// values received strictly after registration are delivered.
    pub fn on_change(
        &self,
        service: Uuid,
        characteristic: Uuid,
        initial: bool,
        handler: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> OnChangeRegistration {
        let key = (service, characteristic);
        let id = self.shared.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let handler: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(handler);

        let _ordering = self.shared.handler_lock.read();
        if initial {
            if let Some(value) = self
                .shared
                .storage
                .characteristic(service, characteristic)
                .and_then(|c| c.value)
            {
                handler(&value);
            }
        }
        self.shared
            .handlers
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(HandlerEntry {
                id,
                handler,
            });
        OnChangeRegistration {
            peripheral: Arc::downgrade(&self.shared),
            key,
            id,
        }
    }

    pub(crate) fn attach_injection(&self, injection: Arc<dyn AnyInjection>) {
        let key = (injection.service_uuid(), injection.characteristic_uuid());
        self.shared
            .injections
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(injection);
    }

    pub(crate) fn detach_injection(&self, injection: &Arc<dyn AnyInjection>) {
        let mut injections = self.shared.injections.lock().unwrap();
        let key = (injection.service_uuid(), injection.characteristic_uuid());
        if let Some(entries) = injections.get_mut(&key) {
            entries.retain(|entry| !Arc::ptr_eq(entry, injection));
            if entries.is_empty() {
                injections.remove(&key);
            }
        }
    }

    fn fail_reads(&self, key: CharKey, error: &Error) {
        let waiters = self.shared.gatt.lock().unwrap().reads.remove(&key);
        for waiter in waiters.unwrap_or_default() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    // ---- dispatcher entry points -------------------------------------------

    /// The link came up; start service discovery. The `connected` state is
    /// not entered until discovery completes.
    pub(crate) async fn handle_connected(&self) {
        self.shared.storage.set_name(self.shared.host.gap_name());
        let service_ids = self
            .shared
            .description
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|description| description.service_ids());
        {
            let mut gatt = self.shared.gatt.lock().unwrap();
            gatt.discovering = true;
            gatt.pending_discovery.clear();
        }
        trace!(
            "peripheral {}: connected at link layer, discovering services",
            self.id()
        );
        if let Err(error) = self.shared.host.discover_services(service_ids).await {
            warn!("peripheral {}: service discovery failed: {}", self.id(), error);
            self.abort_connect(error).await;
        }
    }

    pub(crate) async fn handle_failed_to_connect(&self, error: Error) {
        debug!("peripheral {}: failed to connect: {}", self.id(), error);
        *self.shared.connect_error.lock().unwrap() = Some(error.clone());
        self.handle_disconnected(Some(error)).await;
    }

    pub(crate) async fn handle_disconnected(&self, error: Option<Error>) {
        debug!(
            "peripheral {}: disconnected{}",
            self.id(),
            error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
        );
        if let Some(error) = error {
            *self.shared.connect_error.lock().unwrap() = Some(error);
        }
        self.set_state(PeripheralState::Disconnected);
        // quiesce handler dispatch before tearing down per-connection state
        drop(self.shared.handler_lock.write());
        self.shared.storage.clear_services();
        self.shared.storage.backdate_activity(self.shared.stale_backdate);
        self.shared.notify_requested.lock().unwrap().clear();
        self.cancel_in_flight(Error::Cancelled);
        self.shared.disconnect_access.resume(Ok(()));

        let injections: Vec<_> = {
            let injections = self.shared.injections.lock().unwrap();
            injections.values().flatten().cloned().collect()
        };
        for injection in injections {
            injection.clear();
        }
    }

    fn cancel_in_flight(&self, error: Error) {
        let mut gatt = self.shared.gatt.lock().unwrap();
        gatt.discovering = false;
        gatt.pending_discovery.clear();
        for (_, waiters) in gatt.reads.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        for (_, waiter) in gatt.writes.drain() {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, waiters) in gatt.notify_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        for waiter in gatt.rssi_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, transaction) in gatt.control_points.drain() {
            let _ = transaction.tx.send(Err(error.clone()));
        }
    }

    async fn abort_connect(&self, error: Error) {
        *self.shared.connect_error.lock().unwrap() = Some(error);
        if let Ok(central) = self.central() {
            let _ = central.cancel_connection(self.id()).await;
        }
    }

    pub(crate) async fn handle_services_discovered(&self, result: Result<Vec<Service>>) {
        let services = match result {
            Ok(services) => services,
            Err(error) => {
                warn!("peripheral {}: service discovery failed: {}", self.id(), error);
                self.abort_connect(error).await;
                return;
            }
        };
        let initial_discovery = self.shared.gatt.lock().unwrap().discovering;
        if initial_discovery {
            self.shared.storage.set_services(services.clone());
        } else {
            // partial rediscovery after invalidation only refreshes the
            // reported services
            self.shared.storage.merge_services(services.clone());
        }
        let description = self.shared.description.lock().unwrap().clone();
        let mut targets = Vec::new();
        for service in &services {
            let characteristic_ids = match description.as_ref().and_then(|d| d.service(service.uuid))
            {
                Some(service_description) => service_description.characteristic_ids(),
                None if description
                    .as_ref()
                    .is_some_and(|d| d.services.is_some()) =>
                {
                    // not part of the device description; skip
                    continue;
                }
                None => None,
            };
            targets.push((service.uuid, characteristic_ids));
        }
        {
            let mut gatt = self.shared.gatt.lock().unwrap();
            gatt.pending_discovery
                .extend(targets.iter().map(|(uuid, _)| *uuid));
        }
        if targets.is_empty() {
            self.finish_discovery().await;
            return;
        }
        for (service, characteristic_ids) in targets {
            if let Err(error) = self
                .shared
                .host
                .discover_characteristics(service, characteristic_ids)
                .await
            {
                warn!(
                    "peripheral {}: characteristic discovery for {} failed: {}",
                    self.id(),
                    service.to_short_string(),
                    error
                );
                self.abort_connect(error).await;
                return;
            }
        }
    }

    pub(crate) async fn handle_characteristics_discovered(
        &self,
        service: Uuid,
        result: Result<Vec<Characteristic>>,
    ) {
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(error) => {
                warn!(
                    "peripheral {}: characteristic discovery for {} failed: {}",
                    self.id(),
                    service.to_short_string(),
                    error
                );
                self.abort_connect(error).await;
                return;
            }
        };
        self.shared.storage.set_characteristics(service, characteristics);
        let finished = {
            let mut gatt = self.shared.gatt.lock().unwrap();
            gatt.pending_discovery.remove(&service);
            gatt.pending_discovery.is_empty()
        };
        if finished {
            self.finish_discovery().await;
        }
    }

    /// All requested services and characteristics are known; latch the
    /// connected state and run the post-discovery actions.
    async fn finish_discovery(&self) {
        {
            let mut gatt = self.shared.gatt.lock().unwrap();
            if !gatt.discovering {
                // a rediscovery after service invalidation
                gatt.pending_discovery.clear();
            }
            gatt.discovering = false;
        }
        let newly_connected = self.state() == PeripheralState::Connecting;
        if newly_connected {
            self.set_state(PeripheralState::Connected);
            debug!("peripheral {}: connected", self.id());
        }

        self.notify_injections_services_changed();

        let description = self.shared.description.lock().unwrap().clone();
        let services = self.services().unwrap_or_default();
        for service in &services {
            for characteristic in &service.characteristics {
                let key = (service.uuid, characteristic.uuid);
                let char_description = description
                    .as_ref()
                    .and_then(|d| d.characteristic(key.0, key.1));

                if let Some(char_description) = char_description {
                    if char_description.discover_descriptors {
                        let _ = self
                            .shared
                            .host
                            .discover_descriptors(key.0, key.1)
                            .await;
                    }
                    if char_description.auto_read
                        && characteristic.properties.contains(CharPropFlags::READ)
                    {
                        let peripheral = self.clone();
                        tokio::spawn(async move {
                            if let Err(error) = peripheral.read(key.0, key.1).await {
                                debug!(
                                    "auto-read of {} failed: {}",
                                    key.1.to_short_string(),
                                    error
                                );
                            }
                        });
                    }
                }

                if self.wants_notifications(key) && !characteristic.is_notifying {
                    let peripheral = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = peripheral.enable_notifications(key.0, key.1, true).await
                        {
                            debug!(
                                "enabling notifications for {} failed: {}",
                                key.1.to_short_string(),
                                error
                            );
                        }
                    });
                }
            }
        }
    }

    fn wants_notifications(&self, key: CharKey) -> bool {
        if self.shared.handlers.lock().unwrap().contains_key(&key) {
            return true;
        }
        self.shared
            .injections
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|entries| entries.iter().any(|injection| injection.default_notify()))
    }

    fn notify_injections_services_changed(&self) {
        let injections: Vec<_> = {
            let injections = self.shared.injections.lock().unwrap();
            injections.values().flatten().cloned().collect()
        };
        for injection in injections {
            injection.handle_services_changed(self);
        }
    }

    /// Invalidated services are dropped, their in-flight operations fail
    /// with `NotPresent`, and the same service ids are rediscovered.
    pub(crate) async fn handle_services_modified(&self, invalidated: Vec<Uuid>) {
        let removed = self.shared.storage.remove_services(&invalidated);
        {
            let mut gatt = self.shared.gatt.lock().unwrap();
            for service in &removed {
                let keys: Vec<CharKey> = gatt
                    .reads
                    .keys()
                    .chain(gatt.writes.keys())
                    .chain(gatt.control_points.keys())
                    .filter(|(s, _)| s == service)
                    .copied()
                    .collect();
                for key in keys {
                    let error = Error::NotPresent {
                        service: key.0,
                        characteristic: key.1,
                    };
                    if let Some(waiters) = gatt.reads.remove(&key) {
                        for waiter in waiters {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                    if let Some(waiter) = gatt.writes.remove(&key) {
                        let _ = waiter.send(Err(error.clone()));
                    }
                    if let Some(transaction) = gatt.control_points.remove(&key) {
                        let _ = transaction.tx.send(Err(error));
                    }
                }
            }
        }
        self.notify_injections_services_changed();
        if removed.is_empty() {
            return;
        }
        debug!(
            "peripheral {}: rediscovering {} invalidated service(s)",
            self.id(),
            removed.len()
        );
        if let Err(error) = self.shared.host.discover_services(Some(removed)).await {
            warn!("peripheral {}: rediscovery failed: {}", self.id(), error);
        }
    }

    pub(crate) fn handle_descriptors_discovered(
        &self,
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<crate::api::Descriptor>>,
    ) {
        match result {
            Ok(descriptors) => {
                self.shared
                    .storage
                    .set_descriptors(service, characteristic, descriptors);
            }
            Err(error) => debug!(
                "descriptor discovery for {} failed: {}",
                characteristic.to_short_string(),
                error
            ),
        }
    }

    /// A value arrived, through a read response or a notification. The raw
    /// bytes are stored first, then typed accessors re-decode, then an
    /// outstanding control-point transaction is fulfilled, then read
    /// continuations and subscribers observe the value.
    pub(crate) fn handle_value_updated(
        &self,
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<u8>>,
    ) {
        let key = (service, characteristic);
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                let read_waiters = self.shared.gatt.lock().unwrap().reads.remove(&key);
                match read_waiters {
                    Some(waiters) => {
                        for waiter in waiters {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                    None => warn!(
                        "notification for {} carried an error: {}",
                        characteristic.to_short_string(),
                        error
                    ),
                }
                if let Some(transaction) =
                    self.shared.gatt.lock().unwrap().control_points.remove(&key)
                {
                    let _ = transaction.tx.send(Err(error));
                }
                return;
            }
        };

        self.shared.storage.mark_activity();
        if !self.shared.storage.store_value(service, characteristic, &value) {
            trace!(
                "value for undiscovered characteristic {} dropped",
                characteristic.to_short_string()
            );
        }

        let injections: Vec<_> = {
            let injections = self.shared.injections.lock().unwrap();
            injections.get(&key).cloned().unwrap_or_default()
        };
        for injection in injections {
            injection.handle_value(&value);
        }

        let (read_waiters, transaction) = {
            let mut gatt = self.shared.gatt.lock().unwrap();
            (gatt.reads.remove(&key), gatt.control_points.remove(&key))
        };
        if let Some(transaction) = transaction {
            let _ = transaction.tx.send(Ok(value.clone()));
        }
        for waiter in read_waiters.unwrap_or_default() {
            let _ = waiter.send(Ok(value.clone()));
        }

        self.dispatch_handlers(key, &value);

        let _ = self.shared.notifications.send(ValueNotification {
            service_uuid: service,
            uuid: characteristic,
            value,
        });
    }

    fn dispatch_handlers(&self, key: CharKey, value: &[u8]) {
        // snapshot under the data mutex, invoke under the ordering lock;
        // handlers may re-enter on_change/cancel, which take read mode
        let entries: Vec<Arc<dyn Fn(&[u8]) + Send + Sync>> = {
            let handlers = self.shared.handlers.lock().unwrap();
            handlers
                .get(&key)
                .map(|entries| entries.iter().map(|entry| entry.handler.clone()).collect())
                .unwrap_or_default()
        };
        let _ordering = self.shared.handler_lock.read();
        for handler in entries {
            handler(value);
        }
    }

    pub(crate) fn handle_write_confirmed(
        &self,
        service: Uuid,
        characteristic: Uuid,
        result: Result<()>,
    ) {
        let waiter = self
            .shared
            .gatt
            .lock()
            .unwrap()
            .writes
            .remove(&(service, characteristic));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => trace!(
                "write confirmation for {} without a waiter",
                characteristic.to_short_string()
            ),
        }
    }

    pub(crate) fn handle_ready_to_send(&self) {
        self.shared.wwr_ready.signal_all();
    }

    pub(crate) fn handle_notification_state(
        &self,
        service: Uuid,
        characteristic: Uuid,
        result: Result<bool>,
    ) {
        if let Ok(notifying) = result {
            self.shared
                .storage
                .set_notifying(service, characteristic, notifying);
            if !notifying {
                self.shared
                    .notify_requested
                    .lock()
                    .unwrap()
                    .remove(&(service, characteristic));
            }
        }
        let waiters = self
            .shared
            .gatt
            .lock()
            .unwrap()
            .notify_waiters
            .remove(&(service, characteristic));
        for waiter in waiters.unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    pub(crate) fn handle_rssi_read(&self, result: Result<i16>) {
        if let Ok(rssi) = result {
            self.shared.storage.set_rssi(rssi);
        }
        let waiters = std::mem::take(&mut self.shared.gatt.lock().unwrap().rssi_waiters);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    // ---- control point -----------------------------------------------------

    pub(crate) fn notification_requested(&self, key: CharKey) -> bool {
        self.shared.notify_requested.lock().unwrap().contains(&key)
    }

    pub(crate) fn begin_control_point_transaction(
        &self,
        key: CharKey,
    ) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>>>)> {
        let mut gatt = self.shared.gatt.lock().unwrap();
        if gatt.control_points.contains_key(&key) {
            return Err(Error::ControlPointInProgress);
        }
        let id = self.shared.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        gatt.control_points.insert(key, ControlPointTransaction { id, tx });
        Ok((id, rx))
    }

    pub(crate) fn clear_control_point_transaction(&self, key: CharKey, id: u64) {
        let mut gatt = self.shared.gatt.lock().unwrap();
        if gatt.control_points.get(&key).is_some_and(|t| t.id == id) {
            gatt.control_points.remove(&key);
        }
    }

    pub(crate) fn control_point_timeout(&self) -> Duration {
        self.shared.control_point_timeout
    }
}

static_assertions::assert_impl_all!(Peripheral: Send, Sync, Clone);
static_assertions::assert_impl_all!(PeripheralStorage: Send, Sync);
