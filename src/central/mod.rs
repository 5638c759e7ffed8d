// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The central manager: owns the host central handle and the table of
//! discovered peripherals, drives scanning and auto-connect, evicts stale
//! advertisements, and pumps host delegate events into the per-peripheral
//! runtimes.

use crate::api::{
    AdapterState, AdvertisementData, CentralEvent, HostCentral, HostEvent, HostPeripheral,
    PeripheralId,
};
use crate::discovery::DiscoveryDescription;
use crate::peripheral::{Peripheral, PeripheralState};
use crate::{Error, Result};
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use log::{debug, trace, warn};
#[cfg(feature = "serde")]
use serde_cr as serde;
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// The minimum the advertisement stale interval can be configured to.
pub const MIN_STALE_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of a [`CentralManager`].
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone)]
pub struct CentralConfiguration {
    /// Advertisements weaker than this are ignored.
    pub min_rssi: i8,
    /// How long a disconnected peripheral may go without an advertisement
    /// before it is evicted. Clamped to at least [`MIN_STALE_INTERVAL`].
    pub advertisement_stale_interval: Duration,
    /// How long a control-point request waits for its response notification.
    pub control_point_timeout: Duration,
    /// The peripherals to discover, in matching priority order.
    pub descriptions: Vec<DiscoveryDescription>,
}

impl Default for CentralConfiguration {
    fn default() -> Self {
        CentralConfiguration {
            min_rssi: -65,
            advertisement_stale_interval: Duration::from_secs(10),
            control_point_timeout: Duration::from_secs(20),
            descriptions: Vec::new(),
        }
    }
}

impl CentralConfiguration {
    pub fn with_description(mut self, description: DiscoveryDescription) -> Self {
        self.descriptions.push(description);
        self
    }

    pub fn with_min_rssi(mut self, min_rssi: i8) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    pub fn with_stale_interval(mut self, interval: Duration) -> Self {
        self.advertisement_stale_interval = interval;
        self
    }

    fn stale_interval(&self) -> Duration {
        self.advertisement_stale_interval.max(MIN_STALE_INTERVAL)
    }

    /// The union of service UUIDs named by the criteria, used as the scan
    /// filter. Empty means "scan for everything".
    fn scan_ids(&self) -> Vec<Uuid> {
        let ids: BTreeSet<Uuid> = self
            .descriptions
            .iter()
            .flat_map(|description| description.criteria.discovery_ids())
            .collect();
        ids.into_iter().collect()
    }
}

#[derive(Default)]
struct StaleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    host: Arc<dyn HostCentral>,
    config: CentralConfiguration,
    peripherals: DashMap<PeripheralId, Peripheral>,
    state_tx: watch::Sender<AdapterState>,
    is_scanning: AtomicBool,
    auto_connect: AtomicBool,
    events: broadcast::Sender<CentralEvent>,
    stale: Mutex<StaleTimer>,
}

/// The entry point of the central role: scans for peripherals matching the
/// configured discovery descriptions and hands out [`Peripheral`] runtimes.
///
/// Cheap to clone; all clones share one state. Dropping the last clone stops
/// the dispatcher and releases every peripheral.
#[derive(Clone)]
pub struct CentralManager {
    shared: Arc<Shared>,
}

impl CentralManager {
    /// Creates the manager and spawns its dispatcher over the host's event
    /// stream.
    pub fn new(host: Arc<dyn HostCentral>, config: CentralConfiguration) -> Self {
        let (state_tx, _) = watch::channel(host.adapter_state());
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            host,
            config,
            peripherals: DashMap::new(),
            state_tx,
            is_scanning: AtomicBool::new(false),
            auto_connect: AtomicBool::new(false),
            events,
            stale: Mutex::new(StaleTimer::default()),
        });

        let weak = Arc::downgrade(&shared);
        let host = Arc::clone(&shared.host);
        tokio::spawn(async move {
            let mut events = match host.events().await {
                Ok(events) => events,
                Err(error) => {
                    warn!("host event stream unavailable: {}", error);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                CentralManager { shared }.dispatch(event).await;
            }
            trace!("host event stream ended");
        });

        CentralManager { shared }
    }

    /// The adapter state as last reported by the host.
    pub fn state(&self) -> AdapterState {
        *self.shared.state_tx.borrow()
    }

    /// A stream of adapter state changes.
    pub fn state_stream(&self) -> Pin<Box<dyn Stream<Item = AdapterState> + Send>> {
        Box::pin(tokio_stream::wrappers::WatchStream::new(
            self.shared.state_tx.subscribe(),
        ))
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.is_scanning.load(Ordering::Acquire)
    }

    /// A stream of [`CentralEvent`]s. Subscribers that fall behind lose the
    /// oldest events.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = CentralEvent> + Send>> {
        let receiver = self.shared.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|event| async move { event.ok() }))
    }

    /// A snapshot of the currently discovered peripherals.
    pub fn nearby_peripherals(&self) -> Vec<Peripheral> {
        self.shared
            .peripherals
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// One discovered peripheral by id.
    pub fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.shared.peripherals.get(id).map(|entry| entry.value().clone())
    }

    /// Starts scanning for peripherals matching the configured descriptions.
    /// The scan filter is the union of their discovery ids; with no ids
    /// everything is scanned. Duplicate advertisements are requested so RSSI
    /// and advertisement updates keep flowing.
    ///
    /// With `auto_connect`, the central connects on its own while exactly one
    /// matching peripheral is nearby.
    pub async fn scan_nearby_devices(&self, auto_connect: bool) -> Result<()> {
        match self.state() {
            AdapterState::PoweredOn => {}
            AdapterState::Unauthorized => return Err(Error::Unauthorized),
            _ => return Err(Error::NotPoweredOn),
        }
        self.shared.auto_connect.store(auto_connect, Ordering::Release);
        self.shared.is_scanning.store(true, Ordering::Release);
        let ids = self.shared.config.scan_ids();
        debug!(
            "scanning for {} service filter(s), auto_connect={}",
            ids.len(),
            auto_connect
        );
        self.shared.host.scan(ids, true).await
    }

    /// Stops scanning. Idempotent. Peripherals that are disconnected when
    /// scanning stops are dropped from the table.
    pub async fn stop_scanning(&self) -> Result<()> {
        let was_scanning = self.shared.is_scanning.swap(false, Ordering::AcqRel);
        self.shared.host.stop_scan().await?;
        if was_scanning {
            let disconnected: Vec<PeripheralId> = self
                .shared
                .peripherals
                .iter()
                .filter(|entry| entry.value().state() == PeripheralState::Disconnected)
                .map(|entry| *entry.key())
                .collect();
            for id in disconnected {
                self.remove_peripheral(id);
            }
        }
        Ok(())
    }

    /// Connects a peripheral; completes after service discovery. Equivalent
    /// to [`Peripheral::connect`].
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<()> {
        peripheral.connect().await
    }

    /// Disconnects a peripheral. Equivalent to [`Peripheral::disconnect`].
    pub async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        peripheral.disconnect().await
    }

    fn emit(&self, event: CentralEvent) {
        if let Err(lost) = self.shared.events.send(event) {
            trace!("central event dropped, nothing subscribed: {:?}", lost.0);
        }
    }

    fn remove_peripheral(&self, id: PeripheralId) {
        if let Some((_, peripheral)) = self.shared.peripherals.remove(&id) {
            peripheral.storage().set_nearby(false);
            self.emit(CentralEvent::DeviceEvicted(id));
        }
    }

    async fn dispatch(&self, event: HostEvent) {
        match event {
            HostEvent::StateChanged(state) => self.handle_state_changed(state).await,
            HostEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            } => self.handle_discovered(peripheral, advertisement, rssi),
            HostEvent::Connected { id } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_connected().await;
                }
            }
            HostEvent::FailedToConnect { id, error } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_failed_to_connect(error).await;
                    self.emit(CentralEvent::DeviceDisconnected(id));
                    self.reschedule_stale_timer();
                }
            }
            HostEvent::Disconnected { id, error } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_disconnected(error).await;
                    self.emit(CentralEvent::DeviceDisconnected(id));
                    self.reschedule_stale_timer();
                }
            }
            HostEvent::ServicesDiscovered { id, result } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    let was_connected = peripheral.is_connected();
                    peripheral.handle_services_discovered(result).await;
                    self.emit_if_newly_connected(&peripheral, was_connected);
                }
            }
            HostEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    let was_connected = peripheral.is_connected();
                    peripheral
                        .handle_characteristics_discovered(service, result)
                        .await;
                    self.emit_if_newly_connected(&peripheral, was_connected);
                }
            }
            HostEvent::DescriptorsDiscovered {
                id,
                service,
                characteristic,
                result,
            } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_descriptors_discovered(service, characteristic, result);
                }
            }
            HostEvent::ServicesModified { id, invalidated } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_services_modified(invalidated).await;
                }
            }
            HostEvent::ValueUpdated {
                id,
                service,
                characteristic,
                result,
            } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_value_updated(service, characteristic, result);
                }
            }
            HostEvent::WriteConfirmed {
                id,
                service,
                characteristic,
                result,
            } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_write_confirmed(service, characteristic, result);
                }
            }
            HostEvent::ReadyToSendWriteWithoutResponse { id } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_ready_to_send();
                }
            }
            HostEvent::NotificationStateUpdated {
                id,
                service,
                characteristic,
                result,
            } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_notification_state(service, characteristic, result);
                }
            }
            HostEvent::RssiRead { id, result } => {
                if let Some(peripheral) = self.peripheral(&id) {
                    peripheral.handle_rssi_read(result);
                }
            }
        }
    }

    fn emit_if_newly_connected(&self, peripheral: &Peripheral, was_connected: bool) {
        if !was_connected && peripheral.is_connected() {
            self.emit(CentralEvent::DeviceConnected(peripheral.id()));
        }
    }

    async fn handle_state_changed(&self, state: AdapterState) {
        debug!("adapter state changed: {:?}", state);
        let _ = self.shared.state_tx.send(state);
        self.emit(CentralEvent::AdapterStateChanged(state));
        if state == AdapterState::PoweredOn && self.is_scanning() {
            // the adapter came back; resume the interrupted scan
            let ids = self.shared.config.scan_ids();
            if let Err(error) = self.shared.host.scan(ids, true).await {
                warn!("failed to resume scanning: {}", error);
                self.shared.is_scanning.store(false, Ordering::Release);
            }
        }
    }

    fn handle_discovered(
        &self,
        host_peripheral: Arc<dyn HostPeripheral>,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        if rssi == 127 || rssi < self.shared.config.min_rssi as i16 {
            return;
        }
        let id = host_peripheral.identifier();

        if let Some(known) = self.peripheral(&id) {
            known.storage().update_advertisement(advertisement);
            known.storage().set_rssi(rssi);
            known.storage().mark_activity();
            known.storage().set_nearby(true);
            self.emit(CentralEvent::DeviceUpdated(id));
            self.reschedule_stale_timer();
            return;
        }

        let description = match self.match_description(&host_peripheral, &advertisement) {
            Some(description) => Some(description),
            None if self.shared.config.descriptions.is_empty() => None,
            None => return,
        };

        let peripheral = Peripheral::new(
            host_peripheral,
            Arc::downgrade(&self.shared.host),
            advertisement,
            rssi,
            self.shared.config.control_point_timeout,
            self.shared.config.stale_interval(),
        );
        peripheral.set_device_description(description.map(|d| d.device.clone()));
        peripheral.storage().set_nearby(true);
        debug!("discovered peripheral {} (rssi {})", id, rssi);
        self.shared.peripherals.insert(id, peripheral.clone());
        self.emit(CentralEvent::DeviceDiscovered(id));
        self.reschedule_stale_timer();

        if self.shared.auto_connect.load(Ordering::Acquire)
            && self.is_scanning()
            && self.shared.peripherals.len() == 1
        {
            debug!("auto-connecting to {}", id);
            tokio::spawn(async move {
                if let Err(error) = peripheral.connect().await {
                    warn!("auto-connect failed: {}", error);
                }
            });
        }
    }

    fn match_description(
        &self,
        host_peripheral: &Arc<dyn HostPeripheral>,
        advertisement: &AdvertisementData,
    ) -> Option<&DiscoveryDescription> {
        let gap_name = host_peripheral.gap_name();
        let mut matches = self
            .shared
            .config
            .descriptions
            .iter()
            .filter(|description| description.criteria.matches(gap_name.as_deref(), advertisement));
        let first = matches.next()?;
        if matches.next().is_some() {
            warn!(
                "advertisement from {} matches multiple discovery criteria; \
                 using the first registered",
                host_peripheral.identifier()
            );
        }
        Some(first)
    }

    /// Keeps exactly one pending timer, aimed at the disconnected peripheral
    /// with the oldest activity. Called whenever activity stamps move.
    fn reschedule_stale_timer(&self) {
        let mut timer = self.shared.stale.lock().unwrap();
        timer.generation += 1;
        let generation = timer.generation;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }

        let oldest = self
            .shared
            .peripherals
            .iter()
            .filter(|entry| entry.value().state() == PeripheralState::Disconnected)
            .map(|entry| entry.value().storage().last_activity())
            .min();
        let Some(oldest) = oldest else {
            return;
        };

        let deadline = oldest + self.shared.config.stale_interval();
        let weak = Arc::downgrade(&self.shared);
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(shared) = weak.upgrade() {
                CentralManager { shared }.sweep_stale(generation);
            }
        }));
    }

    fn sweep_stale(&self, generation: u64) {
        {
            let timer = self.shared.stale.lock().unwrap();
            if timer.generation != generation {
                return;
            }
        }
        let now = Instant::now();
        let interval = self.shared.config.stale_interval();
        let stale: Vec<PeripheralId> = self
            .shared
            .peripherals
            .iter()
            .filter(|entry| {
                entry.value().state() == PeripheralState::Disconnected
                    && now.duration_since(entry.value().storage().last_activity()) >= interval
            })
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            debug!("evicting stale peripheral {}", id);
            self.remove_peripheral(id);
        }
        self.reschedule_stale_timer();
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CentralManager")
            .field("state", &self.state())
            .field("is_scanning", &self.is_scanning())
            .field("peripherals", &self.shared.peripherals.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(CentralManager: Clone, Send, Sized, Sync);
