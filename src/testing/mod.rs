// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! An in-process implementation of the host-stack traits, for exercising the
//! full central runtime without Bluetooth hardware.
//!
//! [`MockHost`] plays the adapter: tests script adapter-state changes,
//! advertisements and peripheral behavior, and the central under test
//! consumes them through the ordinary [`HostEvent`] pipe. Each simulated
//! device is a [`MockPeripheralHost`] with a GATT table, stored values, and
//! optional manual modes for exercising coalescing and back-pressure.

use crate::api::{
    AdapterState, AdvertisementData, CharPropFlags, Characteristic, HostCentral, HostEvent,
    HostPeripheral, PeripheralId, Service, WriteType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

type CharKey = (Uuid, Uuid);
type ControlPointResponder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// A scriptable host adapter.
pub struct MockHost {
    state: Mutex<AdapterState>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
    scanning: AtomicBool,
    scan_filter: Mutex<Vec<Uuid>>,
    peripherals: Mutex<HashMap<PeripheralId, Arc<MockPeripheralHost>>>,
}

impl MockHost {
    /// A powered-on adapter with no peripherals.
    pub fn new() -> Arc<Self> {
        Self::with_state(AdapterState::PoweredOn)
    }

    pub fn with_state(state: AdapterState) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(MockHost {
            state: Mutex::new(state),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            scanning: AtomicBool::new(false),
            scan_filter: Mutex::new(Vec::new()),
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Changes the adapter state and notifies the central. Leaving the
    /// powered-on state implicitly kills an active scan, as the platform
    /// stacks do.
    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.state.lock().unwrap() = state;
        if state != AdapterState::PoweredOn {
            self.scanning.store(false, Ordering::Release);
        }
        self.emit(HostEvent::StateChanged(state));
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// The service filter of the most recent scan request.
    pub fn scan_filter(&self) -> Vec<Uuid> {
        self.scan_filter.lock().unwrap().clone()
    }

    /// Registers a simulated peripheral.
    pub fn add_peripheral(&self, id: Uuid) -> Arc<MockPeripheralHost> {
        let peripheral = Arc::new(MockPeripheralHost::new(
            PeripheralId(id),
            self.events_tx.clone(),
        ));
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.identifier(), Arc::clone(&peripheral));
        peripheral
    }

    /// Delivers an advertisement for a registered peripheral. Ignored while
    /// not scanning, as a real stack would.
    pub fn advertise(
        &self,
        peripheral: &Arc<MockPeripheralHost>,
        advertisement: AdvertisementData,
        rssi: i16,
    ) {
        if !self.is_scanning() {
            return;
        }
        self.emit(HostEvent::Discovered {
            peripheral: Arc::clone(peripheral) as Arc<dyn HostPeripheral>,
            advertisement,
            rssi,
        });
    }
}

#[async_trait]
impl HostCentral for MockHost {
    fn adapter_state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    async fn events(&self) -> Result<Pin<Box<dyn Stream<Item = HostEvent> + Send>>> {
        let receiver = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Host("event stream already consumed".into()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn scan(&self, service_uuids: Vec<Uuid>, _allow_duplicates: bool) -> Result<()> {
        *self.scan_filter.lock().unwrap() = service_uuids;
        self.scanning.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::Release);
        Ok(())
    }

    async fn connect(&self, id: PeripheralId) -> Result<()> {
        let peripheral = {
            let peripherals = self.peripherals.lock().unwrap();
            peripherals.get(&id).cloned()
        };
        let Some(peripheral) = peripheral else {
            return Err(Error::Host(format!("unknown peripheral {id}")));
        };
        if let Some(error) = peripheral.fail_next_connect.lock().unwrap().take() {
            self.emit(HostEvent::FailedToConnect { id, error });
            return Ok(());
        }
        peripheral.connected.store(true, Ordering::Release);
        self.emit(HostEvent::Connected { id });
        Ok(())
    }

    async fn cancel_connection(&self, id: PeripheralId) -> Result<()> {
        let peripheral = {
            let peripherals = self.peripherals.lock().unwrap();
            peripherals.get(&id).cloned()
        };
        if let Some(peripheral) = peripheral {
            peripheral.connected.store(false, Ordering::Release);
        }
        self.emit(HostEvent::Disconnected { id, error: None });
        Ok(())
    }
}

/// A simulated peripheral: a GATT table plus knobs for failure injection and
/// manual completion of reads and RSSI requests.
pub struct MockPeripheralHost {
    id: PeripheralId,
    gap_name: Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    connected: AtomicBool,
    services: Mutex<Vec<Service>>,
    rssi: Mutex<i16>,
    manual_reads: AtomicBool,
    manual_writes: AtomicBool,
    manual_rssi: AtomicBool,
    manual_notify_acks: AtomicBool,
    read_counts: Mutex<HashMap<CharKey, usize>>,
    rssi_read_count: AtomicUsize,
    writes: Mutex<Vec<(CharKey, Vec<u8>, WriteType)>>,
    fail_next_write: Mutex<Option<Error>>,
    fail_next_connect: Mutex<Option<Error>>,
    control_point_responders: Mutex<HashMap<CharKey, ControlPointResponder>>,
    can_send_wwr: AtomicBool,
}

impl std::fmt::Debug for MockPeripheralHost {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MockPeripheralHost")
            .field("id", &self.id)
            .finish()
    }
}

impl MockPeripheralHost {
    fn new(id: PeripheralId, events_tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        MockPeripheralHost {
            id,
            gap_name: Mutex::new(None),
            events_tx,
            connected: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            rssi: Mutex::new(-50),
            manual_reads: AtomicBool::new(false),
            manual_writes: AtomicBool::new(false),
            manual_rssi: AtomicBool::new(false),
            manual_notify_acks: AtomicBool::new(false),
            read_counts: Mutex::new(HashMap::new()),
            rssi_read_count: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            fail_next_write: Mutex::new(None),
            fail_next_connect: Mutex::new(None),
            control_point_responders: Mutex::new(HashMap::new()),
            can_send_wwr: AtomicBool::new(true),
        }
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_gap_name(&self, name: impl Into<String>) {
        *self.gap_name.lock().unwrap() = Some(name.into());
    }

    /// Adds a service with the given characteristics, each defined by its
    /// UUID, properties and initial value.
    pub fn add_service(
        &self,
        uuid: Uuid,
        characteristics: Vec<(Uuid, CharPropFlags, Option<Vec<u8>>)>,
    ) {
        let characteristics = characteristics
            .into_iter()
            .map(|(characteristic, properties, value)| Characteristic {
                uuid: characteristic,
                service_uuid: uuid,
                properties,
                value,
                is_notifying: false,
                descriptors: Default::default(),
            })
            .collect();
        self.services.lock().unwrap().push(Service {
            uuid,
            primary: true,
            characteristics,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The writes received so far, in order.
    pub fn writes(&self) -> Vec<(CharKey, Vec<u8>, WriteType)> {
        self.writes.lock().unwrap().clone()
    }

    /// How many host reads a characteristic has received.
    pub fn read_count(&self, service: Uuid, characteristic: Uuid) -> usize {
        *self
            .read_counts
            .lock()
            .unwrap()
            .get(&(service, characteristic))
            .unwrap_or(&0)
    }

    pub fn rssi_read_count(&self) -> usize {
        self.rssi_read_count.load(Ordering::Acquire)
    }

    /// Makes the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: Error) {
        *self.fail_next_connect.lock().unwrap() = Some(error);
    }

    /// Makes the next write submission fail with `error`.
    pub fn fail_next_write(&self, error: Error) {
        *self.fail_next_write.lock().unwrap() = Some(error);
    }

    /// Stops answering reads automatically; tests complete them with
    /// [`Self::complete_read`].
    pub fn set_manual_reads(&self, manual: bool) {
        self.manual_reads.store(manual, Ordering::Release);
    }

    /// Stops confirming writes-with-response automatically; tests complete
    /// them with [`Self::complete_write`].
    pub fn set_manual_writes(&self, manual: bool) {
        self.manual_writes.store(manual, Ordering::Release);
    }

    /// Confirms an outstanding write-with-response.
    pub fn complete_write(&self, service: Uuid, characteristic: Uuid, result: Result<()>) {
        self.emit(HostEvent::WriteConfirmed {
            id: self.id,
            service,
            characteristic,
            result,
        });
    }

    pub fn set_manual_rssi(&self, manual: bool) {
        self.manual_rssi.store(manual, Ordering::Release);
    }

    /// Stops acknowledging notification-state changes automatically; tests
    /// complete them with [`Self::complete_notify`].
    pub fn set_manual_notify_acks(&self, manual: bool) {
        self.manual_notify_acks.store(manual, Ordering::Release);
    }

    /// Acknowledges an outstanding notification-state change.
    pub fn complete_notify(&self, service: Uuid, characteristic: Uuid, result: Result<bool>) {
        self.emit(HostEvent::NotificationStateUpdated {
            id: self.id,
            service,
            characteristic,
            result,
        });
    }

    /// Answers an outstanding read.
    pub fn complete_read(&self, service: Uuid, characteristic: Uuid, result: Result<Vec<u8>>) {
        self.emit(HostEvent::ValueUpdated {
            id: self.id,
            service,
            characteristic,
            result,
        });
    }

    pub fn set_rssi(&self, rssi: i16) {
        *self.rssi.lock().unwrap() = rssi;
    }

    /// Answers an outstanding RSSI read.
    pub fn complete_rssi(&self, result: Result<i16>) {
        self.emit(HostEvent::RssiRead {
            id: self.id,
            result,
        });
    }

    /// Updates a stored value and pushes it as a notification.
    pub fn notify_value(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        self.store_value(service, characteristic, &value);
        self.emit(HostEvent::ValueUpdated {
            id: self.id,
            service,
            characteristic,
            result: Ok(value),
        });
    }

    /// Installs a control-point responder: every write to the characteristic
    /// is answered with the responder's output as a notification.
    pub fn set_control_point_responder(
        &self,
        service: Uuid,
        characteristic: Uuid,
        responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.control_point_responders
            .lock()
            .unwrap()
            .insert((service, characteristic), Box::new(responder));
    }

    /// Toggles write-without-response back-pressure. Turning it back on
    /// emits the ready signal.
    pub fn set_can_send_write_without_response(&self, can_send: bool) {
        self.can_send_wwr.store(can_send, Ordering::Release);
        if can_send {
            self.emit(HostEvent::ReadyToSendWriteWithoutResponse { id: self.id });
        }
    }

    /// Invalidates services, as a peripheral changing its GATT table would.
    pub fn modify_services(&self, invalidated: Vec<Uuid>) {
        self.services
            .lock()
            .unwrap()
            .retain(|service| !invalidated.contains(&service.uuid));
        self.emit(HostEvent::ServicesModified {
            id: self.id,
            invalidated,
        });
    }

    /// Drops the link from the peripheral side.
    pub fn drop_connection(&self, error: Option<Error>) {
        self.connected.store(false, Ordering::Release);
        self.emit(HostEvent::Disconnected {
            id: self.id,
            error,
        });
    }

    fn store_value(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let mut services = self.services.lock().unwrap();
        if let Some(entry) = services.iter_mut().find(|s| s.uuid == service) {
            let found = entry
                .characteristics
                .iter()
                .find(|c| c.uuid == characteristic)
                .cloned();
            if let Some(mut c) = found {
                entry.characteristics.retain(|other| other.uuid != characteristic);
                c.value = Some(value.to_vec());
                entry.characteristics.insert(c);
            }
        }
    }

    fn stored_value(&self, service: Uuid, characteristic: Uuid) -> Option<Vec<u8>> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)?
            .value
            .clone()
    }
}

#[async_trait]
impl HostPeripheral for MockPeripheralHost {
    fn identifier(&self) -> PeripheralId {
        self.id
    }

    fn gap_name(&self) -> Option<String> {
        self.gap_name.lock().unwrap().clone()
    }

    async fn discover_services(&self, uuids: Option<Vec<Uuid>>) -> Result<()> {
        // services are reported without their characteristics, as the
        // platform stacks do; characteristics follow their own discovery
        let services: Vec<Service> = self
            .services
            .lock()
            .unwrap()
            .iter()
            .filter(|service| {
                uuids
                    .as_ref()
                    .map(|uuids| uuids.contains(&service.uuid))
                    .unwrap_or(true)
            })
            .map(|service| Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: Default::default(),
            })
            .collect();
        self.emit(HostEvent::ServicesDiscovered {
            id: self.id,
            result: Ok(services),
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        service: Uuid,
        uuids: Option<Vec<Uuid>>,
    ) -> Result<()> {
        let characteristics: Vec<Characteristic> = self
            .services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .iter()
                    .filter(|c| {
                        uuids
                            .as_ref()
                            .map(|uuids| uuids.contains(&c.uuid))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.emit(HostEvent::CharacteristicsDiscovered {
            id: self.id,
            service,
            result: Ok(characteristics),
        });
        Ok(())
    }

    async fn discover_descriptors(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.emit(HostEvent::DescriptorsDiscovered {
            id: self.id,
            service,
            characteristic,
            result: Ok(Vec::new()),
        });
        Ok(())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        *self
            .read_counts
            .lock()
            .unwrap()
            .entry((service, characteristic))
            .or_insert(0) += 1;
        if self.manual_reads.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self
            .stored_value(service, characteristic)
            .ok_or_else(|| Error::Att(0x0a));
        self.emit(HostEvent::ValueUpdated {
            id: self.id,
            service,
            characteristic,
            result,
        });
        Ok(())
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: WriteType,
    ) -> Result<()> {
        if let Some(error) = self.fail_next_write.lock().unwrap().take() {
            return Err(error);
        }
        self.writes
            .lock()
            .unwrap()
            .push(((service, characteristic), data.clone(), write_type));

        if write_type == WriteType::WithResponse && !self.manual_writes.load(Ordering::Acquire) {
            self.emit(HostEvent::WriteConfirmed {
                id: self.id,
                service,
                characteristic,
                result: Ok(()),
            });
        }

        let response = {
            let responders = self.control_point_responders.lock().unwrap();
            responders
                .get(&(service, characteristic))
                .and_then(|responder| responder(&data))
        };
        if let Some(response) = response {
            self.emit(HostEvent::ValueUpdated {
                id: self.id,
                service,
                characteristic,
                result: Ok(response),
            });
        }
        Ok(())
    }

    async fn set_notify(&self, service: Uuid, characteristic: Uuid, enabled: bool) -> Result<()> {
        {
            let mut services = self.services.lock().unwrap();
            if let Some(entry) = services.iter_mut().find(|s| s.uuid == service) {
                let found = entry
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == characteristic)
                    .cloned();
                if let Some(mut c) = found {
                    entry.characteristics.retain(|other| other.uuid != characteristic);
                    c.is_notifying = enabled;
                    entry.characteristics.insert(c);
                }
            }
        }
        if !self.manual_notify_acks.load(Ordering::Acquire) {
            self.emit(HostEvent::NotificationStateUpdated {
                id: self.id,
                service,
                characteristic,
                result: Ok(enabled),
            });
        }
        Ok(())
    }

    async fn read_rssi(&self) -> Result<()> {
        self.rssi_read_count.fetch_add(1, Ordering::AcqRel);
        if self.manual_rssi.load(Ordering::Acquire) {
            return Ok(());
        }
        let rssi = *self.rssi.lock().unwrap();
        self.emit(HostEvent::RssiRead {
            id: self.id,
            result: Ok(rssi),
        });
        Ok(())
    }

    fn can_send_write_without_response(&self) -> bool {
        self.can_send_wwr.load(Ordering::Acquire)
    }
}

static_assertions::assert_impl_all!(MockHost: Send, Sync);
static_assertions::assert_impl_all!(MockPeripheralHost: Send, Sync);
