// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The declarative device model: an application describes a device as a set
//! of services, each a set of typed characteristics, and binds it to a
//! discovered [`Peripheral`]. Each typed characteristic is backed by a
//! [`CharacteristicAccessor`], which keeps a decoded copy of the value,
//! re-decodes when the service table changes, and fans changes out to typed
//! subscribers. Accessors survive reconnections; they hold only a weak
//! reference to the peripheral.

use crate::codec::{decode_value, ByteDecode, ByteEncode};
use crate::peripheral::{Peripheral, WeakPeripheral};
use crate::sync::RwLock;
use crate::{Error, Result};
use futures::stream::Stream;
use log::warn;
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// The type-erased face of a [`CharacteristicAccessor`], used by the
/// peripheral runtime to route raw values and service-table changes into the
/// typed world.
pub trait AnyInjection: Send + Sync {
    fn service_uuid(&self) -> Uuid;
    fn characteristic_uuid(&self) -> Uuid;
    /// Whether notifications should be enabled for this characteristic as
    /// soon as it is discovered.
    fn default_notify(&self) -> bool;
    /// Attaches the injection to a live peripheral.
    fn bind(&self, peripheral: &Peripheral);
    /// Detaches from the peripheral; the observable value is cleared.
    fn unbind(&self);
    /// A raw value arrived for the characteristic.
    fn handle_value(&self, value: &[u8]);
    /// The service table changed; re-resolve the characteristic and its
    /// value.
    fn handle_services_changed(&self, peripheral: &Peripheral);
    /// The link went down; the characteristic is gone until rediscovery.
    fn clear(&self);
}

/// A service of a declaratively described device.
pub trait BluetoothService: Send + Sync {
    fn service_uuid(&self) -> Uuid;
    /// The typed characteristics of this service, as type-erased injections.
    fn injections(&self) -> Vec<Arc<dyn AnyInjection>>;
}

/// A declaratively described device: a collection of services.
pub trait BluetoothDevice: Send + Sync {
    fn services(&self) -> Vec<&dyn BluetoothService>;
}

/// A cancellable token for a typed on-change handler. Dropping the token
/// unregisters the handler.
pub struct HandlerRegistration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl HandlerRegistration {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Debug for HandlerRegistration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("HandlerRegistration")
    }
}

struct TypedHandler<V> {
    id: u64,
    handler: Arc<dyn Fn(&V) + Send + Sync>,
}

struct AccessorShared<V> {
    service: Uuid,
    characteristic: Uuid,
    default_notify: AtomicBool,
    value: RwLock<Option<V>>,
    peripheral: Mutex<Option<WeakPeripheral>>,
    subscribers: broadcast::Sender<V>,
    handlers: Mutex<Vec<TypedHandler<V>>>,
    next_handler_id: AtomicU64,
}

/// A typed handle on one characteristic of a bound device.
///
/// Reads, writes and notification toggles go through the owning
/// peripheral's serializer, with the codec applied at the boundary. The
/// accessor caches the last decoded value and exposes it synchronously.
pub struct CharacteristicAccessor<V> {
    shared: Arc<AccessorShared<V>>,
}

impl<V> Clone for CharacteristicAccessor<V> {
    fn clone(&self) -> Self {
        CharacteristicAccessor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> Debug for CharacteristicAccessor<V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CharacteristicAccessor")
            .field("service", &self.shared.service)
            .field("characteristic", &self.shared.characteristic)
            .finish()
    }
}

impl<V> CharacteristicAccessor<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        let (subscribers, _) = broadcast::channel(16);
        CharacteristicAccessor {
            shared: Arc::new(AccessorShared {
                service,
                characteristic,
                default_notify: AtomicBool::new(false),
                value: RwLock::new(None),
                peripheral: Mutex::new(None),
                subscribers,
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(0),
            }),
        }
    }

    /// Enables notifications for this characteristic as soon as it is
    /// discovered.
    pub fn with_default_notify(self) -> Self {
        self.shared.default_notify.store(true, Ordering::Relaxed);
        self
    }

    pub fn service_uuid(&self) -> Uuid {
        self.shared.service
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.shared.characteristic
    }

    /// The last decoded value, if any.
    pub fn value(&self) -> Option<V> {
        self.shared.value.read().clone()
    }

    /// Whether the characteristic is currently present on the bound
    /// peripheral.
    pub fn is_present(&self) -> bool {
        self.peripheral()
            .map(|peripheral| {
                peripheral
                    .characteristic(self.shared.service, self.shared.characteristic)
                    .is_some()
            })
            .unwrap_or(false)
    }

    fn peripheral(&self) -> Option<Peripheral> {
        self.shared
            .peripheral
            .lock()
            .unwrap()
            .as_ref()
            .and_then(WeakPeripheral::upgrade)
    }

    fn require_peripheral(&self) -> Result<Peripheral> {
        self.peripheral().ok_or(Error::NotConnected)
    }

    /// A stream of decoded values. Fires on every stored change, across
    /// reconnections.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = V> + Send>> {
        let receiver = self.shared.subscribers.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|item| item.ok()))
    }

    /// Registers a typed on-change handler. With `initial`, the handler
    /// fires immediately when a value is already known.
    pub fn on_change(
        &self,
        initial: bool,
        handler: impl Fn(&V) + Send + Sync + 'static,
    ) -> HandlerRegistration {
        let handler: Arc<dyn Fn(&V) + Send + Sync> = Arc::new(handler);
        if initial {
            if let Some(value) = self.value() {
                handler(&value);
            }
        }
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.shared.handlers.lock().unwrap().push(TypedHandler {
            id,
            handler,
        });
        let weak = Arc::downgrade(&self.shared);
        HandlerRegistration {
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handlers.lock().unwrap().retain(|entry| entry.id != id);
                }
            })),
        }
    }

    fn store(&self, value: V) {
        *self.shared.value.write() = Some(value.clone());
        let handlers: Vec<_> = {
            let handlers = self.shared.handlers.lock().unwrap();
            handlers.iter().map(|entry| entry.handler.clone()).collect()
        };
        for handler in handlers {
            handler(&value);
        }
        let _ = self.shared.subscribers.send(value);
    }
}

impl<V> CharacteristicAccessor<V>
where
    V: ByteDecode + Clone + Send + Sync + 'static,
{
    /// Reads and decodes the current value from the peripheral.
    pub async fn read(&self) -> Result<V> {
        let peripheral = self.require_peripheral()?;
        let value: V = peripheral
            .read_value(self.shared.service, self.shared.characteristic)
            .await?;
        Ok(value)
    }

    /// Enables or disables notifications.
    pub async fn enable_notifications(&self, enabled: bool) -> Result<bool> {
        let peripheral = self.require_peripheral()?;
        peripheral
            .enable_notifications(self.shared.service, self.shared.characteristic, enabled)
            .await
    }
}

impl<V> CharacteristicAccessor<V>
where
    V: ByteEncode + Clone + Send + Sync + 'static,
{
    /// Encodes and writes a value with response.
    pub async fn write(&self, value: &V) -> Result<()> {
        let peripheral = self.require_peripheral()?;
        peripheral
            .write_value(self.shared.service, self.shared.characteristic, value)
            .await
    }

    /// Encodes and writes a value without response.
    pub async fn write_without_response(&self, value: &V) -> Result<()> {
        let peripheral = self.require_peripheral()?;
        peripheral
            .write_value_without_response(self.shared.service, self.shared.characteristic, value)
            .await
    }
}

impl<V> CharacteristicAccessor<V>
where
    V: ByteDecode + ByteEncode + Clone + Send + Sync + 'static,
{
    /// Runs a request/response exchange over this characteristic, treating
    /// it as a control point with the same value type in both directions.
    pub async fn control_point_request(&self, request: &V) -> Result<V> {
        let peripheral = self.require_peripheral()?;
        peripheral
            .control_point_request(self.shared.service, self.shared.characteristic, request)
            .await
    }
}

impl<V> AnyInjection for CharacteristicAccessor<V>
where
    V: ByteDecode + ByteEncode + Clone + Send + Sync + 'static,
{
    fn service_uuid(&self) -> Uuid {
        self.shared.service
    }

    fn characteristic_uuid(&self) -> Uuid {
        self.shared.characteristic
    }

    fn default_notify(&self) -> bool {
        self.shared.default_notify.load(Ordering::Relaxed)
    }

    fn bind(&self, peripheral: &Peripheral) {
        *self.shared.peripheral.lock().unwrap() = Some(peripheral.downgrade());
    }

    fn unbind(&self) {
        *self.shared.peripheral.lock().unwrap() = None;
        *self.shared.value.write() = None;
    }

    fn handle_value(&self, value: &[u8]) {
        match decode_value::<V>(value) {
            Some(value) => self.store(value),
            None => warn!(
                "dropping value for characteristic {}: undecodable as {}",
                self.shared.characteristic,
                std::any::type_name::<V>()
            ),
        }
    }

    fn handle_services_changed(&self, peripheral: &Peripheral) {
        match peripheral.characteristic(self.shared.service, self.shared.characteristic) {
            Some(characteristic) => {
                if let Some(raw) = characteristic.value {
                    self.handle_value(&raw);
                }
            }
            None => {
                *self.shared.value.write() = None;
            }
        }
    }

    fn clear(&self) {
        *self.shared.value.write() = None;
    }
}

/// A live binding between a described device and a peripheral. Dropping the
/// binding releases every injection and its handlers.
pub struct DeviceBinding {
    peripheral: Peripheral,
    injections: Vec<Arc<dyn AnyInjection>>,
}

impl DeviceBinding {
    /// Walks the device's service/characteristic tree and installs every
    /// injection on the peripheral. Values that are already known are
    /// decoded immediately.
    pub fn bind(device: &dyn BluetoothDevice, peripheral: &Peripheral) -> Self {
        let mut injections = Vec::new();
        for service in device.services() {
            for injection in service.injections() {
                injection.bind(peripheral);
                peripheral.attach_injection(Arc::clone(&injection));
                injections.push(injection);
            }
        }
        for injection in &injections {
            injection.handle_services_changed(peripheral);
        }
        DeviceBinding {
            peripheral: peripheral.clone(),
            injections,
        }
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        for injection in &self.injections {
            self.peripheral.detach_injection(injection);
            injection.unbind();
        }
    }
}

impl Debug for DeviceBinding {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("peripheral", &self.peripheral.id())
            .field("injections", &self.injections.len())
            .finish()
    }
}
