// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `api` module contains the types shared between the central runtime and
//! the host Bluetooth stack: the GATT model (services, characteristics,
//! properties), parsed advertisements, and the [`HostCentral`] /
//! [`HostPeripheral`] traits a platform backend implements. bluekit itself is
//! platform-agnostic; everything it needs from CoreBluetooth, BlueZ or WinRT
//! is expressed through these traits and the [`HostEvent`] pipe.

pub mod bleuuid;

use crate::Result;
use async_trait::async_trait;
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde_cr as serde;
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt::{self, Debug, Display, Formatter},
    pin::Pin,
};

use futures::stream::Stream;
use uuid::Uuid;

use self::bleuuid::BleUuid;

/// The power/authorization state of the host Bluetooth adapter.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// A stable identifier for a peripheral, assigned by the host stack. On
/// CoreBluetooth this is the peripheral's `identifier` UUID; other backends
/// synthesize one from the device address.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub Uuid);

impl Display for PeripheralId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        PeripheralId(uuid)
    }
}

/// A manufacturer identifier as assigned by the Bluetooth SIG. Occupies the
/// first two bytes (little endian) of manufacturer-specific advertisement
/// data.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManufacturerIdentifier(pub u16);

impl ManufacturerIdentifier {
    /// Extracts the identifier from raw manufacturer-specific data, if the
    /// payload is long enough to carry one.
    pub fn from_manufacturer_data(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        Some(ManufacturerIdentifier(u16::from_le_bytes([
            data[0], data[1],
        ])))
    }
}

impl Display for ManufacturerIdentifier {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The parsed contents of an advertising PDU, immutable once constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The advertised local name. Distinct from the GAP device name; stale
    /// GAP names are specifically *not* reflected here.
    pub local_name: Option<String>,
    /// Advertised service class UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Service UUIDs that did not fit the advertisement and overflowed into
    /// the scan response.
    pub overflow_service_uuids: Vec<Uuid>,
    /// Service-specific advertisement data, keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer-specific data. The first two bytes (little endian) are
    /// the manufacturer identifier.
    pub manufacturer_data: Option<Vec<u8>>,
    /// The transmission power level of the advertisement, if present.
    pub tx_power_level: Option<i8>,
    /// Whether the peripheral advertised as connectable.
    pub is_connectable: Option<bool>,
    /// Solicited service UUIDs.
    pub solicited_service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// The manufacturer identifier carried in `manufacturer_data`, if any.
    pub fn manufacturer_identifier(&self) -> Option<ManufacturerIdentifier> {
        self.manufacturer_data
            .as_deref()
            .and_then(ManufacturerIdentifier::from_manufacturer_data)
    }

    /// The manufacturer-specific payload after the two identifier bytes.
    pub fn manufacturer_payload(&self) -> Option<&[u8]> {
        self.manufacturer_data
            .as_deref()
            .filter(|data| data.len() >= 2)
            .map(|data| &data[2..])
    }

    /// True if `uuid` appears among the advertised or overflowed service
    /// UUIDs.
    pub fn advertises_service(&self, uuid: Uuid) -> bool {
        self.service_uuids.contains(&uuid) || self.overflow_service_uuids.contains(&uuid)
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a
    /// Characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// A GATT service. Services are groups of characteristics, which may be
/// standard or device-specific.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Clone)]
pub struct Service {
    /// The UUID for this service.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// The characteristics of this service.
    pub characteristics: BTreeSet<Characteristic>,
}

/// A Bluetooth characteristic. Characteristics are the main way you will
/// interact with other bluetooth devices. Characteristics are identified by a
/// UUID which may be standardized (like 0x2A35, the blood pressure
/// measurement) or specific to a particular device.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Clone, Default)]
pub struct Characteristic {
    /// The UUID for this characteristic. This uniquely identifies its
    /// behavior.
    pub uuid: Uuid,
    /// The UUID of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// The set of properties for this characteristic, which indicate what
    /// functionality it supports. If you attempt an operation that is not
    /// supported by the characteristic (for example enabling notify on one
    /// without the NOTIFY flag), that operation will fail.
    pub properties: CharPropFlags,
    /// The last value received for this characteristic, either through a read
    /// or a notification. `None` until one arrives.
    pub value: Option<Vec<u8>>,
    /// Whether notifications or indications are currently enabled.
    pub is_notifying: bool,
    /// The descriptors of this characteristic.
    pub descriptors: BTreeSet<Descriptor>,
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "uuid: {}, char properties: {:?}",
            self.uuid.to_short_string(),
            self.properties
        )
    }
}

/// A GATT descriptor attached to a characteristic.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Clone)]
pub struct Descriptor {
    /// The UUID for this descriptor. This uniquely identifies its behavior.
    pub uuid: Uuid,
    /// The UUID of the service this descriptor belongs to.
    pub service_uuid: Uuid,
    /// The UUID of the characteristic this descriptor belongs to.
    pub characteristic_uuid: Uuid,
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "uuid: {}", self.uuid.to_short_string())
    }
}

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a
    /// confirmation or error. Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// A notification sent from a peripheral due to a change in a value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueNotification {
    /// UUID of the service containing the characteristic.
    pub service_uuid: Uuid,
    /// UUID of the characteristic that fired the notification.
    pub uuid: Uuid,
    /// The new value of the characteristic.
    pub value: Vec<u8>,
}

/// Events emitted by a [`CentralManager`](crate::central::CentralManager) to
/// its subscribers.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// The adapter changed state (powered on/off, authorization revoked, …).
    AdapterStateChanged(AdapterState),
    /// A peripheral matching the configured criteria was seen for the first
    /// time.
    DeviceDiscovered(PeripheralId),
    /// A known peripheral produced a fresh advertisement or RSSI value.
    DeviceUpdated(PeripheralId),
    /// A peripheral finished connecting *and* service discovery.
    DeviceConnected(PeripheralId),
    /// A peripheral disconnected, gracefully or otherwise.
    DeviceDisconnected(PeripheralId),
    /// A stale peripheral was evicted from the discovered table.
    DeviceEvicted(PeripheralId),
}

/// Delegate callbacks of the host Bluetooth stack, restated as an event enum.
///
/// A backend delivers these over the stream returned by
/// [`HostCentral::events`]. Results of GATT operations arrive here rather
/// than as return values: the runtime parks a continuation per operation and
/// the dispatcher resolves it when the matching event comes in.
#[derive(Debug)]
pub enum HostEvent {
    /// The adapter changed state.
    StateChanged(AdapterState),
    /// An advertisement was received. `peripheral` is the backend's handle
    /// for the device; the central retains it for the lifetime of the
    /// discovered entry.
    Discovered {
        peripheral: std::sync::Arc<dyn HostPeripheral>,
        advertisement: AdvertisementData,
        rssi: i16,
    },
    /// The connection attempt succeeded at the link layer.
    Connected { id: PeripheralId },
    /// The connection attempt failed before reaching the connected state.
    FailedToConnect {
        id: PeripheralId,
        error: crate::Error,
    },
    /// The link was terminated. `error` is `None` for a requested disconnect.
    Disconnected {
        id: PeripheralId,
        error: Option<crate::Error>,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        id: PeripheralId,
        result: Result<Vec<Service>>,
    },
    /// Characteristic discovery for one service finished. The carried
    /// characteristics replace the service's previous set.
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        result: Result<Vec<Characteristic>>,
    },
    /// Descriptor discovery for one characteristic finished.
    DescriptorsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<Descriptor>>,
    },
    /// The peripheral invalidated some of its services.
    ServicesModified {
        id: PeripheralId,
        invalidated: Vec<Uuid>,
    },
    /// A characteristic value arrived, as the response to a read or as a
    /// spontaneous notification/indication.
    ValueUpdated {
        id: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        result: Result<Vec<u8>>,
    },
    /// A write-with-response completed.
    WriteConfirmed {
        id: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        result: Result<()>,
    },
    /// The stack can accept another write-without-response.
    ReadyToSendWriteWithoutResponse { id: PeripheralId },
    /// Enabling or disabling notifications completed. `result` carries the
    /// new notifying state.
    NotificationStateUpdated {
        id: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        result: Result<bool>,
    },
    /// An RSSI read completed.
    RssiRead {
        id: PeripheralId,
        result: Result<i16>,
    },
}

/// The central half of the host Bluetooth stack: adapter state, scanning and
/// connection management.
///
/// Implementations map onto `CBCentralManager`, `org.bluez.Adapter1`,
/// `BluetoothLEAdvertisementWatcher` and friends. All operation outcomes are
/// reported through the [`HostEvent`] stream.
#[async_trait]
pub trait HostCentral: Send + Sync + 'static {
    /// The current adapter state.
    fn adapter_state(&self) -> AdapterState;

    /// The stream of delegate events. Consumed once, by the central manager's
    /// dispatcher.
    async fn events(&self) -> Result<Pin<Box<dyn Stream<Item = HostEvent> + Send>>>;

    /// Starts scanning for advertisements. An empty `service_uuids` scans for
    /// everything.
    async fn scan(&self, service_uuids: Vec<Uuid>, allow_duplicates: bool) -> Result<()>;

    /// Stops an active scan. Must be idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Initiates a connection. Completion arrives as
    /// [`HostEvent::Connected`] or [`HostEvent::FailedToConnect`].
    async fn connect(&self, id: PeripheralId) -> Result<()>;

    /// Cancels a pending or established connection. Completion arrives as
    /// [`HostEvent::Disconnected`].
    async fn cancel_connection(&self, id: PeripheralId) -> Result<()>;
}

/// The per-peripheral half of the host Bluetooth stack.
///
/// Every method is asynchronous only in its submission; the actual outcome is
/// delivered through the central's [`HostEvent`] stream, mirroring the
/// delegate model of the underlying platforms.
#[async_trait]
pub trait HostPeripheral: Send + Sync + Debug + 'static {
    /// The stable identifier of this peripheral.
    fn identifier(&self) -> PeripheralId;

    /// The GAP device name, if the stack knows one. May be stale; discovery
    /// matching prefers the advertised local name.
    fn gap_name(&self) -> Option<String>;

    /// Discovers services; `None` discovers all.
    async fn discover_services(&self, uuids: Option<Vec<Uuid>>) -> Result<()>;

    /// Discovers characteristics of `service`; `None` discovers all.
    async fn discover_characteristics(
        &self,
        service: Uuid,
        uuids: Option<Vec<Uuid>>,
    ) -> Result<()>;

    /// Discovers the descriptors of one characteristic.
    async fn discover_descriptors(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Issues a characteristic read.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Issues a characteristic write.
    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: WriteType,
    ) -> Result<()>;

    /// Enables or disables notifications/indications.
    async fn set_notify(&self, service: Uuid, characteristic: Uuid, enabled: bool) -> Result<()>;

    /// Issues an RSSI read.
    async fn read_rssi(&self) -> Result<()>;

    /// Whether the stack can accept a write-without-response right now. When
    /// this returns false, callers park until
    /// [`HostEvent::ReadyToSendWriteWithoutResponse`] arrives.
    fn can_send_write_without_response(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufacturer_identifier_from_data() {
        assert_eq!(
            ManufacturerIdentifier::from_manufacturer_data(&[0x4c, 0x00, 0xaa]),
            Some(ManufacturerIdentifier(0x004c))
        );
        assert_eq!(ManufacturerIdentifier::from_manufacturer_data(&[0x4c]), None);
    }

    #[test]
    fn advertisement_manufacturer_payload() {
        let advertisement = AdvertisementData {
            manufacturer_data: Some(vec![0xe1, 0x02, 0xde, 0xad]),
            ..Default::default()
        };
        assert_eq!(
            advertisement.manufacturer_identifier(),
            Some(ManufacturerIdentifier(0x02e1))
        );
        assert_eq!(advertisement.manufacturer_payload(), Some(&[0xde, 0xad][..]));
    }
}
