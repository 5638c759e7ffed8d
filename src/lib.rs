// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! bluekit is a central-role Bluetooth Low Energy (BLE) framework. An
//! application describes the peripherals it is interested in — by advertised
//! services, manufacturer identifiers, name substrings, or masked
//! service/manufacturer data — and bluekit discovers them, maintains
//! connections, serializes GATT operations, and decodes a catalog of
//! standardized GATT payloads (blood pressure, weight, thermometer, pulse
//! oximeter, time, device information, record access).
//!
//! The framework does not talk to the OS Bluetooth stack directly. Instead it
//! consumes the [`api::HostCentral`] and [`api::HostPeripheral`] traits, which
//! restate the usual central-side delegate surface (CoreBluetooth, BlueZ,
//! WinRT) as an event pipe. The [`testing`] module provides an in-process
//! implementation of these traits for tests and simulations.
//!
//! ```no_run
//! use bluekit::central::{CentralConfiguration, CentralManager};
//! use bluekit::discovery::{DiscoveryCriteria, DiscoveryDescription};
//! use bluekit::api::bleuuid::uuid_from_u16;
//! # async fn example(host: std::sync::Arc<bluekit::testing::MockHost>) -> bluekit::Result<()> {
//! let config = CentralConfiguration::default()
//!     .with_description(DiscoveryDescription::discover_all(
//!         DiscoveryCriteria::advertising_service(uuid_from_u16(0x1810)),
//!     ));
//! let central = CentralManager::new(host, config);
//! central.scan_nearby_devices(false).await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod binding;
pub mod central;
pub mod codec;
pub mod discovery;
pub mod gatt;
pub mod peripheral;
pub mod sync;
pub mod testing;

pub use gatt::record_access::RacpResponseCode;

/// The main error type of the library.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the Bluetooth adapter is not powered on")]
    NotPoweredOn,

    #[error("Bluetooth access is not authorized")]
    Unauthorized,

    #[error("the peripheral is not connected")]
    NotConnected,

    #[error("characteristic {characteristic} of service {service} has not been discovered")]
    NotPresent {
        service: Uuid,
        characteristic: Uuid,
    },

    #[error("a write to characteristic {characteristic} of service {service} is already in flight")]
    ConcurrentWrite {
        service: Uuid,
        characteristic: Uuid,
    },

    #[error("the received bytes could not be decoded into the requested value type")]
    IncompatibleDataFormat,

    #[error("another control-point request on this characteristic is in progress")]
    ControlPointInProgress,

    #[error("control-point requests require notifications to be enabled first")]
    ControlPointRequiresNotifying,

    #[error("the control-point response was malformed")]
    ResponseFormatError,

    #[error("record access request failed with response code {0:?}")]
    RecordAccess(RacpResponseCode),

    #[error("the operation timed out")]
    Timeout,

    #[error("the operation was cancelled")]
    Cancelled,

    /// An ATT protocol error reported by the remote peripheral.
    #[error("ATT error {0:#04x}")]
    Att(u8),

    /// An error reported by the host Bluetooth stack that has no closer
    /// mapping.
    #[error("host stack error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, Error>;
