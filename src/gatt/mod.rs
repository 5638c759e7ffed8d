// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A catalog of standardized GATT service payloads, byte-exact per the
//! Bluetooth GATT Specification Supplement. Every type here implements the
//! [`ByteDecode`](crate::codec::ByteDecode) /
//! [`ByteEncode`](crate::codec::ByteEncode) contracts from [`crate::codec`],
//! and every bitfield preserves unknown bits across a round trip.

pub mod blood_pressure;
pub mod device_information;
pub mod pulse_oximeter;
pub mod record_access;
pub mod temperature;
pub mod time;
pub mod weight;
