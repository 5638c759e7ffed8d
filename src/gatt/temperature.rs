// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Health Thermometer service.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness, MedFloat32};
use crate::gatt::time::DateTime;
use bitflags::bitflags;
use uuid::Uuid;

/// The Health Thermometer service.
pub const HEALTH_THERMOMETER_SERVICE: Uuid = uuid_from_u16(0x1809);
/// The Temperature Measurement characteristic (indicate).
pub const TEMPERATURE_MEASUREMENT: Uuid = uuid_from_u16(0x2a1c);
/// The Intermediate Temperature characteristic (notify).
pub const INTERMEDIATE_TEMPERATURE: Uuid = uuid_from_u16(0x2a1e);
/// The Measurement Interval characteristic (read/indicate, optionally write).
pub const MEASUREMENT_INTERVAL: Uuid = uuid_from_u16(0x2a21);

bitflags! {
    /// The flag byte leading a temperature measurement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TemperatureFlags: u8 {
        const UNIT_FAHRENHEIT = 0x01;
        const TIMESTAMP_PRESENT = 0x02;
        const TEMPERATURE_TYPE_PRESENT = 0x04;
    }
}

/// Where on the body the temperature was taken: 1 = armpit … 9 = tympanum.
/// Reserved values survive a round trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemperatureType(pub u8);

impl TemperatureType {
    pub const ARMPIT: TemperatureType = TemperatureType(1);
    pub const BODY: TemperatureType = TemperatureType(2);
    pub const EAR: TemperatureType = TemperatureType(3);
    pub const FINGER: TemperatureType = TemperatureType(4);
    pub const GASTROINTESTINAL_TRACT: TemperatureType = TemperatureType(5);
    pub const MOUTH: TemperatureType = TemperatureType(6);
    pub const RECTUM: TemperatureType = TemperatureType(7);
    pub const TOE: TemperatureType = TemperatureType(8);
    pub const TYMPANUM: TemperatureType = TemperatureType(9);
}

impl ByteDecode for TemperatureType {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u8::decode(bytes, endianness).map(TemperatureType)
    }
}

impl ByteEncode for TemperatureType {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.0.encode(out, endianness);
    }
}

/// The unit of a temperature value, taken from the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

/// A temperature measurement: a 32-bit medical float plus optional timestamp
/// and body-location type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureMeasurement {
    /// The raw flag byte. Presence bits are recomputed from the optional
    /// fields on encode; unknown bits round-trip unchanged.
    pub flags: TemperatureFlags,
    pub temperature: MedFloat32,
    pub timestamp: Option<DateTime>,
    pub temperature_type: Option<TemperatureType>,
}

const PRESENCE_BITS: TemperatureFlags =
    TemperatureFlags::TIMESTAMP_PRESENT.union(TemperatureFlags::TEMPERATURE_TYPE_PRESENT);

impl TemperatureMeasurement {
    pub fn celsius(temperature: MedFloat32) -> Self {
        TemperatureMeasurement {
            flags: TemperatureFlags::empty(),
            temperature,
            timestamp: None,
            temperature_type: None,
        }
    }

    pub fn unit(&self) -> TemperatureUnit {
        if self.flags.contains(TemperatureFlags::UNIT_FAHRENHEIT) {
            TemperatureUnit::Fahrenheit
        } else {
            TemperatureUnit::Celsius
        }
    }
}

impl ByteDecode for TemperatureMeasurement {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = TemperatureFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let temperature = MedFloat32::decode(bytes, endianness)?;
        let timestamp = if flags.contains(TemperatureFlags::TIMESTAMP_PRESENT) {
            Some(DateTime::decode(bytes, endianness)?)
        } else {
            None
        };
        let temperature_type = if flags.contains(TemperatureFlags::TEMPERATURE_TYPE_PRESENT) {
            Some(TemperatureType::decode(bytes, endianness)?)
        } else {
            None
        };
        Some(TemperatureMeasurement {
            flags,
            temperature,
            timestamp,
            temperature_type,
        })
    }
}

impl ByteEncode for TemperatureMeasurement {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let mut flags = self.flags.difference(PRESENCE_BITS);
        if self.timestamp.is_some() {
            flags |= TemperatureFlags::TIMESTAMP_PRESENT;
        }
        if self.temperature_type.is_some() {
            flags |= TemperatureFlags::TEMPERATURE_TYPE_PRESENT;
        }
        flags.bits().encode(out, endianness);
        self.temperature.encode(out, endianness);
        if let Some(timestamp) = &self.timestamp {
            timestamp.encode(out, endianness);
        }
        if let Some(temperature_type) = self.temperature_type {
            temperature_type.encode(out, endianness);
        }
    }
}

/// The interval between periodic measurements, in seconds. Zero means the
/// peripheral does not measure periodically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MeasurementInterval(pub u16);

impl MeasurementInterval {
    pub const NO_PERIODIC_MEASUREMENT: MeasurementInterval = MeasurementInterval(0);

    pub fn is_periodic(self) -> bool {
        self.0 != 0
    }
}

impl ByteDecode for MeasurementInterval {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u16::decode(bytes, endianness).map(MeasurementInterval)
    }
}

impl ByteEncode for MeasurementInterval {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.0.encode(out, endianness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};
    use crate::gatt::time::Month;

    #[test]
    fn minimal_measurement_round_trip() {
        let measurement = TemperatureMeasurement::celsius(MedFloat32::from(36.4));
        let encoded = encode_value(&measurement);
        assert_eq!(encoded.len(), 5);
        assert_eq!(encoded[0], 0x00);
        assert_eq!(decode_value::<TemperatureMeasurement>(&encoded), Some(measurement));
    }

    #[test]
    fn full_measurement_round_trip() {
        let measurement = TemperatureMeasurement {
            flags: TemperatureFlags::UNIT_FAHRENHEIT,
            temperature: MedFloat32::from(98.6),
            timestamp: DateTime::new(2024, Month::January, 15, 6, 0, 30),
            temperature_type: Some(TemperatureType::MOUTH),
        };
        let encoded = encode_value(&measurement);
        assert_eq!(encoded.len(), 1 + 4 + 7 + 1);
        let decoded = decode_value::<TemperatureMeasurement>(&encoded).unwrap();
        assert_eq!(decoded, measurement);
        assert_eq!(decoded.unit(), TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn reserved_temperature_types_survive() {
        let measurement = TemperatureMeasurement {
            temperature_type: Some(TemperatureType(0x42)),
            ..TemperatureMeasurement::celsius(MedFloat32::from(37.0))
        };
        let encoded = encode_value(&measurement);
        assert_eq!(decode_value::<TemperatureMeasurement>(&encoded), Some(measurement));
    }

    #[test]
    fn measurement_interval() {
        assert!(!MeasurementInterval::NO_PERIODIC_MEASUREMENT.is_periodic());
        let interval = MeasurementInterval(300);
        let encoded = encode_value(&interval);
        assert_eq!(encoded, vec![0x2c, 0x01]);
        assert_eq!(decode_value::<MeasurementInterval>(&encoded), Some(interval));
    }
}
