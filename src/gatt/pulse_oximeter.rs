// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Pulse Oximeter (PLX) service.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness, MedFloat16, Uint24};
use crate::gatt::time::DateTime;
use bitflags::bitflags;
use uuid::Uuid;

/// The Pulse Oximeter service.
pub const PULSE_OXIMETER_SERVICE: Uuid = uuid_from_u16(0x1822);
/// The PLX Spot-Check Measurement characteristic (indicate).
pub const PLX_SPOT_CHECK_MEASUREMENT: Uuid = uuid_from_u16(0x2a5e);
/// The PLX Continuous Measurement characteristic (notify).
pub const PLX_CONTINUOUS_MEASUREMENT: Uuid = uuid_from_u16(0x2a5f);
/// The PLX Features characteristic (read).
pub const PLX_FEATURES: Uuid = uuid_from_u16(0x2a60);

/// An SpO2 (percent) and pulse rate (beats per minute) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpO2PulseRate {
    pub spo2: MedFloat16,
    pub pulse_rate: MedFloat16,
}

impl ByteDecode for SpO2PulseRate {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Some(SpO2PulseRate {
            spo2: MedFloat16::decode(bytes, endianness)?,
            pulse_rate: MedFloat16::decode(bytes, endianness)?,
        })
    }
}

impl ByteEncode for SpO2PulseRate {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.spo2.encode(out, endianness);
        self.pulse_rate.encode(out, endianness);
    }
}

bitflags! {
    /// The PLX measurement status bitfield. Bits 0–4 are reserved and
    /// round-trip unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlxMeasurementStatus: u16 {
        const MEASUREMENT_ONGOING = 0x0020;
        const EARLY_ESTIMATED_DATA = 0x0040;
        const VALIDATED_DATA = 0x0080;
        const FULLY_QUALIFIED_DATA = 0x0100;
        const DATA_FROM_MEASUREMENT_STORAGE = 0x0200;
        const DATA_FOR_DEMONSTRATION = 0x0400;
        const DATA_FOR_TESTING = 0x0800;
        const CALIBRATION_ONGOING = 0x1000;
        const MEASUREMENT_UNAVAILABLE = 0x2000;
        const QUESTIONABLE_MEASUREMENT_DETECTED = 0x4000;
        const INVALID_MEASUREMENT_DETECTED = 0x8000;
    }
}

impl ByteDecode for PlxMeasurementStatus {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u16::decode(bytes, endianness).map(PlxMeasurementStatus::from_bits_retain)
    }
}

impl ByteEncode for PlxMeasurementStatus {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.bits().encode(out, endianness);
    }
}

bitflags! {
    /// The device and sensor status bitfield, 24 bits on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceAndSensorStatus: u32 {
        const EXTENDED_DISPLAY_UPDATE_ONGOING = 0x000001;
        const EQUIPMENT_MALFUNCTION_DETECTED = 0x000002;
        const SIGNAL_PROCESSING_IRREGULARITY_DETECTED = 0x000004;
        const INADEQUATE_SIGNAL_DETECTED = 0x000008;
        const POOR_SIGNAL_DETECTED = 0x000010;
        const LOW_PERFUSION_DETECTED = 0x000020;
        const ERRATIC_SIGNAL_DETECTED = 0x000040;
        const NONPULSATILE_SIGNAL_DETECTED = 0x000080;
        const QUESTIONABLE_PULSE_DETECTED = 0x000100;
        const SIGNAL_ANALYSIS_ONGOING = 0x000200;
        const SENSOR_INTERFERENCE_DETECTED = 0x000400;
        const SENSOR_UNCONNECTED_TO_USER = 0x000800;
        const UNKNOWN_SENSOR_CONNECTED = 0x001000;
        const SENSOR_DISPLACED = 0x002000;
        const SENSOR_MALFUNCTIONING = 0x004000;
        const SENSOR_DISCONNECTED = 0x008000;
    }
}

impl ByteDecode for DeviceAndSensorStatus {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Uint24::decode(bytes, endianness)
            .map(|raw| DeviceAndSensorStatus::from_bits_retain(raw.value()))
    }
}

impl ByteEncode for DeviceAndSensorStatus {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        Uint24::new(self.bits()).encode(out, endianness);
    }
}

bitflags! {
    /// The flag byte leading a PLX continuous measurement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlxContinuousFlags: u8 {
        const SPO2PR_FAST_PRESENT = 0x01;
        const SPO2PR_SLOW_PRESENT = 0x02;
        const MEASUREMENT_STATUS_PRESENT = 0x04;
        const DEVICE_AND_SENSOR_STATUS_PRESENT = 0x08;
        const PULSE_AMPLITUDE_INDEX_PRESENT = 0x10;
    }
}

/// A continuous pulse-oximetry measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlxContinuousMeasurement {
    /// The raw flag byte. Presence bits are recomputed from the optional
    /// fields on encode; unknown bits round-trip unchanged.
    pub flags: PlxContinuousFlags,
    pub normal: SpO2PulseRate,
    pub fast: Option<SpO2PulseRate>,
    pub slow: Option<SpO2PulseRate>,
    pub measurement_status: Option<PlxMeasurementStatus>,
    pub device_and_sensor_status: Option<DeviceAndSensorStatus>,
    pub pulse_amplitude_index: Option<MedFloat16>,
}

impl PlxContinuousMeasurement {
    pub fn new(normal: SpO2PulseRate) -> Self {
        PlxContinuousMeasurement {
            flags: PlxContinuousFlags::empty(),
            normal,
            fast: None,
            slow: None,
            measurement_status: None,
            device_and_sensor_status: None,
            pulse_amplitude_index: None,
        }
    }
}

const CONTINUOUS_PRESENCE_BITS: PlxContinuousFlags = PlxContinuousFlags::SPO2PR_FAST_PRESENT
    .union(PlxContinuousFlags::SPO2PR_SLOW_PRESENT)
    .union(PlxContinuousFlags::MEASUREMENT_STATUS_PRESENT)
    .union(PlxContinuousFlags::DEVICE_AND_SENSOR_STATUS_PRESENT)
    .union(PlxContinuousFlags::PULSE_AMPLITUDE_INDEX_PRESENT);

impl ByteDecode for PlxContinuousMeasurement {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = PlxContinuousFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let normal = SpO2PulseRate::decode(bytes, endianness)?;
        let fast = if flags.contains(PlxContinuousFlags::SPO2PR_FAST_PRESENT) {
            Some(SpO2PulseRate::decode(bytes, endianness)?)
        } else {
            None
        };
        let slow = if flags.contains(PlxContinuousFlags::SPO2PR_SLOW_PRESENT) {
            Some(SpO2PulseRate::decode(bytes, endianness)?)
        } else {
            None
        };
        let measurement_status = if flags.contains(PlxContinuousFlags::MEASUREMENT_STATUS_PRESENT) {
            Some(PlxMeasurementStatus::decode(bytes, endianness)?)
        } else {
            None
        };
        let device_and_sensor_status =
            if flags.contains(PlxContinuousFlags::DEVICE_AND_SENSOR_STATUS_PRESENT) {
                Some(DeviceAndSensorStatus::decode(bytes, endianness)?)
            } else {
                None
            };
        let pulse_amplitude_index =
            if flags.contains(PlxContinuousFlags::PULSE_AMPLITUDE_INDEX_PRESENT) {
                Some(MedFloat16::decode(bytes, endianness)?)
            } else {
                None
            };
        Some(PlxContinuousMeasurement {
            flags,
            normal,
            fast,
            slow,
            measurement_status,
            device_and_sensor_status,
            pulse_amplitude_index,
        })
    }
}

impl ByteEncode for PlxContinuousMeasurement {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let mut flags = self.flags.difference(CONTINUOUS_PRESENCE_BITS);
        if self.fast.is_some() {
            flags |= PlxContinuousFlags::SPO2PR_FAST_PRESENT;
        }
        if self.slow.is_some() {
            flags |= PlxContinuousFlags::SPO2PR_SLOW_PRESENT;
        }
        if self.measurement_status.is_some() {
            flags |= PlxContinuousFlags::MEASUREMENT_STATUS_PRESENT;
        }
        if self.device_and_sensor_status.is_some() {
            flags |= PlxContinuousFlags::DEVICE_AND_SENSOR_STATUS_PRESENT;
        }
        if self.pulse_amplitude_index.is_some() {
            flags |= PlxContinuousFlags::PULSE_AMPLITUDE_INDEX_PRESENT;
        }
        flags.bits().encode(out, endianness);
        self.normal.encode(out, endianness);
        if let Some(fast) = &self.fast {
            fast.encode(out, endianness);
        }
        if let Some(slow) = &self.slow {
            slow.encode(out, endianness);
        }
        if let Some(status) = &self.measurement_status {
            status.encode(out, endianness);
        }
        if let Some(status) = &self.device_and_sensor_status {
            status.encode(out, endianness);
        }
        if let Some(pai) = &self.pulse_amplitude_index {
            pai.encode(out, endianness);
        }
    }
}

bitflags! {
    /// The flag byte leading a PLX spot-check measurement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlxSpotCheckFlags: u8 {
        const TIMESTAMP_PRESENT = 0x01;
        const MEASUREMENT_STATUS_PRESENT = 0x02;
        const DEVICE_AND_SENSOR_STATUS_PRESENT = 0x04;
        const PULSE_AMPLITUDE_INDEX_PRESENT = 0x08;
        const DEVICE_CLOCK_NOT_SET = 0x10;
    }
}

/// A spot-check pulse-oximetry measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlxSpotCheckMeasurement {
    /// The raw flag byte. Presence bits are recomputed from the optional
    /// fields on encode; the device-clock-not-set bit and unknown bits
    /// round-trip unchanged.
    pub flags: PlxSpotCheckFlags,
    pub measurement: SpO2PulseRate,
    pub timestamp: Option<DateTime>,
    pub measurement_status: Option<PlxMeasurementStatus>,
    pub device_and_sensor_status: Option<DeviceAndSensorStatus>,
    pub pulse_amplitude_index: Option<MedFloat16>,
}

impl PlxSpotCheckMeasurement {
    pub fn new(measurement: SpO2PulseRate) -> Self {
        PlxSpotCheckMeasurement {
            flags: PlxSpotCheckFlags::empty(),
            measurement,
            timestamp: None,
            measurement_status: None,
            device_and_sensor_status: None,
            pulse_amplitude_index: None,
        }
    }

    pub fn device_clock_not_set(&self) -> bool {
        self.flags.contains(PlxSpotCheckFlags::DEVICE_CLOCK_NOT_SET)
    }
}

const SPOT_CHECK_PRESENCE_BITS: PlxSpotCheckFlags = PlxSpotCheckFlags::TIMESTAMP_PRESENT
    .union(PlxSpotCheckFlags::MEASUREMENT_STATUS_PRESENT)
    .union(PlxSpotCheckFlags::DEVICE_AND_SENSOR_STATUS_PRESENT)
    .union(PlxSpotCheckFlags::PULSE_AMPLITUDE_INDEX_PRESENT);

impl ByteDecode for PlxSpotCheckMeasurement {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = PlxSpotCheckFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let measurement = SpO2PulseRate::decode(bytes, endianness)?;
        let timestamp = if flags.contains(PlxSpotCheckFlags::TIMESTAMP_PRESENT) {
            Some(DateTime::decode(bytes, endianness)?)
        } else {
            None
        };
        let measurement_status = if flags.contains(PlxSpotCheckFlags::MEASUREMENT_STATUS_PRESENT) {
            Some(PlxMeasurementStatus::decode(bytes, endianness)?)
        } else {
            None
        };
        let device_and_sensor_status =
            if flags.contains(PlxSpotCheckFlags::DEVICE_AND_SENSOR_STATUS_PRESENT) {
                Some(DeviceAndSensorStatus::decode(bytes, endianness)?)
            } else {
                None
            };
        let pulse_amplitude_index =
            if flags.contains(PlxSpotCheckFlags::PULSE_AMPLITUDE_INDEX_PRESENT) {
                Some(MedFloat16::decode(bytes, endianness)?)
            } else {
                None
            };
        Some(PlxSpotCheckMeasurement {
            flags,
            measurement,
            timestamp,
            measurement_status,
            device_and_sensor_status,
            pulse_amplitude_index,
        })
    }
}

impl ByteEncode for PlxSpotCheckMeasurement {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let mut flags = self.flags.difference(SPOT_CHECK_PRESENCE_BITS);
        if self.timestamp.is_some() {
            flags |= PlxSpotCheckFlags::TIMESTAMP_PRESENT;
        }
        if self.measurement_status.is_some() {
            flags |= PlxSpotCheckFlags::MEASUREMENT_STATUS_PRESENT;
        }
        if self.device_and_sensor_status.is_some() {
            flags |= PlxSpotCheckFlags::DEVICE_AND_SENSOR_STATUS_PRESENT;
        }
        if self.pulse_amplitude_index.is_some() {
            flags |= PlxSpotCheckFlags::PULSE_AMPLITUDE_INDEX_PRESENT;
        }
        flags.bits().encode(out, endianness);
        self.measurement.encode(out, endianness);
        if let Some(timestamp) = &self.timestamp {
            timestamp.encode(out, endianness);
        }
        if let Some(status) = &self.measurement_status {
            status.encode(out, endianness);
        }
        if let Some(status) = &self.device_and_sensor_status {
            status.encode(out, endianness);
        }
        if let Some(pai) = &self.pulse_amplitude_index {
            pai.encode(out, endianness);
        }
    }
}

bitflags! {
    /// The supported-features bitfield of the PLX Features characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlxSupportedFeatures: u16 {
        const MEASUREMENT_STATUS = 0x0001;
        const DEVICE_AND_SENSOR_STATUS = 0x0002;
        const SPOT_CHECK_STORAGE = 0x0004;
        const SPOT_CHECK_TIMESTAMP = 0x0008;
        const SPO2PR_FAST = 0x0010;
        const SPO2PR_SLOW = 0x0020;
        const PULSE_AMPLITUDE_INDEX = 0x0040;
        const MULTIPLE_BONDS = 0x0080;
    }
}

/// The PLX Features characteristic value. The support masks are present iff
/// the corresponding feature bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlxFeatures {
    pub supported: PlxSupportedFeatures,
    pub measurement_status_support: Option<PlxMeasurementStatus>,
    pub device_and_sensor_status_support: Option<DeviceAndSensorStatus>,
}

impl ByteDecode for PlxFeatures {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let supported = PlxSupportedFeatures::from_bits_retain(u16::decode(bytes, endianness)?);
        let measurement_status_support =
            if supported.contains(PlxSupportedFeatures::MEASUREMENT_STATUS) {
                Some(PlxMeasurementStatus::decode(bytes, endianness)?)
            } else {
                None
            };
        let device_and_sensor_status_support =
            if supported.contains(PlxSupportedFeatures::DEVICE_AND_SENSOR_STATUS) {
                Some(DeviceAndSensorStatus::decode(bytes, endianness)?)
            } else {
                None
            };
        Some(PlxFeatures {
            supported,
            measurement_status_support,
            device_and_sensor_status_support,
        })
    }
}

impl ByteEncode for PlxFeatures {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let mut supported = self
            .supported
            .difference(PlxSupportedFeatures::MEASUREMENT_STATUS)
            .difference(PlxSupportedFeatures::DEVICE_AND_SENSOR_STATUS);
        if self.measurement_status_support.is_some() {
            supported |= PlxSupportedFeatures::MEASUREMENT_STATUS;
        }
        if self.device_and_sensor_status_support.is_some() {
            supported |= PlxSupportedFeatures::DEVICE_AND_SENSOR_STATUS;
        }
        supported.bits().encode(out, endianness);
        if let Some(mask) = &self.measurement_status_support {
            mask.encode(out, endianness);
        }
        if let Some(mask) = &self.device_and_sensor_status_support {
            mask.encode(out, endianness);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};

    fn normal() -> SpO2PulseRate {
        SpO2PulseRate {
            spo2: MedFloat16::from(97.0),
            pulse_rate: MedFloat16::from(64.0),
        }
    }

    #[test]
    fn continuous_minimal_round_trip() {
        let measurement = PlxContinuousMeasurement::new(normal());
        let encoded = encode_value(&measurement);
        assert_eq!(encoded.len(), 5);
        assert_eq!(decode_value::<PlxContinuousMeasurement>(&encoded), Some(measurement));
    }

    #[test]
    fn continuous_full_round_trip() {
        let measurement = PlxContinuousMeasurement {
            fast: Some(normal()),
            slow: Some(normal()),
            measurement_status: Some(PlxMeasurementStatus::VALIDATED_DATA),
            device_and_sensor_status: Some(DeviceAndSensorStatus::LOW_PERFUSION_DETECTED),
            pulse_amplitude_index: Some(MedFloat16::from(1.4)),
            ..PlxContinuousMeasurement::new(normal())
        };
        let encoded = encode_value(&measurement);
        assert_eq!(encoded.len(), 1 + 4 + 4 + 4 + 2 + 3 + 2);
        assert_eq!(decode_value::<PlxContinuousMeasurement>(&encoded), Some(measurement));
    }

    #[test]
    fn spot_check_round_trip_keeps_clock_bit() {
        let mut measurement = PlxSpotCheckMeasurement::new(normal());
        measurement.flags |= PlxSpotCheckFlags::DEVICE_CLOCK_NOT_SET;
        measurement.pulse_amplitude_index = Some(MedFloat16::from(0.9));
        let encoded = encode_value(&measurement);
        let decoded = decode_value::<PlxSpotCheckMeasurement>(&encoded).unwrap();
        assert_eq!(decoded, measurement);
        assert!(decoded.device_clock_not_set());
    }

    #[test]
    fn device_and_sensor_status_is_24_bits() {
        let status = DeviceAndSensorStatus::from_bits_retain(0xabcdef);
        let encoded = encode_value(&status);
        assert_eq!(encoded, vec![0xef, 0xcd, 0xab]);
        assert_eq!(decode_value::<DeviceAndSensorStatus>(&encoded), Some(status));
    }

    #[test]
    fn features_support_masks_follow_bits() {
        let features = PlxFeatures {
            supported: PlxSupportedFeatures::PULSE_AMPLITUDE_INDEX,
            measurement_status_support: Some(
                PlxMeasurementStatus::VALIDATED_DATA | PlxMeasurementStatus::MEASUREMENT_ONGOING,
            ),
            device_and_sensor_status_support: None,
        };
        let encoded = encode_value(&features);
        assert_eq!(encoded.len(), 4);
        let decoded = decode_value::<PlxFeatures>(&encoded).unwrap();
        assert!(decoded.supported.contains(PlxSupportedFeatures::MEASUREMENT_STATUS));
        assert_eq!(
            decoded.measurement_status_support,
            features.measurement_status_support
        );
    }
}
