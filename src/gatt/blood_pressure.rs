// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Blood Pressure service.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness, MedFloat16};
use crate::gatt::time::DateTime;
use bitflags::bitflags;
use uuid::Uuid;

/// The Blood Pressure service.
pub const BLOOD_PRESSURE_SERVICE: Uuid = uuid_from_u16(0x1810);
/// The Blood Pressure Measurement characteristic (indicate).
pub const BLOOD_PRESSURE_MEASUREMENT: Uuid = uuid_from_u16(0x2a35);
/// The Intermediate Cuff Pressure characteristic (notify).
pub const INTERMEDIATE_CUFF_PRESSURE: Uuid = uuid_from_u16(0x2a36);
/// The Blood Pressure Feature characteristic (read).
pub const BLOOD_PRESSURE_FEATURE: Uuid = uuid_from_u16(0x2a49);

bitflags! {
    /// The flag byte leading a blood-pressure measurement. The presence bits
    /// are kept consistent with the optional fields when encoding; bits the
    /// specification has not assigned survive a round trip unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BloodPressureFlags: u8 {
        const UNIT_KPA = 0x01;
        const TIMESTAMP_PRESENT = 0x02;
        const PULSE_RATE_PRESENT = 0x04;
        const USER_ID_PRESENT = 0x08;
        const MEASUREMENT_STATUS_PRESENT = 0x10;
    }
}

bitflags! {
    /// The measurement status bitfield. Bit 3 is "pulse rate exceeds upper
    /// limit" and bit 4 "pulse rate is less than lower limit", following the
    /// current GATT Specification Supplement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MeasurementStatus: u16 {
        const BODY_MOVEMENT_DETECTED = 0x0001;
        const CUFF_FIT_LOOSE = 0x0002;
        const IRREGULAR_PULSE_DETECTED = 0x0004;
        const PULSE_RATE_EXCEEDS_UPPER_LIMIT = 0x0008;
        const PULSE_RATE_BELOW_LOWER_LIMIT = 0x0010;
        const IMPROPER_MEASUREMENT_POSITION = 0x0020;
    }
}

/// The unit of the pressure fields, taken from the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloodPressureUnit {
    MmHg,
    KPa,
}

const PRESENCE_BITS: BloodPressureFlags = BloodPressureFlags::TIMESTAMP_PRESENT
    .union(BloodPressureFlags::PULSE_RATE_PRESENT)
    .union(BloodPressureFlags::USER_ID_PRESENT)
    .union(BloodPressureFlags::MEASUREMENT_STATUS_PRESENT);

fn presence_flags(
    flags: BloodPressureFlags,
    timestamp: &Option<DateTime>,
    pulse_rate: &Option<MedFloat16>,
    user_id: &Option<u8>,
    measurement_status: &Option<MeasurementStatus>,
) -> BloodPressureFlags {
    let mut flags = flags.difference(PRESENCE_BITS);
    if timestamp.is_some() {
        flags |= BloodPressureFlags::TIMESTAMP_PRESENT;
    }
    if pulse_rate.is_some() {
        flags |= BloodPressureFlags::PULSE_RATE_PRESENT;
    }
    if user_id.is_some() {
        flags |= BloodPressureFlags::USER_ID_PRESENT;
    }
    if measurement_status.is_some() {
        flags |= BloodPressureFlags::MEASUREMENT_STATUS_PRESENT;
    }
    flags
}

fn encode_optional_tail(
    out: &mut Vec<u8>,
    endianness: Endianness,
    timestamp: &Option<DateTime>,
    pulse_rate: &Option<MedFloat16>,
    user_id: &Option<u8>,
    measurement_status: &Option<MeasurementStatus>,
) {
    if let Some(timestamp) = timestamp {
        timestamp.encode(out, endianness);
    }
    if let Some(pulse_rate) = pulse_rate {
        pulse_rate.encode(out, endianness);
    }
    if let Some(user_id) = user_id {
        user_id.encode(out, endianness);
    }
    if let Some(status) = measurement_status {
        status.bits().encode(out, endianness);
    }
}

struct OptionalTail {
    timestamp: Option<DateTime>,
    pulse_rate: Option<MedFloat16>,
    user_id: Option<u8>,
    measurement_status: Option<MeasurementStatus>,
}

fn decode_optional_tail(
    bytes: &mut &[u8],
    endianness: Endianness,
    flags: BloodPressureFlags,
) -> Option<OptionalTail> {
    let timestamp = if flags.contains(BloodPressureFlags::TIMESTAMP_PRESENT) {
        Some(DateTime::decode(bytes, endianness)?)
    } else {
        None
    };
    let pulse_rate = if flags.contains(BloodPressureFlags::PULSE_RATE_PRESENT) {
        Some(MedFloat16::decode(bytes, endianness)?)
    } else {
        None
    };
    let user_id = if flags.contains(BloodPressureFlags::USER_ID_PRESENT) {
        Some(u8::decode(bytes, endianness)?)
    } else {
        None
    };
    let measurement_status = if flags.contains(BloodPressureFlags::MEASUREMENT_STATUS_PRESENT) {
        Some(MeasurementStatus::from_bits_retain(u16::decode(
            bytes, endianness,
        )?))
    } else {
        None
    };
    Some(OptionalTail {
        timestamp,
        pulse_rate,
        user_id,
        measurement_status,
    })
}

/// A blood-pressure measurement: systolic, diastolic and mean arterial
/// pressure, with optional timestamp, pulse rate, user id and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloodPressureMeasurement {
    /// The raw flag byte. Use [`Self::unit`] for the pressure unit; the
    /// presence bits are recomputed from the optional fields on encode.
    pub flags: BloodPressureFlags,
    pub systolic: MedFloat16,
    pub diastolic: MedFloat16,
    pub mean_arterial_pressure: MedFloat16,
    pub timestamp: Option<DateTime>,
    pub pulse_rate: Option<MedFloat16>,
    pub user_id: Option<u8>,
    pub measurement_status: Option<MeasurementStatus>,
}

impl BloodPressureMeasurement {
    /// A measurement in millimetres of mercury with no optional fields.
    pub fn mmhg(systolic: MedFloat16, diastolic: MedFloat16, mean_arterial_pressure: MedFloat16) -> Self {
        BloodPressureMeasurement {
            flags: BloodPressureFlags::empty(),
            systolic,
            diastolic,
            mean_arterial_pressure,
            timestamp: None,
            pulse_rate: None,
            user_id: None,
            measurement_status: None,
        }
    }

    pub fn unit(&self) -> BloodPressureUnit {
        if self.flags.contains(BloodPressureFlags::UNIT_KPA) {
            BloodPressureUnit::KPa
        } else {
            BloodPressureUnit::MmHg
        }
    }
}

impl ByteDecode for BloodPressureMeasurement {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = BloodPressureFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let systolic = MedFloat16::decode(bytes, endianness)?;
        let diastolic = MedFloat16::decode(bytes, endianness)?;
        let mean_arterial_pressure = MedFloat16::decode(bytes, endianness)?;
        let tail = decode_optional_tail(bytes, endianness, flags)?;
        Some(BloodPressureMeasurement {
            flags,
            systolic,
            diastolic,
            mean_arterial_pressure,
            timestamp: tail.timestamp,
            pulse_rate: tail.pulse_rate,
            user_id: tail.user_id,
            measurement_status: tail.measurement_status,
        })
    }
}

impl ByteEncode for BloodPressureMeasurement {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let flags = presence_flags(
            self.flags,
            &self.timestamp,
            &self.pulse_rate,
            &self.user_id,
            &self.measurement_status,
        );
        flags.bits().encode(out, endianness);
        self.systolic.encode(out, endianness);
        self.diastolic.encode(out, endianness);
        self.mean_arterial_pressure.encode(out, endianness);
        encode_optional_tail(
            out,
            endianness,
            &self.timestamp,
            &self.pulse_rate,
            &self.user_id,
            &self.measurement_status,
        );
    }
}

/// An intermediate cuff-pressure sample, pushed while a measurement is in
/// progress. Shares the blood-pressure layout; the diastolic and mean
/// arterial slots are NaN on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateCuffPressure {
    /// The raw flag byte, as for [`BloodPressureMeasurement`].
    pub flags: BloodPressureFlags,
    pub current_cuff_pressure: MedFloat16,
    pub timestamp: Option<DateTime>,
    pub pulse_rate: Option<MedFloat16>,
    pub user_id: Option<u8>,
    pub measurement_status: Option<MeasurementStatus>,
}

impl IntermediateCuffPressure {
    pub fn new(current_cuff_pressure: MedFloat16) -> Self {
        IntermediateCuffPressure {
            flags: BloodPressureFlags::empty(),
            current_cuff_pressure,
            timestamp: None,
            pulse_rate: None,
            user_id: None,
            measurement_status: None,
        }
    }

    pub fn unit(&self) -> BloodPressureUnit {
        if self.flags.contains(BloodPressureFlags::UNIT_KPA) {
            BloodPressureUnit::KPa
        } else {
            BloodPressureUnit::MmHg
        }
    }
}

impl ByteDecode for IntermediateCuffPressure {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = BloodPressureFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let current_cuff_pressure = MedFloat16::decode(bytes, endianness)?;
        // unused diastolic and mean arterial slots
        MedFloat16::decode(bytes, endianness)?;
        MedFloat16::decode(bytes, endianness)?;
        let tail = decode_optional_tail(bytes, endianness, flags)?;
        Some(IntermediateCuffPressure {
            flags,
            current_cuff_pressure,
            timestamp: tail.timestamp,
            pulse_rate: tail.pulse_rate,
            user_id: tail.user_id,
            measurement_status: tail.measurement_status,
        })
    }
}

impl ByteEncode for IntermediateCuffPressure {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let flags = presence_flags(
            self.flags,
            &self.timestamp,
            &self.pulse_rate,
            &self.user_id,
            &self.measurement_status,
        );
        flags.bits().encode(out, endianness);
        self.current_cuff_pressure.encode(out, endianness);
        MedFloat16::NAN.encode(out, endianness);
        MedFloat16::NAN.encode(out, endianness);
        encode_optional_tail(
            out,
            endianness,
            &self.timestamp,
            &self.pulse_rate,
            &self.user_id,
            &self.measurement_status,
        );
    }
}

bitflags! {
    /// The Blood Pressure Feature bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BloodPressureFeature: u16 {
        const BODY_MOVEMENT_DETECTION = 0x0001;
        const CUFF_FIT_DETECTION = 0x0002;
        const IRREGULAR_PULSE_DETECTION = 0x0004;
        const PULSE_RATE_RANGE_DETECTION = 0x0008;
        const MEASUREMENT_POSITION_DETECTION = 0x0010;
        const MULTIPLE_BOND_SUPPORT = 0x0020;
    }
}

impl ByteDecode for BloodPressureFeature {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u16::decode(bytes, endianness).map(BloodPressureFeature::from_bits_retain)
    }
}

impl ByteEncode for BloodPressureFeature {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.bits().encode(out, endianness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};
    use crate::gatt::time::Month;

    #[test]
    fn full_measurement_round_trip() {
        let measurement = BloodPressureMeasurement {
            timestamp: DateTime::new(2024, Month::March, 5, 13, 12, 12),
            pulse_rate: Some(MedFloat16::from(54.0)),
            user_id: Some(0x67),
            measurement_status: Some(
                MeasurementStatus::IRREGULAR_PULSE_DETECTED
                    | MeasurementStatus::BODY_MOVEMENT_DETECTED,
            ),
            ..BloodPressureMeasurement::mmhg(
                MedFloat16::from(120.5),
                MedFloat16::from(80.5),
                MedFloat16::from(60.0),
            )
        };
        let encoded = encode_value(&measurement);
        let decoded = decode_value::<BloodPressureMeasurement>(&encoded).unwrap();
        assert_eq!(decoded, measurement);
        assert_eq!(decoded.unit(), BloodPressureUnit::MmHg);
        assert_eq!(decoded.pulse_rate.unwrap().value(), 54.0);
    }

    #[test]
    fn minimal_measurement_layout() {
        let measurement = BloodPressureMeasurement::mmhg(
            MedFloat16::from_mantissa_exponent(120, 0).unwrap(),
            MedFloat16::from_mantissa_exponent(80, 0).unwrap(),
            MedFloat16::from_mantissa_exponent(90, 0).unwrap(),
        );
        let encoded = encode_value(&measurement);
        assert_eq!(encoded.len(), 7);
        assert_eq!(encoded[0], 0x00);
        assert_eq!(decode_value::<BloodPressureMeasurement>(&encoded), Some(measurement));
    }

    #[test]
    fn truncated_payload_fails() {
        let measurement = BloodPressureMeasurement::mmhg(
            MedFloat16::from(120.0),
            MedFloat16::from(80.0),
            MedFloat16::from(90.0),
        );
        let encoded = encode_value(&measurement);
        assert_eq!(decode_value::<BloodPressureMeasurement>(&encoded[..6]), None);
    }

    #[test]
    fn presence_bits_follow_fields() {
        let mut measurement = BloodPressureMeasurement::mmhg(
            MedFloat16::from(100.0),
            MedFloat16::from(60.0),
            MedFloat16::from(70.0),
        );
        measurement.user_id = Some(1);
        let encoded = encode_value(&measurement);
        assert_eq!(
            encoded[0],
            BloodPressureFlags::USER_ID_PRESENT.bits()
        );
    }

    #[test]
    fn unknown_flag_bits_survive() {
        let mut encoded = encode_value(&BloodPressureMeasurement::mmhg(
            MedFloat16::from(100.0),
            MedFloat16::from(60.0),
            MedFloat16::from(70.0),
        ));
        encoded[0] |= 0xe0;
        let decoded = decode_value::<BloodPressureMeasurement>(&encoded).unwrap();
        assert_eq!(encode_value(&decoded), encoded);
    }

    #[test]
    fn intermediate_cuff_pressure_blanks_unused_slots() {
        let sample = IntermediateCuffPressure::new(MedFloat16::from(63.0));
        let encoded = encode_value(&sample);
        assert_eq!(encoded.len(), 7);
        // diastolic and MAP slots carry NaN
        assert_eq!(&encoded[3..5], &encode_value(&MedFloat16::NAN)[..]);
        assert_eq!(&encoded[5..7], &encode_value(&MedFloat16::NAN)[..]);
        assert_eq!(decode_value::<IntermediateCuffPressure>(&encoded), Some(sample));
    }

    #[test]
    fn feature_round_trip_with_reserved_bits() {
        let feature = BloodPressureFeature::from_bits_retain(0x8123);
        let encoded = encode_value(&feature);
        assert_eq!(encoded, vec![0x23, 0x81]);
        assert_eq!(decode_value::<BloodPressureFeature>(&encoded), Some(feature));
    }
}
