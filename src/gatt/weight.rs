// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Weight Scale service.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness};
use crate::gatt::time::DateTime;
use bitflags::bitflags;
use uuid::Uuid;

/// The Weight Scale service.
pub const WEIGHT_SCALE_SERVICE: Uuid = uuid_from_u16(0x181d);
/// The Weight Measurement characteristic (indicate).
pub const WEIGHT_MEASUREMENT: Uuid = uuid_from_u16(0x2a9d);
/// The Weight Scale Feature characteristic (read).
pub const WEIGHT_SCALE_FEATURE: Uuid = uuid_from_u16(0x2a9e);

bitflags! {
    /// The flag byte leading a weight measurement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WeightFlags: u8 {
        const UNIT_IMPERIAL = 0x01;
        const TIMESTAMP_PRESENT = 0x02;
        const USER_ID_PRESENT = 0x04;
        const BMI_AND_HEIGHT_PRESENT = 0x08;
    }
}

/// The measurement unit family selected by the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightUnit {
    /// Kilograms and metres.
    Si,
    /// Pounds and inches.
    Imperial,
}

/// The optional body-mass-index and height pair of a weight measurement. BMI
/// has a resolution of 0.1 kg/m²; the height resolution comes from the
/// feature characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmiAndHeight {
    pub bmi: u16,
    pub height: u16,
}

/// A weight measurement. The raw `weight` field is scaled by the resolution
/// advertised in [`WeightScaleFeature`]; see [`Self::resolved_weight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightMeasurement {
    /// The raw flag byte. Presence bits are recomputed from the optional
    /// fields on encode; unknown bits round-trip unchanged.
    pub flags: WeightFlags,
    pub weight: u16,
    pub timestamp: Option<DateTime>,
    pub user_id: Option<u8>,
    pub bmi_and_height: Option<BmiAndHeight>,
}

const PRESENCE_BITS: WeightFlags = WeightFlags::TIMESTAMP_PRESENT
    .union(WeightFlags::USER_ID_PRESENT)
    .union(WeightFlags::BMI_AND_HEIGHT_PRESENT);

impl WeightMeasurement {
    pub fn new(weight: u16) -> Self {
        WeightMeasurement {
            flags: WeightFlags::empty(),
            weight,
            timestamp: None,
            user_id: None,
            bmi_and_height: None,
        }
    }

    pub fn unit(&self) -> WeightUnit {
        if self.flags.contains(WeightFlags::UNIT_IMPERIAL) {
            WeightUnit::Imperial
        } else {
            WeightUnit::Si
        }
    }

    /// The weight scaled by the resolution the peripheral advertises, in
    /// kilograms for SI and pounds for imperial measurements.
    pub fn resolved_weight(&self, feature: WeightScaleFeature) -> f64 {
        self.weight as f64 * feature.weight_resolution().increment(self.unit())
    }

    /// The height scaled by the advertised resolution, in metres for SI and
    /// inches for imperial measurements. `None` when the measurement carries
    /// no height.
    pub fn resolved_height(&self, feature: WeightScaleFeature) -> Option<f64> {
        self.bmi_and_height
            .map(|pair| pair.height as f64 * feature.height_resolution().increment(self.unit()))
    }
}

impl ByteDecode for WeightMeasurement {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let flags = WeightFlags::from_bits_retain(u8::decode(bytes, endianness)?);
        let weight = u16::decode(bytes, endianness)?;
        let timestamp = if flags.contains(WeightFlags::TIMESTAMP_PRESENT) {
            Some(DateTime::decode(bytes, endianness)?)
        } else {
            None
        };
        let user_id = if flags.contains(WeightFlags::USER_ID_PRESENT) {
            Some(u8::decode(bytes, endianness)?)
        } else {
            None
        };
        let bmi_and_height = if flags.contains(WeightFlags::BMI_AND_HEIGHT_PRESENT) {
            Some(BmiAndHeight {
                bmi: u16::decode(bytes, endianness)?,
                height: u16::decode(bytes, endianness)?,
            })
        } else {
            None
        };
        Some(WeightMeasurement {
            flags,
            weight,
            timestamp,
            user_id,
            bmi_and_height,
        })
    }
}

impl ByteEncode for WeightMeasurement {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        let mut flags = self.flags.difference(PRESENCE_BITS);
        if self.timestamp.is_some() {
            flags |= WeightFlags::TIMESTAMP_PRESENT;
        }
        if self.user_id.is_some() {
            flags |= WeightFlags::USER_ID_PRESENT;
        }
        if self.bmi_and_height.is_some() {
            flags |= WeightFlags::BMI_AND_HEIGHT_PRESENT;
        }
        flags.bits().encode(out, endianness);
        self.weight.encode(out, endianness);
        if let Some(timestamp) = &self.timestamp {
            timestamp.encode(out, endianness);
        }
        if let Some(user_id) = self.user_id {
            user_id.encode(out, endianness);
        }
        if let Some(pair) = self.bmi_and_height {
            pair.bmi.encode(out, endianness);
            pair.height.encode(out, endianness);
        }
    }
}

/// The weight resolution code of the feature characteristic (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightResolution {
    NotSpecified,
    Half,
    Fifth,
    Tenth,
    Twentieth,
    Fiftieth,
    Hundredth,
    TwoHundredth,
    Reserved(u8),
}

impl WeightResolution {
    fn from_code(code: u8) -> Self {
        match code {
            0 => WeightResolution::NotSpecified,
            1 => WeightResolution::Half,
            2 => WeightResolution::Fifth,
            3 => WeightResolution::Tenth,
            4 => WeightResolution::Twentieth,
            5 => WeightResolution::Fiftieth,
            6 => WeightResolution::Hundredth,
            7 => WeightResolution::TwoHundredth,
            _ => WeightResolution::Reserved(code),
        }
    }

    /// The per-count increment in kilograms (SI) or pounds (imperial).
    /// Unspecified and reserved codes fall back to the default resolutions of
    /// 0.005 kg / 0.01 lb.
    pub fn increment(self, unit: WeightUnit) -> f64 {
        match (self, unit) {
            (WeightResolution::Half, WeightUnit::Si) => 0.5,
            (WeightResolution::Half, WeightUnit::Imperial) => 1.0,
            (WeightResolution::Fifth, WeightUnit::Si) => 0.2,
            (WeightResolution::Fifth, WeightUnit::Imperial) => 0.5,
            (WeightResolution::Tenth, WeightUnit::Si) => 0.1,
            (WeightResolution::Tenth, WeightUnit::Imperial) => 0.2,
            (WeightResolution::Twentieth, WeightUnit::Si) => 0.05,
            (WeightResolution::Twentieth, WeightUnit::Imperial) => 0.1,
            (WeightResolution::Fiftieth, WeightUnit::Si) => 0.02,
            (WeightResolution::Fiftieth, WeightUnit::Imperial) => 0.05,
            (WeightResolution::Hundredth, WeightUnit::Si) => 0.01,
            (WeightResolution::Hundredth, WeightUnit::Imperial) => 0.02,
            (WeightResolution::TwoHundredth, WeightUnit::Si) => 0.005,
            (WeightResolution::TwoHundredth, WeightUnit::Imperial) => 0.01,
            (_, WeightUnit::Si) => 0.005,
            (_, WeightUnit::Imperial) => 0.01,
        }
    }
}

/// The height resolution code of the feature characteristic (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightResolution {
    NotSpecified,
    Centimetre,
    HalfCentimetre,
    Millimetre,
    Reserved(u8),
}

impl HeightResolution {
    fn from_code(code: u8) -> Self {
        match code {
            0 => HeightResolution::NotSpecified,
            1 => HeightResolution::Centimetre,
            2 => HeightResolution::HalfCentimetre,
            3 => HeightResolution::Millimetre,
            _ => HeightResolution::Reserved(code),
        }
    }

    /// The per-count increment in metres (SI) or inches (imperial).
    /// Unspecified and reserved codes fall back to 0.001 m / 0.1 in.
    pub fn increment(self, unit: WeightUnit) -> f64 {
        match (self, unit) {
            (HeightResolution::Centimetre, WeightUnit::Si) => 0.01,
            (HeightResolution::Centimetre, WeightUnit::Imperial) => 1.0,
            (HeightResolution::HalfCentimetre, WeightUnit::Si) => 0.005,
            (HeightResolution::HalfCentimetre, WeightUnit::Imperial) => 0.5,
            (HeightResolution::Millimetre, WeightUnit::Si) => 0.001,
            (HeightResolution::Millimetre, WeightUnit::Imperial) => 0.1,
            (_, WeightUnit::Si) => 0.001,
            (_, WeightUnit::Imperial) => 0.1,
        }
    }
}

/// The Weight Scale Feature bitfield: supported-feature flags in the low
/// bits, weight and height resolution codes packed above them. Kept raw so
/// reserved bits round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WeightScaleFeature(pub u32);

impl WeightScaleFeature {
    const WEIGHT_RESOLUTION_SHIFT: u32 = 3;
    const HEIGHT_RESOLUTION_SHIFT: u32 = 7;

    pub fn timestamp_supported(self) -> bool {
        self.0 & 0x0000_0001 != 0
    }

    pub fn multiple_users_supported(self) -> bool {
        self.0 & 0x0000_0002 != 0
    }

    pub fn bmi_supported(self) -> bool {
        self.0 & 0x0000_0004 != 0
    }

    pub fn weight_resolution(self) -> WeightResolution {
        WeightResolution::from_code(((self.0 >> Self::WEIGHT_RESOLUTION_SHIFT) & 0x0f) as u8)
    }

    pub fn height_resolution(self) -> HeightResolution {
        HeightResolution::from_code(((self.0 >> Self::HEIGHT_RESOLUTION_SHIFT) & 0x07) as u8)
    }
}

impl ByteDecode for WeightScaleFeature {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u32::decode(bytes, endianness).map(WeightScaleFeature)
    }
}

impl ByteEncode for WeightScaleFeature {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.0.encode(out, endianness);
    }
}
