// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Current Time service and the date/time fields embedded in
//! measurement characteristics.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{take, ByteDecode, ByteEncode, Endianness};
use bitflags::bitflags;
use uuid::Uuid;

/// The Current Time service.
pub const CURRENT_TIME_SERVICE: Uuid = uuid_from_u16(0x1805);
/// The Current Time characteristic.
pub const CURRENT_TIME_CHARACTERISTIC: Uuid = uuid_from_u16(0x2a2b);

/// A month of the year, with `Unknown` for the zero encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Month {
    Unknown = 0,
    January = 1,
    February = 2,
    March = 3,
    April = 4,
    May = 5,
    June = 6,
    July = 7,
    August = 8,
    September = 9,
    October = 10,
    November = 11,
    December = 12,
}

impl Month {
    fn from_u8(value: u8) -> Option<Month> {
        Some(match value {
            0 => Month::Unknown,
            1 => Month::January,
            2 => Month::February,
            3 => Month::March,
            4 => Month::April,
            5 => Month::May,
            6 => Month::June,
            7 => Month::July,
            8 => Month::August,
            9 => Month::September,
            10 => Month::October,
            11 => Month::November,
            12 => Month::December,
            _ => return None,
        })
    }
}

/// The 7-byte GATT date time: year (0 or 1582–9999), month, day (0 or 1–31),
/// hour, minute, second. Zero fields mean "not known".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTime {
    pub year: u16,
    pub month: Month,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub fn new(year: u16, month: Month, day: u8, hour: u8, minute: u8, second: u8) -> Option<Self> {
        let value = DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
        };
        value.is_valid().then_some(value)
    }

    fn is_valid(&self) -> bool {
        (self.year == 0 || (1582..=9999).contains(&self.year))
            && self.day <= 31
            && self.hour <= 23
            && self.minute <= 59
            && self.second <= 59
    }
}

impl ByteDecode for DateTime {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        let year = u16::decode(bytes, endianness)?;
        let raw = take(bytes, 5)?;
        let value = DateTime {
            year,
            month: Month::from_u8(raw[0])?,
            day: raw[1],
            hour: raw[2],
            minute: raw[3],
            second: raw[4],
        };
        value.is_valid().then_some(value)
    }
}

impl ByteEncode for DateTime {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.year.encode(out, endianness);
        out.extend_from_slice(&[
            self.month as u8,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ]);
    }
}

/// A day of the week: 0 is unknown, 1 = Monday … 7 = Sunday. Values above 7
/// are reserved by the specification and survive a round trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DayOfWeek(pub u8);

impl DayOfWeek {
    pub const UNKNOWN: DayOfWeek = DayOfWeek(0);
    pub const MONDAY: DayOfWeek = DayOfWeek(1);
    pub const TUESDAY: DayOfWeek = DayOfWeek(2);
    pub const WEDNESDAY: DayOfWeek = DayOfWeek(3);
    pub const THURSDAY: DayOfWeek = DayOfWeek(4);
    pub const FRIDAY: DayOfWeek = DayOfWeek(5);
    pub const SATURDAY: DayOfWeek = DayOfWeek(6);
    pub const SUNDAY: DayOfWeek = DayOfWeek(7);
}

impl ByteDecode for DayOfWeek {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        u8::decode(bytes, endianness).map(DayOfWeek)
    }
}

impl ByteEncode for DayOfWeek {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.0.encode(out, endianness);
    }
}

/// A date time plus the day of the week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DayDateTime {
    pub date_time: DateTime,
    pub day_of_week: DayOfWeek,
}

impl ByteDecode for DayDateTime {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Some(DayDateTime {
            date_time: DateTime::decode(bytes, endianness)?,
            day_of_week: DayOfWeek::decode(bytes, endianness)?,
        })
    }
}

impl ByteEncode for DayDateTime {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.date_time.encode(out, endianness);
        self.day_of_week.encode(out, endianness);
    }
}

/// A day date time with sub-second resolution: the extra byte counts 1/256
/// fractions of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExactTime256 {
    pub day_date_time: DayDateTime,
    pub fractions256: u8,
}

impl ExactTime256 {
    /// Builds an exact time from a nanosecond component, normalizing whole
    /// seconds that fall out of the fraction into the time fields. Carries
    /// ripple through seconds, minutes and hours; the day is incremented on a
    /// full wrap without calendar awareness.
    pub fn from_nanoseconds(mut day_date_time: DayDateTime, nanoseconds: u64) -> Self {
        let fractions = nanoseconds * 256 / 1_000_000_000;
        let carry_seconds = fractions / 256;
        let fractions256 = (fractions % 256) as u8;

        let time = &mut day_date_time.date_time;
        let mut second = time.second as u64 + carry_seconds;
        let mut minute = time.minute as u64 + second / 60;
        second %= 60;
        let mut hour = time.hour as u64 + minute / 60;
        minute %= 60;
        let day_carry = hour / 24;
        hour %= 24;
        time.second = second as u8;
        time.minute = minute as u8;
        time.hour = hour as u8;
        time.day = time.day.saturating_add(day_carry as u8);

        ExactTime256 {
            day_date_time,
            fractions256,
        }
    }

    /// The fractional part in seconds, `fractions256 / 256`.
    pub fn seconds_fraction(&self) -> f64 {
        self.fractions256 as f64 / 256.0
    }
}

impl ByteDecode for ExactTime256 {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Some(ExactTime256 {
            day_date_time: DayDateTime::decode(bytes, endianness)?,
            fractions256: u8::decode(bytes, endianness)?,
        })
    }
}

impl ByteEncode for ExactTime256 {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.day_date_time.encode(out, endianness);
        self.fractions256.encode(out, endianness);
    }
}

bitflags! {
    /// Why a current-time value changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AdjustReason: u8 {
        const MANUAL_TIME_UPDATE = 0x01;
        const EXTERNAL_REFERENCE_TIME_UPDATE = 0x02;
        const CHANGE_OF_TIME_ZONE = 0x04;
        const CHANGE_OF_DST = 0x08;
    }
}

/// The Current Time characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CurrentTime {
    pub exact_time: ExactTime256,
    pub adjust_reason: AdjustReason,
}

impl ByteDecode for CurrentTime {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Some(CurrentTime {
            exact_time: ExactTime256::decode(bytes, endianness)?,
            adjust_reason: AdjustReason::from_bits_retain(u8::decode(bytes, endianness)?),
        })
    }
}

impl ByteEncode for CurrentTime {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.exact_time.encode(out, endianness);
        self.adjust_reason.bits().encode(out, endianness);
    }
}
