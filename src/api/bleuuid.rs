//! Utilities for dealing with BLE UUIDs, converting to and from their short
//! formats.
//!
//! 16- and 32-bit Bluetooth UUIDs are aliases into the Bluetooth base UUID
//! `00000000-0000-1000-8000-00805f9b34fb`; two UUIDs are the same iff their
//! 128-bit expansions are equal, which is what comparing the expanded
//! [`Uuid`] values gives us.

use uuid::Uuid;

/// The Bluetooth base UUID, into which all short UUIDs expand.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

const BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Expand a 32-bit BLE short UUID by filling in the standard Bluetooth base
/// UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expand a 16-bit BLE short UUID by filling in the standard Bluetooth base
/// UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid BLE short UUID then return its short form,
    /// otherwise return `None`.
    fn to_ble_u32(&self) -> Option<u32>;

    /// If the UUID is a valid 16-bit BLE short UUID then return its short
    /// form, otherwise return `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable. Used
    /// throughout the crate's log output.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        (value & BASE_MASK_32 == BLUETOOTH_BASE_UUID).then(|| (value >> 96) as u32)
    }

    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        (value & BASE_MASK_16 == BLUETOOTH_BASE_UUID).then(|| (value >> 96) as u16)
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#06x}", uuid16)
        } else if let Some(uuid32) = self.to_ble_u32() {
            format!("{:#010x}", uuid32)
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_short_uuids() {
        assert_eq!(
            uuid_from_u16(0x1810),
            Uuid::parse_str("00001810-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_eq!(
            uuid_from_u32(0xabcd1234),
            Uuid::parse_str("abcd1234-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn short_form_round_trip() {
        let uuid = uuid_from_u16(0x2a35);
        assert_eq!(uuid.to_ble_u16(), Some(0x2a35));
        assert_eq!(uuid_from_u16(uuid.to_ble_u16().unwrap()), uuid);

        let uuid = uuid_from_u32(0x12345678);
        assert_eq!(uuid.to_ble_u16(), None);
        assert_eq!(uuid_from_u32(uuid.to_ble_u32().unwrap()), uuid);
    }

    #[test]
    fn non_base_uuids_have_no_short_form() {
        let uuid = Uuid::parse_str("12345678-9000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid.to_ble_u16(), None);
        assert_eq!(uuid.to_ble_u32(), None);
        assert_eq!(Uuid::nil().to_ble_u16(), None);
    }

    #[test]
    fn short_string_forms() {
        assert_eq!(uuid_from_u16(0x1810).to_short_string(), "0x1810");
        assert_eq!(
            uuid_from_u32(0x11223344).to_short_string(),
            "0x11223344"
        );
        let long = "12345678-9000-1000-8000-00805f9b34fb";
        assert_eq!(
            Uuid::parse_str(long).unwrap().to_short_string(),
            long
        );
    }
}
