// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Payloads of the Device Information service. The string characteristics
//! (manufacturer name, model number, …) decode through the plain `String`
//! codec impl; the PnP ID has its own layout.

use crate::api::bleuuid::uuid_from_u16;
use crate::codec::{ByteDecode, ByteEncode, Endianness};
use uuid::Uuid;

/// The Device Information service.
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid_from_u16(0x180a);
pub const MANUFACTURER_NAME_STRING: Uuid = uuid_from_u16(0x2a29);
pub const MODEL_NUMBER_STRING: Uuid = uuid_from_u16(0x2a24);
pub const SERIAL_NUMBER_STRING: Uuid = uuid_from_u16(0x2a25);
pub const HARDWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a27);
pub const FIRMWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a26);
pub const SOFTWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a28);
/// The PnP ID characteristic.
pub const PNP_ID: Uuid = uuid_from_u16(0x2a50);

/// The registry that assigned a vendor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorIdSource {
    /// Assigned by the Bluetooth SIG.
    BluetoothSig,
    /// Assigned by the USB Implementers Forum.
    UsbForum,
    /// A reserved source value, preserved verbatim.
    Reserved(u8),
}

impl VendorIdSource {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => VendorIdSource::BluetoothSig,
            2 => VendorIdSource::UsbForum,
            other => VendorIdSource::Reserved(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            VendorIdSource::BluetoothSig => 1,
            VendorIdSource::UsbForum => 2,
            VendorIdSource::Reserved(other) => other,
        }
    }
}

/// The PnP ID characteristic value: vendor/product identity of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PnpId {
    pub vendor_id_source: VendorIdSource,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_version: u16,
}

impl ByteDecode for PnpId {
    fn decode(bytes: &mut &[u8], endianness: Endianness) -> Option<Self> {
        Some(PnpId {
            vendor_id_source: VendorIdSource::from_u8(u8::decode(bytes, endianness)?),
            vendor_id: u16::decode(bytes, endianness)?,
            product_id: u16::decode(bytes, endianness)?,
            product_version: u16::decode(bytes, endianness)?,
        })
    }
}

impl ByteEncode for PnpId {
    fn encode(&self, out: &mut Vec<u8>, endianness: Endianness) {
        self.vendor_id_source.to_u8().encode(out, endianness);
        self.vendor_id.encode(out, endianness);
        self.product_id.encode(out, endianness);
        self.product_version.encode(out, endianness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_value, encode_value};

    #[test]
    fn pnp_id_round_trip() {
        let pnp = PnpId {
            vendor_id_source: VendorIdSource::UsbForum,
            vendor_id: 0x05ac,
            product_id: 0x1234,
            product_version: 0x0102,
        };
        let encoded = encode_value(&pnp);
        assert_eq!(encoded, vec![0x02, 0xac, 0x05, 0x34, 0x12, 0x02, 0x01]);
        assert_eq!(decode_value::<PnpId>(&encoded), Some(pnp));
    }

    #[test]
    fn reserved_vendor_id_source_survives() {
        let pnp = PnpId {
            vendor_id_source: VendorIdSource::Reserved(0x7f),
            vendor_id: 1,
            product_id: 2,
            product_version: 3,
        };
        let encoded = encode_value(&pnp);
        assert_eq!(decode_value::<PnpId>(&encoded), Some(pnp));
    }

    #[test]
    fn short_payload_fails() {
        assert_eq!(decode_value::<PnpId>(&[0x01, 0xac, 0x05]), None);
    }
}
