// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The declarative discovery layer: predicates over advertisements, composed
//! into criteria, paired with device descriptions.
//!
//! A [`DiscoveryCriteria`] is an ordered list of [`DescriptorAspect`]s; an
//! advertisement matches iff every aspect matches. The central manager
//! evaluates criteria in registration order against each admitted
//! advertisement, and the first match wins.

pub mod description;

pub use description::{CharacteristicDescription, DeviceDescription, ServiceDescription};

use crate::api::{AdvertisementData, ManufacturerIdentifier};
#[cfg(feature = "serde")]
use serde_cr as serde;
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use uuid::Uuid;

/// A pair of equal-length `data` and `mask` byte strings. A payload matches
/// if every bit set in the mask agrees between payload and `data`.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataDescriptor {
    data: Vec<u8>,
    mask: Vec<u8>,
}

impl DataDescriptor {
    /// Creates a descriptor. `data` and `mask` must be the same length.
    pub fn new(data: Vec<u8>, mask: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            mask.len(),
            "data and mask must be the same length"
        );
        DataDescriptor { data, mask }
    }

    /// A descriptor matching `data` exactly, byte for byte.
    pub fn equals(data: Vec<u8>) -> Self {
        let mask = vec![0xff; data.len()];
        DataDescriptor { data, mask }
    }

    /// Whether `payload` satisfies the descriptor. Payloads shorter than the
    /// mask never match; bytes beyond the mask are ignored.
    pub fn matches(&self, payload: &[u8]) -> bool {
        if payload.len() < self.mask.len() {
            return false;
        }
        self.mask
            .iter()
            .zip(self.data.iter())
            .zip(payload.iter())
            .all(|((mask, data), payload)| (payload ^ data) & mask == 0)
    }
}

/// One predicate of a discovery criteria.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorAspect {
    /// The advertised local name must contain the given substring. Falls
    /// back to the GAP device name only when the advertisement carries no
    /// local name; a stale GAP name never overrides an advertised one.
    NameSubstring(String),
    /// The advertisement must carry the service UUID, and its service data
    /// must satisfy the descriptor if one is given.
    Service {
        uuid: Uuid,
        service_data: Option<DataDescriptor>,
    },
    /// The advertisement must carry manufacturer data with this identifier,
    /// and the payload after the identifier must satisfy the descriptor if
    /// one is given.
    Manufacturer {
        identifier: ManufacturerIdentifier,
        manufacturer_data: Option<DataDescriptor>,
    },
    /// A range hint for the accessory-setup subsystem. Matches everything at
    /// runtime; forwarded verbatim when registering with the OS.
    BluetoothRange(u8),
    /// Accessory support options. Matches everything at runtime; forwarded
    /// verbatim when registering with the OS.
    SupportOptions(u32),
}

impl DescriptorAspect {
    /// Evaluates the aspect against a peripheral's GAP name (if known) and
    /// the received advertisement.
    pub fn matches(&self, gap_name: Option<&str>, advertisement: &AdvertisementData) -> bool {
        match self {
            DescriptorAspect::NameSubstring(substring) => {
                match (&advertisement.local_name, gap_name) {
                    (Some(local_name), _) => local_name.contains(substring.as_str()),
                    (None, Some(name)) => name.contains(substring.as_str()),
                    (None, None) => false,
                }
            }
            DescriptorAspect::Service { uuid, service_data } => {
                if !advertisement.advertises_service(*uuid) {
                    return false;
                }
                match service_data {
                    None => true,
                    Some(descriptor) => advertisement
                        .service_data
                        .get(uuid)
                        .is_some_and(|payload| descriptor.matches(payload)),
                }
            }
            DescriptorAspect::Manufacturer {
                identifier,
                manufacturer_data,
            } => {
                if advertisement.manufacturer_identifier() != Some(*identifier) {
                    return false;
                }
                match manufacturer_data {
                    None => true,
                    Some(descriptor) => advertisement
                        .manufacturer_payload()
                        .is_some_and(|payload| descriptor.matches(payload)),
                }
            }
            DescriptorAspect::BluetoothRange(_) | DescriptorAspect::SupportOptions(_) => true,
        }
    }
}

/// A conjunction of aspects describing one kind of peripheral.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DiscoveryCriteria {
    pub aspects: Vec<DescriptorAspect>,
}

impl DiscoveryCriteria {
    pub fn new(aspects: Vec<DescriptorAspect>) -> Self {
        DiscoveryCriteria { aspects }
    }

    /// Criteria matching peripherals that advertise the given service.
    pub fn advertising_service(uuid: Uuid) -> Self {
        DiscoveryCriteria {
            aspects: vec![DescriptorAspect::Service {
                uuid,
                service_data: None,
            }],
        }
    }

    /// Criteria matching peripherals with the given manufacturer identifier.
    pub fn manufacturer(identifier: ManufacturerIdentifier) -> Self {
        DiscoveryCriteria {
            aspects: vec![DescriptorAspect::Manufacturer {
                identifier,
                manufacturer_data: None,
            }],
        }
    }

    /// Appends a name-substring aspect.
    pub fn and_name_substring(mut self, substring: impl Into<String>) -> Self {
        self.aspects
            .push(DescriptorAspect::NameSubstring(substring.into()));
        self
    }

    /// Appends an arbitrary aspect.
    pub fn and(mut self, aspect: DescriptorAspect) -> Self {
        self.aspects.push(aspect);
        self
    }

    /// Whether every aspect matches the advertisement.
    pub fn matches(&self, gap_name: Option<&str>, advertisement: &AdvertisementData) -> bool {
        self.aspects
            .iter()
            .all(|aspect| aspect.matches(gap_name, advertisement))
    }

    /// The service UUIDs appearing in service aspects, used to restrict scan
    /// filters.
    pub fn discovery_ids(&self) -> Vec<Uuid> {
        self.aspects
            .iter()
            .filter_map(|aspect| match aspect {
                DescriptorAspect::Service { uuid, .. } => Some(*uuid),
                _ => None,
            })
            .collect()
    }
}

/// A discovery criteria paired with the description of the device to set up
/// once a peripheral matches. Identity is the criteria: two descriptions
/// with the same criteria are the same registration.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone)]
pub struct DiscoveryDescription {
    pub criteria: DiscoveryCriteria,
    pub device: DeviceDescription,
}

impl DiscoveryDescription {
    pub fn new(criteria: DiscoveryCriteria, device: DeviceDescription) -> Self {
        DiscoveryDescription { criteria, device }
    }

    /// Pairs the criteria with a device description that discovers every
    /// service and characteristic.
    pub fn discover_all(criteria: DiscoveryCriteria) -> Self {
        DiscoveryDescription {
            criteria,
            device: DeviceDescription::discover_all(),
        }
    }
}

impl PartialEq for DiscoveryDescription {
    fn eq(&self, other: &Self) -> bool {
        self.criteria == other.criteria
    }
}

impl Eq for DiscoveryDescription {}

impl std::hash::Hash for DiscoveryDescription {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.criteria.hash(state);
    }
}
