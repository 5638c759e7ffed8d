// bluekit Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Descriptions of the GATT surface to set up on a matched peripheral: which
//! services to discover, which characteristics within them, and how to treat
//! each characteristic once found. `None` consistently means "discover
//! everything".

#[cfg(feature = "serde")]
use serde_cr as serde;
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How one characteristic should be handled after discovery.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescription {
    pub uuid: Uuid,
    /// Whether to discover the characteristic's descriptors.
    pub discover_descriptors: bool,
    /// Whether to read the value right after discovery, when the
    /// characteristic is readable.
    pub auto_read: bool,
}

impl CharacteristicDescription {
    pub fn new(uuid: Uuid) -> Self {
        CharacteristicDescription {
            uuid,
            discover_descriptors: false,
            auto_read: true,
        }
    }

    pub fn without_auto_read(mut self) -> Self {
        self.auto_read = false;
        self
    }

    pub fn with_descriptors(mut self) -> Self {
        self.discover_descriptors = true;
        self
    }
}

/// Which characteristics of one service to discover. `characteristics: None`
/// discovers all of them.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescription {
    pub uuid: Uuid,
    pub characteristics: Option<HashMap<Uuid, CharacteristicDescription>>,
}

impl ServiceDescription {
    /// Discover every characteristic of the service.
    pub fn discover_all(uuid: Uuid) -> Self {
        ServiceDescription {
            uuid,
            characteristics: None,
        }
    }

    pub fn with_characteristics(
        uuid: Uuid,
        characteristics: impl IntoIterator<Item = CharacteristicDescription>,
    ) -> Self {
        ServiceDescription {
            uuid,
            characteristics: Some(
                characteristics
                    .into_iter()
                    .map(|description| (description.uuid, description))
                    .collect(),
            ),
        }
    }

    /// The description for one characteristic, if it is part of this service
    /// description.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescription> {
        self.characteristics.as_ref()?.get(&uuid)
    }

    /// The characteristic UUIDs to discover; `None` means all.
    pub fn characteristic_ids(&self) -> Option<Vec<Uuid>> {
        self.characteristics
            .as_ref()
            .map(|characteristics| characteristics.keys().copied().collect())
    }
}

/// Which services of a device to discover. `services: None` discovers all of
/// them.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescription {
    pub services: Option<HashMap<Uuid, ServiceDescription>>,
}

impl DeviceDescription {
    /// Discover every service and characteristic.
    pub fn discover_all() -> Self {
        DeviceDescription { services: None }
    }

    pub fn with_services(services: impl IntoIterator<Item = ServiceDescription>) -> Self {
        DeviceDescription {
            services: Some(
                services
                    .into_iter()
                    .map(|description| (description.uuid, description))
                    .collect(),
            ),
        }
    }

    /// The description for one service, if it is named.
    pub fn service(&self, uuid: Uuid) -> Option<&ServiceDescription> {
        self.services.as_ref()?.get(&uuid)
    }

    /// The service UUIDs to discover; `None` means all.
    pub fn service_ids(&self) -> Option<Vec<Uuid>> {
        self.services
            .as_ref()
            .map(|services| services.keys().copied().collect())
    }

    /// The description for one characteristic, reached through its service.
    pub fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<&CharacteristicDescription> {
        self.service(service)?.characteristic(characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    #[test]
    fn discover_all_has_no_ids() {
        let description = DeviceDescription::discover_all();
        assert_eq!(description.service_ids(), None);
        assert_eq!(description.service(uuid_from_u16(0x1810)), None);
    }

    #[test]
    fn scoped_description_lookups() {
        let service = uuid_from_u16(0x1810);
        let characteristic = uuid_from_u16(0x2a35);
        let description = DeviceDescription::with_services(vec![
            ServiceDescription::with_characteristics(
                service,
                vec![CharacteristicDescription::new(characteristic).without_auto_read()],
            ),
            ServiceDescription::discover_all(uuid_from_u16(0x180a)),
        ]);

        let ids = description.service_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&service));

        let found = description.characteristic(service, characteristic).unwrap();
        assert!(!found.auto_read);
        assert!(!found.discover_descriptors);

        // a discover-all service names no characteristic ids
        assert_eq!(
            description.service(uuid_from_u16(0x180a)).unwrap().characteristic_ids(),
            None
        );
    }
}
