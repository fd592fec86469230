//! The single active link and the attribute index into its service tree.
//!
//! The service list and both indexes are only ever rebuilt together, so a
//! handle or UUID found in the index always points into the current tree.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::ble::attributes::{GattCharacteristic, GattService};
use crate::platform::{AttributeHandle, LinkId, RawService};

/// Where a characteristic lives in the tree.
#[derive(Debug, Clone)]
struct CharacteristicSlot {
    handle: AttributeHandle,
    service: usize,
    index: usize,
    descriptors: HashMap<Uuid, AttributeHandle>,
}

#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) id: LinkId,
    pub(crate) address: String,
    services: Vec<Arc<GattService>>,
    by_uuid: HashMap<Uuid, CharacteristicSlot>,
    /// Characteristic UUID by handle, for pushed values.
    by_handle: HashMap<AttributeHandle, Uuid>,
}

impl Link {
    pub(crate) fn new(id: LinkId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            services: Vec::new(),
            by_uuid: HashMap::new(),
            by_handle: HashMap::new(),
        }
    }

    pub(crate) fn services(&self) -> &[Arc<GattService>] {
        &self.services
    }

    /// Replace the whole tree with a fresh discovery result. Cached values
    /// from the previous pass are dropped.
    pub(crate) fn replace_services(&mut self, raw: &[RawService]) {
        let mut by_uuid = HashMap::new();
        let mut by_handle = HashMap::new();

        for (service, raw_service) in raw.iter().enumerate() {
            for (index, raw_char) in raw_service.characteristics.iter().enumerate() {
                // The first occurrence of a UUID is the one requests resolve to
                if by_uuid.contains_key(&raw_char.uuid) {
                    continue;
                }

                let mut descriptors = HashMap::new();
                for raw_desc in &raw_char.descriptors {
                    descriptors.entry(raw_desc.uuid).or_insert(raw_desc.handle);
                }

                by_handle.insert(raw_char.handle, raw_char.uuid);
                by_uuid.insert(
                    raw_char.uuid,
                    CharacteristicSlot {
                        handle: raw_char.handle,
                        service,
                        index,
                        descriptors,
                    },
                );
            }
        }

        self.services = raw
            .iter()
            .map(|s| Arc::new(GattService::from_raw(s)))
            .collect();
        self.by_uuid = by_uuid;
        self.by_handle = by_handle;
    }

    /// Look up a characteristic and its handle.
    pub(crate) fn characteristic(
        &self,
        uuid: &Uuid,
    ) -> Option<(AttributeHandle, &Arc<GattCharacteristic>)> {
        let slot = self.by_uuid.get(uuid)?;
        let characteristic = self
            .services
            .get(slot.service)?
            .characteristics
            .get(slot.index)?;
        Some((slot.handle, characteristic))
    }

    /// Look up the handle of a descriptor under a characteristic.
    pub(crate) fn descriptor_handle(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
    ) -> Option<AttributeHandle> {
        self.by_uuid
            .get(characteristic)?
            .descriptors
            .get(descriptor)
            .copied()
    }

    /// UUID of the characteristic behind a platform handle.
    pub(crate) fn characteristic_at(&self, handle: AttributeHandle) -> Option<Uuid> {
        self.by_handle.get(&handle).copied()
    }

    /// Cache a new value on a characteristic. Only the path from the root to
    /// that characteristic is reallocated.
    pub(crate) fn update_characteristic(&mut self, uuid: &Uuid, value: Bytes) -> bool {
        let Some(slot) = self.by_uuid.get(uuid) else {
            return false;
        };
        let (service, index) = (slot.service, slot.index);

        self.replace_characteristic(service, index, |c| c.with_value(value))
    }

    /// Cache a new value on a descriptor.
    pub(crate) fn update_descriptor(
        &mut self,
        characteristic: &Uuid,
        descriptor: &Uuid,
        value: Bytes,
    ) -> bool {
        let Some(slot) = self.by_uuid.get(characteristic) else {
            return false;
        };
        let (service, index) = (slot.service, slot.index);

        let Some(position) = self
            .services
            .get(service)
            .and_then(|s| s.characteristics.get(index))
            .and_then(|c| c.descriptors.iter().position(|d| d.uuid == *descriptor))
        else {
            return false;
        };

        self.replace_characteristic(service, index, |c| {
            let mut updated = c.clone();
            updated.descriptors[position] = Arc::new(c.descriptors[position].with_value(value));
            updated
        })
    }

    fn replace_characteristic(
        &mut self,
        service: usize,
        index: usize,
        f: impl FnOnce(&GattCharacteristic) -> GattCharacteristic,
    ) -> bool {
        let Some(old_service) = self.services.get(service) else {
            return false;
        };
        let Some(old_char) = old_service.characteristics.get(index) else {
            return false;
        };

        let new_char = Arc::new(f(old_char));
        let mut new_service = GattService::clone(old_service);
        new_service.characteristics[index] = new_char;
        self.services[service] = Arc::new(new_service);
        true
    }
}
