use std::collections::{BTreeMap, HashMap};

use super::device::Device;
use crate::bus::ObjectPath;

/// Device mirrors keyed by object path, with an address index.
///
/// Both maps always hold the same set of devices.
#[derive(Default)]
pub(in crate) struct Registry {
    devices: BTreeMap<ObjectPath, Device>,
    addresses: HashMap<String, ObjectPath>,
}

impl Registry {
    /// Inserts `device` unless its path is already present. Returns whether it was inserted.
    ///
    /// A device reusing a known address under a new path replaces the stale entry, which is
    /// returned through `replaced`.
    pub fn insert(&mut self, device: Device, replaced: &mut Option<Device>) -> bool {
        if self.devices.contains_key(device.path()) {
            return false;
        }
        if let Some(old) = self.addresses.get(device.address()).cloned() {
            *replaced = self.remove_by_path(&old);
        }
        self.addresses.insert(device.address().to_owned(), device.path().clone());
        self.devices.insert(device.path().clone(), device);
        true
    }

    pub fn by_address(&self, address: &str) -> Option<&Device> {
        self.addresses.get(address).and_then(|p| self.devices.get(p))
    }

    pub fn by_path(&self, path: &ObjectPath) -> Option<&Device> {
        self.devices.get(path)
    }

    pub fn contains_path(&self, path: &ObjectPath) -> bool {
        self.devices.contains_key(path)
    }

    pub fn remove_by_path(&mut self, path: &ObjectPath) -> Option<Device> {
        let device = self.devices.remove(path)?;
        self.addresses.remove(device.address());
        Some(device)
    }

    pub fn remove_by_address(&mut self, address: &str) -> Option<Device> {
        let path = self.addresses.get(address)?.clone();
        self.remove_by_path(&path)
    }

    /// The device owning the object at `path`, which is either the device itself or an object
    /// nested under it.
    pub fn owner_of(&self, path: &ObjectPath) -> Option<&Device> {
        self.devices.get(path)
            .or_else(|| self.devices.values().find(|d| path.is_descendant_of(d.path())))
    }

    pub fn all(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Empties the registry, handing the devices back so they can be dropped unlocked.
    pub fn clear(&mut self) -> Vec<Device> {
        self.addresses.clear();
        std::mem::take(&mut self.devices).into_iter().map(|(_, d)| d).collect()
    }
}
