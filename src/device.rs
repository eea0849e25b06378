//! # Device Model
//!
//! Remote device identity and the insertion-ordered, address-deduplicated
//! set used for both the paired and the discovered device lists.

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Placeholder shown for devices that did not report a name
pub const UNNAMED_DEVICE: &str = "(No name)";

/// A remote Bluetooth serial device
///
/// Equality and hashing use the address only; the name is display data.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub name: Option<String>,
    pub address: String,
}

impl Device {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            name,
            address: address.into(),
        }
    }

    /// Convenience constructor for a named device
    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(address, Some(name.into()))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_DEVICE)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.display_name(), self.address)
    }
}

/// Ordered set of devices keyed by address
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a snapshot; later duplicates refresh the earlier name.
    pub fn from_devices<I: IntoIterator<Item = Device>>(devices: I) -> Self {
        let mut set = Self::new();
        for device in devices {
            set.upsert(device);
        }
        set
    }

    /// Insert a device, or update the name of an existing entry in place.
    ///
    /// Returns `true` if the set changed. A missing name never overwrites a
    /// known one.
    pub fn upsert(&mut self, device: Device) -> bool {
        match self.devices.iter_mut().find(|d| d.address == device.address) {
            Some(existing) => {
                if device.name.is_some() && existing.name != device.name {
                    existing.name = device.name;
                    true
                } else {
                    false
                }
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn as_slice(&self) -> &[Device] {
        &self.devices
    }
}

// Snapshots differ when a name changes, so compare names as well as order.
impl PartialEq for DeviceSet {
    fn eq(&self, other: &Self) -> bool {
        self.devices.len() == other.devices.len()
            && self
                .devices
                .iter()
                .zip(&other.devices)
                .all(|(a, b)| a.address == b.address && a.name == b.name)
    }
}

impl Eq for DeviceSet {}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

impl FromIterator<Device> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        Self::from_devices(iter)
    }
}
