//! # Device Registry
//!
//! Paired and discovered device sets with a live view for any number of
//! readers. The discovery pipeline is the only writer.

use tokio::sync::watch;
use tracing::debug;

use crate::device::{Device, DeviceSet};

/// Deduplicated paired/discovered device sets
#[derive(Debug)]
pub struct DeviceRegistry {
    paired: watch::Sender<DeviceSet>,
    discovered: watch::Sender<DeviceSet>,
}

/// Live, restartable view of both registry sets
#[derive(Debug, Clone)]
pub struct RegistryWatch {
    pub paired: watch::Receiver<DeviceSet>,
    pub discovered: watch::Receiver<DeviceSet>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (paired, _) = watch::channel(DeviceSet::new());
        let (discovered, _) = watch::channel(DeviceSet::new());
        Self { paired, discovered }
    }

    /// Replace the paired set with a platform snapshot
    pub fn record_paired<I: IntoIterator<Item = Device>>(&self, devices: I) {
        let set = DeviceSet::from_devices(devices);
        debug!("Paired devices: {}", set.len());
        self.paired.send_if_modified(|current| {
            if *current == set {
                false
            } else {
                *current = set;
                true
            }
        });
    }

    /// Add a found device, or refresh its name if the address is known
    pub fn record_discovered(&self, device: Device) {
        self.discovered.send_if_modified(|set| set.upsert(device));
    }

    /// Forget every discovered device (scan restart)
    pub fn clear_discovered(&self) {
        self.discovered.send_if_modified(|set| {
            if set.is_empty() {
                false
            } else {
                set.clear();
                true
            }
        });
    }

    pub fn paired(&self) -> DeviceSet {
        self.paired.borrow().clone()
    }

    pub fn discovered(&self) -> DeviceSet {
        self.discovered.borrow().clone()
    }

    /// Look a device up by address, discovered entries first
    pub fn find(&self, address: &str) -> Option<Device> {
        if let Some(device) = self.discovered.borrow().get(address) {
            return Some(device.clone());
        }
        self.paired.borrow().get(address).cloned()
    }

    pub fn subscribe(&self) -> RegistryWatch {
        RegistryWatch {
            paired: self.paired.subscribe(),
            discovered: self.discovered.subscribe(),
        }
    }
}
