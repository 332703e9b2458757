//! Discovery Module
//!
//! Remotes seen during discovery, deduplicated by transport address.
//! Readers get an immutable snapshot; every change replaces the whole list.

use crate::domain::models::DiscoveredDevice;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub type DiscoverySnapshot = Arc<Vec<DiscoveredDevice>>;

pub struct DiscoveryList {
    devices: watch::Sender<DiscoverySnapshot>,
}

impl DiscoveryList {
    pub fn new() -> Self {
        let (devices, _) = watch::channel(Arc::new(Vec::new()));
        Self { devices }
    }

    /// Adds a device or refreshes the name and signal of a known address.
    /// Returns true when the address was not listed before.
    pub fn insert(&self, device: DiscoveredDevice) -> bool {
        let current = self.snapshot();
        let mut next: Vec<DiscoveredDevice> = current.as_ref().clone();

        let is_new = match next.iter_mut().find(|d| d.address == device.address) {
            Some(existing) => {
                if !device.name.is_empty() {
                    existing.name = device.name;
                }
                if device.signal_strength.is_some() {
                    existing.signal_strength = device.signal_strength;
                }
                false
            }
            None => {
                debug!("Discovered {} ({})", device.name, device.address);
                next.push(device);
                true
            }
        };

        self.devices.send_replace(Arc::new(next));
        is_new
    }

    pub fn clear(&self) {
        self.devices.send_replace(Arc::new(Vec::new()));
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        self.devices.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoverySnapshot> {
        self.devices.subscribe()
    }
}

impl Default for DiscoveryList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TransportAddress;

    fn found(number: u32, name: &str, rssi: Option<i16>) -> DiscoveredDevice {
        DiscoveredDevice {
            address: TransportAddress::Ant(number),
            name: name.to_string(),
            signal_strength: rssi,
        }
    }

    #[test]
    fn test_dedupes_by_address() {
        let list = DiscoveryList::new();
        assert!(list.insert(found(1, "Remote", Some(-70))));
        assert!(list.insert(found(2, "Other", None)));
        assert!(!list.insert(found(1, "", Some(-55))));

        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "Remote");
        assert_eq!(snapshot[0].signal_strength, Some(-55));
    }

    #[test]
    fn test_snapshots_are_not_mutated_in_place() {
        let list = DiscoveryList::new();
        list.insert(found(1, "Remote", None));
        let before = list.snapshot();

        list.clear();
        assert_eq!(before.len(), 1);
        assert!(list.snapshot().is_empty());
    }

    #[test]
    fn test_subscribers_see_replacements() {
        let list = DiscoveryList::new();
        let mut rx = list.subscribe();
        list.insert(found(3, "Remote", None));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}
