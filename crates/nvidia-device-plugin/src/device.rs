//! Device model.
//!
//! The set of GPUs is discovered once at startup and never resized. Only the
//! health of individual devices changes, and only from healthy to unhealthy.

use std::slice;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use derive_more::Display;

/// Health of a single device as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

#[derive(Debug)]
struct DeviceState {
    id: String,
    unhealthy: AtomicBool,
}

/// Handle to one device. Clones share the same health state.
#[derive(Debug, Clone)]
pub struct Device(Arc<DeviceState>);

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::new(DeviceState {
            id: id.into(),
            unhealthy: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn health(&self) -> Health {
        if self.0.unhealthy.load(Ordering::Acquire) {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }

    /// Marks the device unhealthy.
    ///
    /// Returns `true` only for the call that performed the transition, so
    /// repeated fault events for the same device are no-ops. There is no way
    /// back to [`Health::Healthy`].
    pub fn mark_unhealthy(&self) -> bool {
        !self.0.unhealthy.swap(true, Ordering::AcqRel)
    }
}

/// Ordered, fixed-size collection of the devices this plugin advertises.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    devices: Arc<[Device]>,
}

impl DeviceSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: ids.into_iter().map(Device::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|d| d.id().to_string()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&Device> {
        self.iter().find(|d| d.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Returns the first id in `requested` that is not part of this set.
    pub fn first_unknown<'a>(&self, requested: &'a [String]) -> Option<&'a str> {
        requested
            .iter()
            .map(String::as_str)
            .find(|id| !self.contains(id))
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn new_devices_are_healthy_and_keep_order() {
        let devices = DeviceSet::new(["GPU-0", "GPU-1", "GPU-2"]);

        assert_eq!(devices.len(), 3);
        assert_eq!(devices.ids(), vec!["GPU-0", "GPU-1", "GPU-2"]);
        assert!(devices.iter().all(|d| d.health() == Health::Healthy));
    }

    #[test]
    fn mark_unhealthy_is_one_way_and_idempotent() {
        let devices = DeviceSet::new(["GPU-0"]);
        let device = devices.find("GPU-0").expect("device exists");

        assert!(device.mark_unhealthy());
        assert!(!device.mark_unhealthy());
        assert_eq!(device.health(), Health::Unhealthy);
    }

    #[test]
    fn clones_share_health_state() {
        let devices = DeviceSet::new(["GPU-0", "GPU-1"]);
        let handle = devices.find("GPU-1").cloned().expect("device exists");

        handle.mark_unhealthy();

        let healths: Vec<_> = devices.iter().map(Device::health).collect();
        assert_eq!(healths, vec![Health::Healthy, Health::Unhealthy]);
    }

    #[test]
    fn first_unknown_reports_earliest_missing_id() {
        let devices = DeviceSet::new(["GPU-0", "GPU-1"]);
        let requested = vec![
            "GPU-1".to_string(),
            "GPU-7".to_string(),
            "GPU-9".to_string(),
        ];

        assert_eq!(devices.first_unknown(&requested), Some("GPU-7"));
        assert_eq!(devices.first_unknown(&requested[..1]), None);
        assert_eq!(devices.first_unknown(&[]), None);
    }

    #[test]
    fn health_displays_wire_strings() {
        assert_eq!(Health::Healthy.to_string(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }
}
