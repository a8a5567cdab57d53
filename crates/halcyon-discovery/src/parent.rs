//! Parent lookup with bounded retry
//!
//! During a hotplug storm a child can be announced before its parent is in
//! the store. The linker polls the store with exponential backoff until the
//! parent shows up or the deadline passes. During coldplug every device is
//! being probed anyway, so the timeout is zero and a final pass links the
//! stragglers.

use halcyon_core::{DeviceStore, PropertyBag, PropertyValue, Udi};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::identity::SYSFS_PATH_KEY;

/// How to find a device in the store: a key and the value it must hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMatch {
    pub key: String,
    pub value: PropertyValue,
}

impl PropertyMatch {
    pub fn new(key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Match on the canonical sysfs path
    pub fn sysfs_path(path: impl Into<String>) -> Self {
        let path: String = path.into();
        Self::new(SYSFS_PATH_KEY, path)
    }
}

/// Whether devices arrive in a bulk enumeration or one by one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Probe,
    Hotplug,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Total time a hotplugged child waits for its parent
    pub hotplug_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            hotplug_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParentLinker {
    store: Arc<DeviceStore>,
    config: BackoffConfig,
}

impl ParentLinker {
    pub fn new(store: Arc<DeviceStore>, config: BackoffConfig) -> Self {
        Self { store, config }
    }

    pub fn timeout_for(&self, mode: ResolveMode) -> Duration {
        match mode {
            ResolveMode::Probe => Duration::ZERO,
            ResolveMode::Hotplug => self.config.hotplug_timeout,
        }
    }

    pub async fn resolve(
        &self,
        child: &PropertyBag,
        lookup: &PropertyMatch,
        mode: ResolveMode,
    ) -> Option<Udi> {
        self.resolve_parent(child, lookup, self.timeout_for(mode))
            .await
    }

    /// Find the live device matching `lookup`, retrying until `timeout`.
    ///
    /// Returns `None` once the deadline has passed; the child is then left
    /// without a parent.
    pub async fn resolve_parent(
        &self,
        child: &PropertyBag,
        lookup: &PropertyMatch,
        timeout: Duration,
    ) -> Option<Udi> {
        let child_path = child.get_string(SYSFS_PATH_KEY).unwrap_or("<unknown>");
        let deadline = Instant::now() + timeout;
        let mut interval = self.config.initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(parent) = self
                .store
                .find_one_by_property(&lookup.key, &lookup.value)
                .await
            {
                debug!(child = child_path, parent = %parent.udi, attempts, "Parent found");
                return Some(parent.udi);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    child = child_path,
                    key = %lookup.key,
                    value = %lookup.value,
                    attempts,
                    "Parent not found"
                );
                return None;
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(self.config.max_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HUB_PATH: &str = "/sys/devices/pci0000:00/0000:00:14.0/usb1";

    fn linker(store: Arc<DeviceStore>) -> ParentLinker {
        ParentLinker::new(
            store,
            BackoffConfig {
                initial: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                hotplug_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn add_hub(store: &DeviceStore) {
        let mut hub = store.create_temporary();
        hub.set_property(SYSFS_PATH_KEY, HUB_PATH).unwrap();
        store.commit(hub, Udi::new("usb_1d6b_0002_0515_noserial")).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_already_present() {
        let store = Arc::new(DeviceStore::new());
        add_hub(&store).await;
        let parent = linker(store)
            .resolve(&PropertyBag::new(), &PropertyMatch::sysfs_path(HUB_PATH), ResolveMode::Probe)
            .await;
        assert_eq!(parent, Some(Udi::new("usb_1d6b_0002_0515_noserial")));
    }

    #[tokio::test]
    async fn test_probe_mode_does_not_wait() {
        let store = Arc::new(DeviceStore::new());
        let started = std::time::Instant::now();
        let parent = linker(store)
            .resolve(&PropertyBag::new(), &PropertyMatch::sysfs_path(HUB_PATH), ResolveMode::Probe)
            .await;
        assert!(parent.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_hotplug_waits_for_late_parent() {
        let store = Arc::new(DeviceStore::new());
        let late = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            add_hub(&late).await;
        });

        let parent = linker(store)
            .resolve(&PropertyBag::new(), &PropertyMatch::sysfs_path(HUB_PATH), ResolveMode::Hotplug)
            .await;
        assert_eq!(parent, Some(Udi::new("usb_1d6b_0002_0515_noserial")));
    }

    #[tokio::test]
    async fn test_gives_up_after_timeout() {
        let store = Arc::new(DeviceStore::new());
        let started = std::time::Instant::now();
        let parent = linker(store)
            .resolve_parent(
                &PropertyBag::new(),
                &PropertyMatch::sysfs_path(HUB_PATH),
                Duration::from_millis(60),
            )
            .await;
        assert!(parent.is_none());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_unplugged_parent_is_not_linked() {
        let store = Arc::new(DeviceStore::new());
        add_hub(&store).await;
        store.mark_unplugged("usb_1d6b_0002_0515_noserial").await.unwrap();
        let parent = linker(store)
            .resolve(&PropertyBag::new(), &PropertyMatch::sysfs_path(HUB_PATH), ResolveMode::Probe)
            .await;
        assert!(parent.is_none());
    }
}
