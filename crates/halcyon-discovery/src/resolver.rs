//! Identity resolution
//!
//! Turns a temporary device into a committed one. The base candidate UDI comes
//! from the bus identity rule; when it is taken by a different live device the
//! resolver walks `base-1`, `base-2`, … until it finds either the same device
//! (a duplicate probe), an unplugged record to re-match, or a free slot. The
//! walk is bounded by the number of devices in the store, so it always ends.

use halcyon_core::{Device, DeviceState, DeviceStore, StoreError, TemporaryDevice, Udi};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::{IdentityError, IdentityRule};
use crate::locks::KeyedLocks;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no free UDI for {base} after {attempts} attempts")]
    IdentityExhausted { base: Udi, attempts: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no identity rule for bus {0}")]
    UnknownBus(String),
}

/// Outcome of resolving one temporary device
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Registered under a new UDI
    Committed(Device),
    /// Merged into the unplugged record of a device seen before
    Rematched(Device),
    /// Already registered and live; the temporary device was discarded
    Duplicate { existing: Udi },
}

impl Resolution {
    pub fn udi(&self) -> &Udi {
        match self {
            Resolution::Committed(device) | Resolution::Rematched(device) => &device.udi,
            Resolution::Duplicate { existing } => existing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Hard cap on candidate UDIs tried for one device
    pub max_attempts: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_attempts: 256 }
    }
}

#[derive(Debug)]
pub struct IdentityResolver {
    store: Arc<DeviceStore>,
    locks: KeyedLocks,
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(store: Arc<DeviceStore>, config: ResolverConfig) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Number of candidate UDIs currently being resolved or waited on
    pub fn active_locks(&self) -> usize {
        self.locks.active_keys()
    }

    /// Resolve `temp` to a UDI and commit or merge it.
    ///
    /// New devices are committed in `state`. Resolutions sharing a base
    /// candidate run one at a time; others proceed in parallel.
    pub async fn resolve(
        &self,
        mut temp: TemporaryDevice,
        rule: &dyn IdentityRule,
        state: DeviceState,
    ) -> Result<Resolution, ResolveError> {
        let base = rule.candidate_udi(temp.properties())?;
        let _guard = self.locks.lock(base.as_str()).await;

        let bound = (self.store.len().await + 1).min(self.config.max_attempts.max(1));
        let match_keys = rule.match_keys();
        temp.set_persistent(temp.is_persistent() && rule.persistent());

        for attempt in 0..bound {
            let udi = if attempt == 0 {
                base.clone()
            } else {
                base.with_suffix(attempt)
            };

            match self.store.find_by_udi(udi.as_str()).await {
                None => {
                    let device = self.store.commit_with_state(temp, udi, state).await?;
                    return Ok(Resolution::Committed(device));
                }
                Some(existing) if existing.state == DeviceState::Unplugged => {
                    let device = self
                        .store
                        .rematch(udi.as_str(), temp, &rule.merge_namespaces())
                        .await?;
                    return Ok(Resolution::Rematched(device));
                }
                Some(existing) => {
                    if !match_keys.is_empty()
                        && existing.properties.matches(temp.properties(), &match_keys)
                    {
                        info!(udi = %udi, temp = temp.id(), "Device already present, dropping duplicate probe");
                        self.store.touch(udi.as_str()).await?;
                        return Ok(Resolution::Duplicate { existing: udi });
                    }
                    debug!(udi = %udi, "Candidate UDI held by another device");
                }
            }
        }

        warn!(base = %base, attempts = bound, "Gave up looking for a free UDI");
        Err(ResolveError::IdentityExhausted {
            base,
            attempts: bound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{UsbDeviceIdentity, SYSFS_PATH_KEY};
    use std::time::Duration;

    fn stick(store: &DeviceStore, path: &str) -> TemporaryDevice {
        let mut temp = store.create_temporary();
        temp.set_property("usb.vendor_id", 0x0781).unwrap();
        temp.set_property("usb.product_id", 0x5567).unwrap();
        temp.set_property("usb.device_revision_bcd", 0x0100).unwrap();
        temp.set_property(SYSFS_PATH_KEY, path).unwrap();
        temp
    }

    fn resolver(store: &Arc<DeviceStore>, max_attempts: usize) -> IdentityResolver {
        IdentityResolver::new(store.clone(), ResolverConfig { max_attempts })
    }

    async fn resolve(resolver: &IdentityResolver, temp: TemporaryDevice) -> Resolution {
        resolver
            .resolve(temp, &UsbDeviceIdentity, DeviceState::Disabled)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_disambiguation_and_replug() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);

        let first = resolve(&resolver, stick(&store, "/sys/devices/usb1/1-1")).await;
        assert!(matches!(first, Resolution::Committed(_)));
        assert_eq!(first.udi().as_str(), "usb_0781_5567_0100_noserial");

        let second = resolve(&resolver, stick(&store, "/sys/devices/usb1/1-2")).await;
        assert!(matches!(second, Resolution::Committed(_)));
        assert_eq!(second.udi().as_str(), "usb_0781_5567_0100_noserial-1");

        let again = resolve(&resolver, stick(&store, "/sys/devices/usb1/1-1")).await;
        assert!(matches!(again, Resolution::Duplicate { .. }));
        assert_eq!(again.udi().as_str(), "usb_0781_5567_0100_noserial");
        assert_eq!(store.len().await, 2);

        store
            .set_property("usb_0781_5567_0100_noserial", "info.label", "backup")
            .await
            .unwrap();
        store.mark_unplugged("usb_0781_5567_0100_noserial").await.unwrap();

        let back = resolve(&resolver, stick(&store, "/sys/devices/usb2/2-3")).await;
        let Resolution::Rematched(device) = back else {
            panic!("expected re-match, got {:?}", back);
        };
        assert_eq!(device.udi.as_str(), "usb_0781_5567_0100_noserial");
        assert_eq!(device.state, DeviceState::Disabled);
        assert_eq!(device.properties.get_string("info.label"), Some("backup"));
        assert_eq!(
            device.properties.get_string(SYSFS_PATH_KEY),
            Some("/sys/devices/usb2/2-3")
        );
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_search_is_bounded() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 2);

        resolve(&resolver, stick(&store, "/sys/devices/usb1/1-1")).await;
        resolve(&resolver, stick(&store, "/sys/devices/usb1/1-2")).await;
        let third = resolver
            .resolve(
                stick(&store, "/sys/devices/usb1/1-3"),
                &UsbDeviceIdentity,
                DeviceState::Disabled,
            )
            .await;
        assert!(matches!(
            third,
            Err(ResolveError::IdentityExhausted { attempts: 2, .. })
        ));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);
        let mut temp = store.create_temporary();
        temp.set_property("usb.vendor_id", 0x0781).unwrap();

        let result = resolver
            .resolve(temp, &UsbDeviceIdentity, DeviceState::Disabled)
            .await;
        assert!(matches!(result, Err(ResolveError::Identity(_))));
        assert!(store.is_empty().await);
    }

    #[derive(Debug)]
    struct NoMatchKeys;

    impl IdentityRule for NoMatchKeys {
        fn bus(&self) -> &str {
            "usb"
        }

        fn candidate_udi(&self, properties: &halcyon_core::PropertyBag) -> Result<Udi, IdentityError> {
            UsbDeviceIdentity.candidate_udi(properties)
        }

        fn match_keys(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_empty_match_keys_never_duplicate() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);

        for _ in 0..2 {
            resolver
                .resolve(stick(&store, "/sys/devices/usb1/1-1"), &NoMatchKeys, DeviceState::Disabled)
                .await
                .unwrap();
        }
        assert!(store.find_by_udi("usb_0781_5567_0100_noserial-1").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_identical_devices_get_unique_udis() {
        let store = Arc::new(DeviceStore::new());
        let resolver = Arc::new(resolver(&store, 256));

        let mut tasks = Vec::new();
        for port in 0..8 {
            let store = store.clone();
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                let temp = stick(&store, &format!("/sys/devices/usb1/1-{}", port));
                resolve(&resolver, temp).await.udi().clone()
            }));
        }

        let mut udis = Vec::new();
        for task in tasks {
            udis.push(task.await.unwrap());
        }
        udis.sort();
        udis.dedup();
        assert_eq!(udis.len(), 8);
        assert_eq!(store.live_count().await, 8);
        assert!(udis.contains(&Udi::new("usb_0781_5567_0100_noserial")));
        assert!(udis.contains(&Udi::new("usb_0781_5567_0100_noserial-7")));
    }

    #[tokio::test]
    async fn test_unrelated_devices_resolve_in_parallel() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);

        let _held = resolver.locks.lock("usb_0781_5567_0100_noserial").await;

        let mut other = stick(&store, "/sys/devices/usb1/1-4");
        other.set_property("usb.serial", "AA01").unwrap();
        let resolved = tokio::time::timeout(Duration::from_secs(1), resolve(&resolver, other)).await;
        assert_eq!(
            resolved.unwrap().udi().as_str(),
            "usb_0781_5567_0100_AA01"
        );
    }

    #[tokio::test]
    async fn test_dropped_resolution_commits_nothing() {
        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);

        let held = resolver.locks.lock("usb_0781_5567_0100_noserial").await;
        let waiting = tokio::time::timeout(
            Duration::from_millis(20),
            resolve(&resolver, stick(&store, "/sys/devices/usb1/1-1")),
        )
        .await;
        assert!(waiting.is_err());
        drop(held);

        assert!(store.is_empty().await);
        assert_eq!(resolver.active_locks(), 0);

        let resolution = resolve(&resolver, stick(&store, "/sys/devices/usb1/1-1")).await;
        assert_eq!(resolution.udi().as_str(), "usb_0781_5567_0100_noserial");
        assert_eq!(resolver.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_non_persistent_rule_marks_device() {
        #[derive(Debug)]
        struct Volatile;

        impl IdentityRule for Volatile {
            fn bus(&self) -> &str {
                "usb"
            }

            fn candidate_udi(
                &self,
                properties: &halcyon_core::PropertyBag,
            ) -> Result<Udi, IdentityError> {
                UsbDeviceIdentity.candidate_udi(properties)
            }

            fn persistent(&self) -> bool {
                false
            }
        }

        let store = Arc::new(DeviceStore::new());
        let resolver = resolver(&store, 256);
        let resolution = resolver
            .resolve(stick(&store, "/sys/devices/usb1/1-1"), &Volatile, DeviceState::Disabled)
            .await
            .unwrap();
        let Resolution::Committed(device) = resolution else {
            panic!("expected commit");
        };
        assert!(!device.persistent);
    }
}
