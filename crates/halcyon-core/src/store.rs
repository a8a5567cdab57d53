//! The global device list (GDL)
//!
//! [`DeviceStore`] is the single owner of every committed device. Readers get
//! cloned snapshots and never hold references into the store across an await
//! point. All mutations are short, synchronous critical sections under one
//! write lock: the record, the property index and the outgoing notifications
//! change together, so no reader can observe a UDI without its properties or a
//! changeset that is only half applied.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceState, TemporaryDevice, Udi};
use crate::notify::{ChangeNotifier, DeviceEvent, WatchFilter, Watcher};
use crate::persist::PersistedDevice;
use crate::property::{Changeset, PropertyChange, PropertyError, PropertyValue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("device {0} already exists and is live")]
    AlreadyExists(Udi),
    #[error("device {0} not found")]
    NotFound(Udi),
    #[error("device {0} is not unplugged")]
    NotUnplugged(Udi),
    #[error("making {parent} the parent of {child} would create a cycle")]
    ParentCycle { child: Udi, parent: Udi },
    #[error("device {udi} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        udi: Udi,
        from: DeviceState,
        to: DeviceState,
    },
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Reverse index from string property values to devices
#[derive(Debug, Default)]
struct PropertyIndex {
    keys: HashMap<String, HashMap<String, BTreeSet<Udi>>>,
}

impl PropertyIndex {
    fn insert(&mut self, device: &Device) {
        for (key, by_value) in self.keys.iter_mut() {
            if let Some(value) = device.properties.get_string(key) {
                by_value
                    .entry(value.to_string())
                    .or_default()
                    .insert(device.udi.clone());
            }
        }
    }

    fn remove(&mut self, device: &Device) {
        for (key, by_value) in self.keys.iter_mut() {
            if let Some(value) = device.properties.get_string(key) {
                if let Some(udis) = by_value.get_mut(value) {
                    udis.remove(&device.udi);
                    if udis.is_empty() {
                        by_value.remove(value);
                    }
                }
            }
        }
    }

    /// `None` when `key` is not indexed
    fn lookup(&self, key: &str, value: &str) -> Option<Vec<Udi>> {
        let by_value = self.keys.get(key)?;
        Some(
            by_value
                .get(value)
                .map(|udis| udis.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }
}

#[derive(Debug, Default)]
struct Gdl {
    devices: HashMap<Udi, Device>,
    index: PropertyIndex,
}

impl Gdl {
    /// Whether making `parent` the parent of `child` would close a loop
    fn would_cycle(&self, child: &Udi, parent: &Udi) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(udi) = cursor {
            if udi == child {
                return true;
            }
            if !seen.insert(udi) {
                // Pre-existing loop that does not involve `child`
                return false;
            }
            cursor = self.devices.get(udi).and_then(|d| d.parent.as_ref());
        }
        false
    }

    fn sanitize_parent(&self, udi: &Udi, parent: Option<Udi>) -> Option<Udi> {
        match parent {
            Some(p) if self.would_cycle(udi, &p) => {
                warn!(udi = %udi, parent = %p, "Dropping parent link that would form a cycle");
                None
            }
            other => other,
        }
    }
}

/// Owner of the global device list
#[derive(Debug, Default)]
pub struct DeviceStore {
    gdl: RwLock<Gdl>,
    notifier: ChangeNotifier,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that publishes through an existing notifier
    pub fn with_notifier(notifier: ChangeNotifier) -> Self {
        Self {
            gdl: RwLock::new(Gdl::default()),
            notifier,
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Register a watcher for device list changes
    pub fn watch(&self, filter: WatchFilter) -> Watcher {
        self.notifier.watch(filter)
    }

    /// Allocate a new temporary device owned by the caller
    pub fn create_temporary(&self) -> TemporaryDevice {
        let temp = TemporaryDevice::new();
        debug!(temp = temp.id(), "Created temporary device");
        temp
    }

    /// Commit a temporary device under `udi` in the `Disabled` state
    pub async fn commit(&self, temp: TemporaryDevice, udi: Udi) -> Result<Device, StoreError> {
        self.commit_with_state(temp, udi, DeviceState::Disabled).await
    }

    /// Commit a temporary device under `udi`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if a live device already holds
    /// the UDI. An unplugged record at that UDI is superseded.
    pub async fn commit_with_state(
        &self,
        temp: TemporaryDevice,
        udi: Udi,
        state: DeviceState,
    ) -> Result<Device, StoreError> {
        if !state.is_live() {
            return Err(StoreError::InvalidTransition {
                udi,
                from: DeviceState::TemporaryUncommitted,
                to: state,
            });
        }

        let mut gdl = self.gdl.write().await;
        let first_seen = match gdl.devices.get(&udi) {
            Some(existing) if existing.is_live() => return Err(StoreError::AlreadyExists(udi)),
            Some(existing) => Some(existing.first_seen),
            None => None,
        };

        let temp_id = temp.id().to_string();
        let mut device = temp.into_device(udi.clone(), state);
        device.parent = gdl.sanitize_parent(&udi, device.parent.take());
        if let Some(first_seen) = first_seen {
            debug!(udi = %udi, "Superseding unplugged record");
            device.first_seen = first_seen;
        }

        if let Some(old) = gdl.devices.remove(&udi) {
            gdl.index.remove(&old);
        }
        gdl.index.insert(&device);
        gdl.devices.insert(udi.clone(), device.clone());
        self.notifier
            .publish(&DeviceEvent::DeviceAdded { udi: udi.clone() }, &device.capabilities);

        info!(udi = %udi, temp = %temp_id, state = ?state, "Device added");
        Ok(device)
    }

    /// Merge a rediscovered device into its unplugged record.
    ///
    /// Only properties under `namespaces` are taken from the temporary device
    /// (all of them when empty), so user-set and cross-namespace properties
    /// survive. Capabilities are unioned, the parent is replaced by the fresh
    /// one and the device reappears in the `Disabled` state.
    pub async fn rematch(
        &self,
        udi: &str,
        temp: TemporaryDevice,
        namespaces: &[String],
    ) -> Result<Device, StoreError> {
        let mut gdl = self.gdl.write().await;
        let Some(mut device) = gdl.devices.remove(udi) else {
            return Err(StoreError::NotFound(Udi::new(udi)));
        };
        if device.state != DeviceState::Unplugged {
            let udi = device.udi.clone();
            gdl.devices.insert(udi.clone(), device);
            return Err(StoreError::NotUnplugged(udi));
        }
        gdl.index.remove(&device);

        let (properties, capabilities, parent) = temp.into_parts();
        let filter = if namespaces.is_empty() {
            None
        } else {
            Some(namespaces)
        };
        let report = device.properties.merge_from(&properties, filter);
        for conflict in &report.conflicts {
            warn!(udi = %device.udi, error = %conflict, "Skipped conflicting property while merging");
        }
        device.capabilities.extend(capabilities);
        device.parent = gdl.sanitize_parent(&device.udi, parent);
        device.state = DeviceState::Disabled;
        device.touch();

        gdl.index.insert(&device);
        gdl.devices.insert(device.udi.clone(), device.clone());
        self.notifier.publish(
            &DeviceEvent::DeviceAdded {
                udi: device.udi.clone(),
            },
            &device.capabilities,
        );

        info!(udi = %device.udi, merged = report.changes.len(), "Device is plugged in again");
        Ok(device)
    }

    /// Look up a committed device in any state
    pub async fn find_by_udi(&self, udi: &str) -> Option<Device> {
        self.gdl.read().await.devices.get(udi).cloned()
    }

    /// All live devices whose property `key` equals `value`, sorted by UDI
    pub async fn find_by_property(&self, key: &str, value: &PropertyValue) -> Vec<Device> {
        let gdl = self.gdl.read().await;
        let indexed = value.as_str().and_then(|v| gdl.index.lookup(key, v));
        let mut found: Vec<Device> = match indexed {
            Some(udis) => udis
                .iter()
                .filter_map(|udi| gdl.devices.get(udi))
                .filter(|d| d.is_live())
                .cloned()
                .collect(),
            None => gdl
                .devices
                .values()
                .filter(|d| d.is_live() && d.properties.get(key).map_or(false, |v| v == value))
                .cloned()
                .collect(),
        };
        found.sort_by(|a, b| a.udi.cmp(&b.udi));
        found
    }

    /// First live device (by UDI order) whose property `key` equals `value`
    pub async fn find_one_by_property(&self, key: &str, value: &PropertyValue) -> Option<Device> {
        self.find_by_property(key, value).await.into_iter().next()
    }

    /// Maintain a reverse index for string values of `key`
    pub async fn index_property(&self, key: &str) {
        let mut gdl = self.gdl.write().await;
        if gdl.index.keys.contains_key(key) {
            return;
        }
        let mut by_value: HashMap<String, BTreeSet<Udi>> = HashMap::new();
        for device in gdl.devices.values() {
            if let Some(value) = device.properties.get_string(key) {
                by_value
                    .entry(value.to_string())
                    .or_default()
                    .insert(device.udi.clone());
            }
        }
        gdl.index.keys.insert(key.to_string(), by_value);
        debug!(key = key, "Indexing property");
    }

    /// Snapshot of the device list, sorted by UDI
    pub async fn all_devices(&self, include_unplugged: bool) -> Vec<Device> {
        let gdl = self.gdl.read().await;
        let mut devices: Vec<Device> = gdl
            .devices
            .values()
            .filter(|d| include_unplugged || d.is_live())
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.udi.cmp(&b.udi));
        devices
    }

    /// Live devices whose parent is `udi`
    pub async fn children(&self, udi: &str) -> Vec<Device> {
        let gdl = self.gdl.read().await;
        let mut children: Vec<Device> = gdl
            .devices
            .values()
            .filter(|d| d.is_live() && d.parent.as_ref().map_or(false, |p| p.as_str() == udi))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.udi.cmp(&b.udi));
        children
    }

    /// Number of committed records, unplugged ones included
    pub async fn len(&self) -> usize {
        self.gdl.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.gdl.read().await.devices.is_empty()
    }

    pub async fn live_count(&self) -> usize {
        self.gdl
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.is_live())
            .count()
    }

    /// Run `f` on one device with the index kept in sync. The event returned
    /// by `f` is published if the device is visible afterwards.
    async fn mutate<T, F>(&self, udi: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Device) -> Result<(T, Option<DeviceEvent>), StoreError>,
    {
        let mut gdl = self.gdl.write().await;
        let Gdl { devices, index } = &mut *gdl;
        let device = devices
            .get_mut(udi)
            .ok_or_else(|| StoreError::NotFound(Udi::new(udi)))?;

        index.remove(device);
        let result = f(device);
        index.insert(device);

        let (value, event) = result?;
        if let Some(event) = event {
            if device.is_live() {
                self.notifier.publish(&event, &device.capabilities);
            }
        }
        Ok(value)
    }

    /// Apply a changeset to a committed device.
    ///
    /// Either every operation applies or none does; watchers receive one
    /// property-modified event carrying all resulting changes.
    pub async fn apply_changeset(
        &self,
        udi: &str,
        changeset: &Changeset,
    ) -> Result<Vec<PropertyChange>, StoreError> {
        self.mutate(udi, |device| {
            let changes = device.properties.apply(changeset)?;
            let event = (!changes.is_empty()).then(|| DeviceEvent::PropertiesModified {
                udi: device.udi.clone(),
                changes: changes.clone(),
            });
            Ok((changes, event))
        })
        .await
    }

    pub async fn set_property(
        &self,
        udi: &str,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<Option<PropertyChange>, StoreError> {
        let changeset = Changeset::new().set(key, value);
        Ok(self.apply_changeset(udi, &changeset).await?.into_iter().next())
    }

    pub async fn remove_property(
        &self,
        udi: &str,
        key: &str,
    ) -> Result<Option<PropertyChange>, StoreError> {
        let changeset = Changeset::new().remove(key);
        Ok(self.apply_changeset(udi, &changeset).await?.into_iter().next())
    }

    /// Returns false if the device already had the capability
    pub async fn add_capability(&self, udi: &str, capability: &str) -> Result<bool, StoreError> {
        self.mutate(udi, |device| {
            if !device.capabilities.insert(capability.to_string()) {
                return Ok((false, None));
            }
            let event = DeviceEvent::CapabilityAdded {
                udi: device.udi.clone(),
                capability: capability.to_string(),
            };
            Ok((true, Some(event)))
        })
        .await
    }

    /// Returns false if the device did not have the capability
    pub async fn remove_capability(&self, udi: &str, capability: &str) -> Result<bool, StoreError> {
        self.mutate(udi, |device| {
            if !device.capabilities.remove(capability) {
                return Ok((false, None));
            }
            let event = DeviceEvent::CapabilityRemoved {
                udi: device.udi.clone(),
                capability: capability.to_string(),
            };
            Ok((true, Some(event)))
        })
        .await
    }

    /// Link `udi` to `parent`, refusing links that would form a cycle
    pub async fn set_parent(&self, udi: &str, parent: Option<Udi>) -> Result<(), StoreError> {
        let mut gdl = self.gdl.write().await;
        let Some(child) = gdl.devices.get(udi) else {
            return Err(StoreError::NotFound(Udi::new(udi)));
        };
        let child_udi = child.udi.clone();
        if let Some(p) = &parent {
            if gdl.would_cycle(&child_udi, p) {
                return Err(StoreError::ParentCycle {
                    child: child_udi,
                    parent: p.clone(),
                });
            }
        }

        let Some(device) = gdl.devices.get_mut(udi) else {
            return Err(StoreError::NotFound(child_udi));
        };
        if device.parent == parent {
            return Ok(());
        }
        device.parent = parent.clone();
        debug!(udi = %device.udi, parent = ?parent, "Parent linked");
        if device.is_live() {
            self.notifier.publish(
                &DeviceEvent::ParentChanged {
                    udi: device.udi.clone(),
                    parent,
                },
                &device.capabilities,
            );
        }
        Ok(())
    }

    /// Move a live device between `NeedsInfo`, `Disabled` and `Enabled`
    pub async fn set_state(&self, udi: &str, state: DeviceState) -> Result<(), StoreError> {
        self.mutate(udi, |device| {
            if !state.is_live() || !device.is_live() {
                return Err(StoreError::InvalidTransition {
                    udi: device.udi.clone(),
                    from: device.state,
                    to: state,
                });
            }
            if device.state == state {
                return Ok(((), None));
            }
            device.state = state;
            let event = DeviceEvent::StateChanged {
                udi: device.udi.clone(),
                state,
            };
            Ok(((), Some(event)))
        })
        .await
    }

    /// Refresh the last seen timestamp
    pub async fn touch(&self, udi: &str) -> Result<(), StoreError> {
        self.mutate(udi, |device| {
            device.touch();
            Ok(((), None))
        })
        .await
    }

    /// Destroy a device. Watchers are told only if it was still visible.
    pub async fn remove(&self, udi: &str) -> Result<Device, StoreError> {
        let mut gdl = self.gdl.write().await;
        let device = gdl
            .devices
            .remove(udi)
            .ok_or_else(|| StoreError::NotFound(Udi::new(udi)))?;
        gdl.index.remove(&device);
        if device.is_live() {
            self.notifier.publish(
                &DeviceEvent::DeviceRemoved {
                    udi: device.udi.clone(),
                },
                &device.capabilities,
            );
        }
        info!(udi = %device.udi, "Device removed");
        Ok(device)
    }

    /// Logically remove a persistent device while keeping its record for
    /// later re-matching. Unplugging an unplugged device is a no-op.
    pub async fn mark_unplugged(&self, udi: &str) -> Result<(), StoreError> {
        let mut gdl = self.gdl.write().await;
        let device = gdl
            .devices
            .get_mut(udi)
            .ok_or_else(|| StoreError::NotFound(Udi::new(udi)))?;
        if device.state == DeviceState::Unplugged {
            return Ok(());
        }
        device.state = DeviceState::Unplugged;
        device.touch();
        self.notifier.publish(
            &DeviceEvent::DeviceRemoved {
                udi: device.udi.clone(),
            },
            &device.capabilities,
        );
        info!(udi = %device.udi, "Device unplugged");
        Ok(())
    }

    /// Load previously known persistent devices as unplugged records.
    ///
    /// Meant to run before the first probe. No notifications are sent and
    /// records whose UDI is already present are skipped. Returns the number of
    /// records loaded.
    pub async fn rehydrate(&self, records: Vec<PersistedDevice>) -> usize {
        let mut gdl = self.gdl.write().await;
        let mut loaded = 0;
        for record in records {
            if gdl.devices.contains_key(&record.udi) {
                warn!(udi = %record.udi, "Skipping persisted device, UDI already present");
                continue;
            }
            let device = Device {
                udi: record.udi,
                properties: record.properties,
                parent: record.parent,
                state: DeviceState::Unplugged,
                capabilities: record.capabilities,
                persistent: true,
                first_seen: record.first_seen,
                last_seen: record.last_seen.unwrap_or_else(Utc::now),
            };
            gdl.index.insert(&device);
            gdl.devices.insert(device.udi.clone(), device);
            loaded += 1;
        }
        info!(count = loaded, "Rehydrated persistent devices");
        loaded
    }

    /// Snapshot every persistent device for saving, sorted by UDI
    pub async fn persistent_records(&self) -> Vec<PersistedDevice> {
        let gdl = self.gdl.read().await;
        let mut records: Vec<PersistedDevice> = gdl
            .devices
            .values()
            .filter(|d| d.persistent)
            .map(PersistedDevice::from)
            .collect();
        records.sort_by(|a, b| a.udi.cmp(&b.udi));
        records
    }
}
