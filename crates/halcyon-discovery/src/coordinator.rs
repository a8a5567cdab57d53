//! Probe coordinator
//!
//! Drives temporary devices from probers through overrides, parent lookup
//! and identity resolution. A probe pass handles a whole enumeration and
//! links parents that were probed after their children in a final pass;
//! hotplug events are handled one at a time and may wait for a late parent.

use halcyon_core::{DeviceState, DeviceStore, StoreError, TemporaryDevice, Udi};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::RuleSet;
use crate::overrides::{apply_overrides, DeviceOverride};
use crate::parent::{BackoffConfig, ParentLinker, PropertyMatch, ResolveMode};
use crate::resolver::{IdentityResolver, Resolution, ResolveError, ResolverConfig};

/// A probed device waiting to be resolved
#[derive(Debug)]
pub struct ProbeRequest {
    pub bus: String,
    pub device: TemporaryDevice,
    /// How to find the parent, if the device has one
    pub parent: Option<PropertyMatch>,
}

impl ProbeRequest {
    pub fn new(bus: impl Into<String>, device: TemporaryDevice) -> Self {
        Self {
            bus: bus.into(),
            device,
            parent: None,
        }
    }

    pub fn with_parent(mut self, lookup: PropertyMatch) -> Self {
        self.parent = Some(lookup);
        self
    }
}

#[derive(Debug)]
pub enum HotplugEvent {
    Add(ProbeRequest),
    /// Remove every live device matching `lookup`
    Remove { bus: String, lookup: PropertyMatch },
}

#[derive(Debug)]
pub enum HotplugOutcome {
    Added(Resolution),
    Removed {
        unplugged: Vec<Udi>,
        destroyed: Vec<Udi>,
    },
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no {bus} device with {key} = {value}")]
    NoSuchDevice {
        bus: String,
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeFailure {
    pub bus: String,
    pub temp_id: String,
    pub error: String,
}

/// Summary of a probe pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub committed: Vec<Udi>,
    pub rematched: Vec<Udi>,
    pub duplicates: Vec<Udi>,
    /// Devices whose parent was only found in the final pass
    pub linked_late: Vec<Udi>,
    pub failed: Vec<ProbeFailure>,
}

#[derive(Debug)]
pub struct ProbeCoordinator {
    store: Arc<DeviceStore>,
    rules: RuleSet,
    resolver: IdentityResolver,
    linker: ParentLinker,
    overrides: Vec<DeviceOverride>,
}

impl ProbeCoordinator {
    pub fn new(store: Arc<DeviceStore>, rules: RuleSet) -> Self {
        Self::with_config(store, rules, ResolverConfig::default(), BackoffConfig::default())
    }

    pub fn with_config(
        store: Arc<DeviceStore>,
        rules: RuleSet,
        resolver: ResolverConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(store.clone(), resolver),
            linker: ParentLinker::new(store.clone(), backoff),
            store,
            rules,
            overrides: Vec::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<DeviceOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Resolve one request. Also returns the parent lookup if it failed.
    async fn resolve_one(
        &self,
        request: ProbeRequest,
        mode: ResolveMode,
    ) -> Result<(Resolution, Option<PropertyMatch>), ResolveError> {
        let ProbeRequest {
            bus,
            mut device,
            parent,
        } = request;
        let rule = self
            .rules
            .get(&bus)
            .ok_or_else(|| ResolveError::UnknownBus(bus.clone()))?;

        apply_overrides(&self.overrides, &mut device);

        let mut unresolved = None;
        if let Some(lookup) = parent {
            match self.linker.resolve(device.properties(), &lookup, mode).await {
                Some(parent) => device.set_parent(Some(parent)),
                None => unresolved = Some(lookup),
            }
        }

        let state = if unresolved.is_some() && mode == ResolveMode::Probe {
            DeviceState::NeedsInfo
        } else {
            DeviceState::Disabled
        };
        let resolution = self.resolver.resolve(device, rule.as_ref(), state).await?;
        Ok((resolution, unresolved))
    }

    /// Resolve a batch of probed devices.
    ///
    /// Devices are resolved in order. Children whose parent had not been
    /// committed yet are linked afterwards, and every device still waiting
    /// for information is moved to `Disabled` before this returns.
    pub async fn probe(&self, requests: Vec<ProbeRequest>) -> ProbeReport {
        info!(count = requests.len(), "Starting probe pass");
        let mut report = ProbeReport::default();
        let mut pending: Vec<(Udi, PropertyMatch)> = Vec::new();

        for request in requests {
            let bus = request.bus.clone();
            let temp_id = request.device.id().to_string();
            match self.resolve_one(request, ResolveMode::Probe).await {
                Ok((resolution, unresolved)) => {
                    let udi = resolution.udi().clone();
                    match resolution {
                        Resolution::Committed(_) => report.committed.push(udi.clone()),
                        Resolution::Rematched(_) => report.rematched.push(udi.clone()),
                        Resolution::Duplicate { .. } => {
                            report.duplicates.push(udi);
                            continue;
                        }
                    }
                    if let Some(lookup) = unresolved {
                        pending.push((udi, lookup));
                    }
                }
                Err(e) => {
                    warn!(bus = %bus, temp = %temp_id, error = %e, "Probe failed");
                    report.failed.push(ProbeFailure {
                        bus,
                        temp_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        for (udi, lookup) in pending {
            if let Some(parent) = self
                .store
                .find_one_by_property(&lookup.key, &lookup.value)
                .await
            {
                match self.store.set_parent(udi.as_str(), Some(parent.udi)).await {
                    Ok(()) => report.linked_late.push(udi.clone()),
                    Err(e) => warn!(udi = %udi, error = %e, "Cannot link parent"),
                }
            } else {
                debug!(udi = %udi, key = %lookup.key, "Parent never appeared");
            }

            if let Some(device) = self.store.find_by_udi(udi.as_str()).await {
                if device.state == DeviceState::NeedsInfo {
                    if let Err(e) = self.store.set_state(udi.as_str(), DeviceState::Disabled).await {
                        warn!(udi = %udi, error = %e, "Cannot finish device");
                    }
                }
            }
        }

        info!(
            committed = report.committed.len(),
            rematched = report.rematched.len(),
            duplicates = report.duplicates.len(),
            linked_late = report.linked_late.len(),
            failed = report.failed.len(),
            "Probe pass complete"
        );
        report
    }

    /// Handle one hotplug event
    pub async fn hotplug(&self, event: HotplugEvent) -> Result<HotplugOutcome, ProbeError> {
        match event {
            HotplugEvent::Add(request) => {
                let (resolution, unresolved) =
                    self.resolve_one(request, ResolveMode::Hotplug).await?;
                if let Some(lookup) = unresolved {
                    warn!(udi = %resolution.udi(), key = %lookup.key, "Hotplugged device has no parent");
                }
                Ok(HotplugOutcome::Added(resolution))
            }
            HotplugEvent::Remove { bus, lookup } => {
                let devices = self
                    .store
                    .find_by_property(&lookup.key, &lookup.value)
                    .await;
                if devices.is_empty() {
                    return Err(ProbeError::NoSuchDevice {
                        bus,
                        key: lookup.key,
                        value: lookup.value.to_string(),
                    });
                }

                let mut unplugged = Vec::new();
                let mut destroyed = Vec::new();
                for device in devices {
                    if device.persistent {
                        self.store.mark_unplugged(device.udi.as_str()).await?;
                        unplugged.push(device.udi);
                    } else {
                        self.store.remove(device.udi.as_str()).await?;
                        destroyed.push(device.udi);
                    }
                }
                Ok(HotplugOutcome::Removed {
                    unplugged,
                    destroyed,
                })
            }
        }
    }
}
