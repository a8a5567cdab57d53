//! Application state management

use anyhow::{Context, Result};
use halcyon_core::{DeviceStore, StateFile};
use halcyon_discovery::{
    Bus, HotplugEvent, HotplugOutcome, ProbeCoordinator, ProbeReport, ProbeRequest, SysfsProber,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{info, warn};

use crate::config::Config;
use crate::policy;

/// Shared application state
pub struct AppState {
    /// Global device list
    pub store: Arc<DeviceStore>,
    /// Turns probed devices into committed ones
    pub coordinator: Arc<ProbeCoordinator>,
    /// Coldplug walker over the configured sysfs root
    pub prober: SysfsProber,
    /// Configuration
    pub config: Config,
    /// Held while the state file is written
    save_lock: Mutex<()>,
}

impl AppState {
    /// Create new application state.
    ///
    /// Persistent devices from the state file are loaded as unplugged before
    /// anything is probed, so replugged devices keep their UDIs.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(DeviceStore::new());
        for key in &config.store.indexed_properties {
            store.index_property(key).await;
        }

        let state_path = PathBuf::from(&config.store.state_file);
        let path = state_path.clone();
        let saved = task::spawn_blocking(move || StateFile::load_or_create(&path))
            .await?
            .with_context(|| format!("cannot load state file {}", state_path.display()))?;
        let loaded = store.rehydrate(saved.devices).await;
        info!(path = %state_path.display(), devices = loaded, "Loaded state file");

        if config.policy.auto_enable {
            policy::spawn_auto_enable(store.clone());
        }

        for rule in &config.device_overrides {
            rule.validate().with_context(|| {
                format!("invalid device override for {} = {}", rule.match_key, rule.match_value)
            })?;
        }

        let coordinator = ProbeCoordinator::with_config(
            store.clone(),
            config.rule_set()?,
            config.resolver_config(),
            config.backoff_config(),
        )
        .with_overrides(config.device_overrides.clone());

        Ok(Arc::new(Self {
            prober: SysfsProber::new(&config.coldplug.sysfs_root),
            coordinator: Arc::new(coordinator),
            store,
            config,
            save_lock: Mutex::new(()),
        }))
    }

    /// Probe every device on the configured buses
    pub async fn coldplug(&self) -> ProbeReport {
        let prober = self.prober.clone();
        let store = self.store.clone();
        let buses = self.config.coldplug_buses();
        let requests = task::spawn_blocking(move || prober.enumerate(&store, &buses))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Sysfs walk did not finish");
                Vec::new()
            });
        self.coordinator.probe(requests).await
    }

    /// Probe one device that just appeared in sysfs
    pub async fn hotplug_path(&self, bus: Bus, path: &Path) -> Result<HotplugOutcome> {
        let prober = self.prober.clone();
        let store = self.store.clone();
        let path = path.to_path_buf();
        let request = task::spawn_blocking(move || prober.probe_path(&store, bus, &path)).await??;
        Ok(self.coordinator.hotplug(HotplugEvent::Add(request)).await?)
    }

    pub async fn hotplug(&self, event: HotplugEvent) -> Result<HotplugOutcome> {
        Ok(self.coordinator.hotplug(event).await?)
    }

    /// Build a probe request from properties supplied by a caller
    pub fn request_from_properties(
        &self,
        bus: &str,
        properties: &halcyon_core::PropertyBag,
    ) -> Result<ProbeRequest> {
        let mut device = self.store.create_temporary();
        for (key, value) in properties.iter() {
            device.set_property(key, value.clone())?;
        }
        Ok(ProbeRequest::new(bus, device))
    }

    pub fn state_path(&self) -> &Path {
        Path::new(&self.config.store.state_file)
    }

    /// Write every persistent device to the state file. Saves run one at a
    /// time, so the newest snapshot is always the one left on disk.
    pub async fn save(&self) -> Result<usize> {
        let _saving = self.save_lock.lock().await;
        let records = self.store.persistent_records().await;
        let count = records.len();
        let path = self.state_path().to_path_buf();
        task::spawn_blocking(move || StateFile::new(records).save(&path)).await??;
        info!(path = %self.state_path().display(), devices = count, "Saved state file");
        Ok(count)
    }

    /// Save the state file periodically, if configured
    pub fn spawn_autosave(self: &Arc<Self>) {
        let secs = self.config.daemon.autosave_interval_secs;
        if secs == 0 {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = state.save().await {
                    warn!(error = %e, "Autosave failed");
                }
            }
        });
    }
}
