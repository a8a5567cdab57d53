//! Configuration loading and validation

use anyhow::{Context, Result};
use halcyon_discovery::{
    BackoffConfig, Bus, DeviceOverride, KeyedIdentity, ResolverConfig, RuleSet, SYSFS_PATH_KEY,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub coldplug: ColdplugConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Extra identity rules for buses without a built-in rule
    #[serde(default, rename = "identity", skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<KeyedIdentity>,
    #[serde(default, rename = "device_override", skip_serializing_if = "Vec::is_empty")]
    pub device_overrides: Vec<DeviceOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the API server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Save the state file every N seconds (0 to disable)
    #[serde(default)]
    pub autosave_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            autosave_interval_secs: 0,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Where persistent devices are saved between runs
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Properties with a reverse index for fast lookups
    #[serde(default = "default_indexed_properties")]
    pub indexed_properties: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            indexed_properties: default_indexed_properties(),
        }
    }
}

fn default_state_file() -> String {
    "./halcyon-state.json".to_string()
}

fn default_indexed_properties() -> Vec<String> {
    vec![
        SYSFS_PATH_KEY.to_string(),
        "info.bus".to_string(),
        "info.category".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSection {
    /// Cap on candidate UDIs tried per device
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// How long a hotplugged child waits for its parent
    #[serde(default = "default_hotplug_timeout")]
    pub hotplug_timeout_ms: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            hotplug_timeout_ms: default_hotplug_timeout(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

fn default_max_attempts() -> usize {
    256
}

fn default_hotplug_timeout() -> u64 {
    5000
}

fn default_backoff_initial() -> u64 {
    10
}

fn default_backoff_max() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdplugConfig {
    /// Mount point of sysfs
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,
    /// Probe all devices when the daemon starts
    #[serde(default = "default_true")]
    pub on_startup: bool,
    #[serde(default = "default_true")]
    pub usb: bool,
    #[serde(default = "default_true")]
    pub pci: bool,
}

impl Default for ColdplugConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            on_startup: true,
            usb: true,
            pci: true,
        }
    }
}

fn default_sysfs_root() -> String {
    "/sys".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Move devices to `enabled` as soon as they are fully probed
    #[serde(default)]
    pub auto_enable: bool,
}

impl Config {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            max_attempts: self.resolver.max_attempts,
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.resolver.backoff_initial_ms),
            max_interval: Duration::from_millis(self.resolver.backoff_max_ms),
            hotplug_timeout: Duration::from_millis(self.resolver.hotplug_timeout_ms),
        }
    }

    /// Buses walked during coldplug, parents' buses first
    pub fn coldplug_buses(&self) -> Vec<Bus> {
        let mut buses = Vec::new();
        if self.coldplug.pci {
            buses.push(Bus::Pci);
        }
        if self.coldplug.usb {
            buses.push(Bus::Usb);
        }
        buses
    }

    /// Built-in identity rules plus the configured ones
    pub fn rule_set(&self) -> Result<RuleSet> {
        let mut rules = RuleSet::builtin();
        for identity in &self.identities {
            rules
                .register_keyed(identity.clone())
                .with_context(|| format!("invalid identity rule for bus {}", identity.bus))?;
        }
        Ok(rules)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}
