//! Saving persistent devices across daemon restarts
//!
//! The state file is a JSON document listing every persistent device with its
//! properties, capabilities and parent. On startup the records are loaded back
//! into the store as unplugged devices so that a replugged device resolves to
//! the UDI it had before the restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::device::{Device, Udi};
use crate::property::PropertyBag;

const STATE_FILE_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Unsupported state file version {0}")]
    UnsupportedVersion(String),
}

/// One saved device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub udi: Udi,
    pub properties: PropertyBag,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub parent: Option<Udi>,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&Device> for PersistedDevice {
    fn from(device: &Device) -> Self {
        Self {
            udi: device.udi.clone(),
            properties: device.properties.clone(),
            capabilities: device.capabilities.clone(),
            parent: device.parent.clone(),
            first_seen: device.first_seen,
            last_seen: Some(device.last_seen),
        }
    }
}

fn default_version() -> String {
    STATE_FILE_VERSION.to_string()
}

/// Contents of the state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default = "default_version")]
    pub version: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub devices: Vec<PersistedDevice>,
}

impl StateFile {
    pub fn new(devices: Vec<PersistedDevice>) -> Self {
        Self {
            version: default_version(),
            saved_at: Utc::now(),
            devices,
        }
    }

    /// Load a state file
    pub fn from_file(path: &Path) -> Result<Self, PersistError> {
        let content = std::fs::read_to_string(path)?;
        let state: StateFile = serde_json::from_str(&content)?;
        if state.version != STATE_FILE_VERSION {
            return Err(PersistError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    /// Load a state file, or start empty if it does not exist yet
    pub fn load_or_create(path: &Path) -> Result<Self, PersistError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::new(Vec::new()))
        }
    }

    /// Write the state file.
    ///
    /// Each call writes its own uniquely named temporary file next to `path`
    /// and renames it into place, so readers see either the old or the new
    /// document and overlapping saves never share a temporary file.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
