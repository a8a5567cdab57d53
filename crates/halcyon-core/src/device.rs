//! Device records and the temporary devices probers build before commit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::property::{PropertyBag, PropertyError, PropertyValue};

/// Unique device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Udi(pub String);

impl Udi {
    pub fn new(udi: impl Into<String>) -> Self {
        Self(udi.into())
    }

    /// The `n`th disambiguated variant of this UDI (`base-n`)
    pub fn with_suffix(&self, n: usize) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Udi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for Udi {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Udi {
    fn from(udi: &str) -> Self {
        Self(udi.to_string())
    }
}

impl From<String> for Udi {
    fn from(udi: String) -> Self {
        Self(udi)
    }
}

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Owned by the prober that created it; never in the device list
    #[default]
    TemporaryUncommitted,
    /// Committed, but still waiting for information such as its parent
    NeedsInfo,
    /// Committed and pending the enable policy
    Disabled,
    Enabled,
    /// Physically gone; the record is kept so the device can be matched again
    Unplugged,
}

impl DeviceState {
    /// Whether devices in this state are visible to queries and watchers
    pub fn is_live(self) -> bool {
        matches!(
            self,
            DeviceState::NeedsInfo | DeviceState::Disabled | DeviceState::Enabled
        )
    }
}

/// A device committed to the global device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub udi: Udi,
    pub properties: PropertyBag,
    /// Parent device, looked up by UDI; may name a device that is gone
    pub parent: Option<Udi>,
    pub state: DeviceState,
    pub capabilities: BTreeSet<String>,
    /// Retained as unplugged on removal instead of being destroyed
    pub persistent: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// A device under construction by a prober.
///
/// Temporary devices live outside the device list: they cannot be found by
/// any query and are never announced to watchers. Dropping one discards it.
#[derive(Debug)]
pub struct TemporaryDevice {
    id: String,
    properties: PropertyBag,
    capabilities: BTreeSet<String>,
    parent: Option<Udi>,
    persistent: bool,
    created: DateTime<Utc>,
}

impl TemporaryDevice {
    pub(crate) fn new() -> Self {
        Self {
            id: format!("temp-{}", Uuid::new_v4()),
            properties: PropertyBag::new(),
            capabilities: BTreeSet::new(),
            parent: None,
            persistent: true,
            created: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::TemporaryUncommitted
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyBag {
        &mut self.properties
    }

    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<(), PropertyError> {
        self.properties.set(key, value).map(|_| ())
    }

    pub fn add_capability(&mut self, capability: impl Into<String>) {
        self.capabilities.insert(capability.into());
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn parent(&self) -> Option<&Udi> {
        self.parent.as_ref()
    }

    pub fn set_parent(&mut self, parent: Option<Udi>) {
        self.parent = parent;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub(crate) fn into_device(self, udi: Udi, state: DeviceState) -> Device {
        Device {
            udi,
            properties: self.properties,
            parent: self.parent,
            state,
            capabilities: self.capabilities,
            persistent: self.persistent,
            first_seen: self.created,
            last_seen: Utc::now(),
        }
    }

    pub(crate) fn into_parts(self) -> (PropertyBag, BTreeSet<String>, Option<Udi>) {
        (self.properties, self.capabilities, self.parent)
    }
}
