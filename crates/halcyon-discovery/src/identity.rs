//! Bus identity rules
//!
//! An identity rule turns the properties a prober collected into a base
//! candidate UDI and says which properties decide whether two devices with
//! the same candidate are really the same device. Candidates are computed from
//! stable identity only (vendor, product, revision, serial), never from where
//! the device is plugged in, so a device keeps its UDI across ports.

use halcyon_core::{PropertyBag, PropertyType, PropertyValue, Udi};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Property holding the canonical sysfs path of a device
pub const SYSFS_PATH_KEY: &str = "linux.sysfs_path";

/// Properties that describe where a device sits rather than what it is.
/// Identity rules may not build candidates from these.
pub const TOPOLOGY_KEYS: &[&str] = &[
    SYSFS_PATH_KEY,
    "usb.bus_number",
    "usb.linux.device_number",
    "usb.port_number",
    "pci.linux.slot_name",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("{bus} device is missing identity property {key}")]
    MissingProperty { bus: String, key: String },
    #[error("{bus} identity property {key} is {found}, expected {expected}")]
    WrongType {
        bus: String,
        key: String,
        expected: PropertyType,
        found: PropertyType,
    },
    #[error("{bus} identity may not depend on topology property {key}")]
    TopologyKey { bus: String, key: String },
    #[error("{bus} identity rule has no keys")]
    NoKeys { bus: String },
}

/// Computes candidate UDIs for one bus.
///
/// `candidate_udi` must be a pure function of the properties.
pub trait IdentityRule: Send + Sync + Debug {
    /// Bus name this rule handles, e.g. `usb`
    fn bus(&self) -> &str;

    fn candidate_udi(&self, properties: &PropertyBag) -> Result<Udi, IdentityError>;

    /// Keys that must be equal for a probe to count as the device already
    /// registered under a candidate UDI
    fn match_keys(&self) -> Vec<String> {
        vec![SYSFS_PATH_KEY.to_string()]
    }

    /// Property prefixes refreshed when an unplugged device comes back
    fn merge_namespaces(&self) -> Vec<String> {
        vec![format!("{}.", self.bus()), "linux.".to_string()]
    }

    /// Whether devices on this bus are kept as unplugged records on removal
    fn persistent(&self) -> bool {
        true
    }
}

/// Replace everything but ASCII alphanumerics with `_`
pub fn sanitize_component(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn require_int(bus: &str, properties: &PropertyBag, key: &str) -> Result<i32, IdentityError> {
    match properties.get(key) {
        Ok(PropertyValue::Int32(v)) => Ok(*v),
        Ok(other) => Err(IdentityError::WrongType {
            bus: bus.to_string(),
            key: key.to_string(),
            expected: PropertyType::Int32,
            found: other.property_type(),
        }),
        Err(_) => Err(IdentityError::MissingProperty {
            bus: bus.to_string(),
            key: key.to_string(),
        }),
    }
}

/// USB devices: `usb_<vendor>_<product>_<revision>_<serial>`
#[derive(Debug, Clone, Default)]
pub struct UsbDeviceIdentity;

impl IdentityRule for UsbDeviceIdentity {
    fn bus(&self) -> &str {
        "usb"
    }

    fn candidate_udi(&self, properties: &PropertyBag) -> Result<Udi, IdentityError> {
        let vendor = require_int("usb", properties, "usb.vendor_id")?;
        let product = require_int("usb", properties, "usb.product_id")?;
        let revision = require_int("usb", properties, "usb.device_revision_bcd")?;
        let serial = match properties.get_string("usb.serial").map(sanitize_component) {
            Some(serial) if !serial.is_empty() => serial,
            _ => "noserial".to_string(),
        };
        Ok(Udi::new(format!(
            "usb_{:04x}_{:04x}_{:04x}_{}",
            vendor, product, revision, serial
        )))
    }
}

/// PCI functions: `pci_<vendor>_<product>`
#[derive(Debug, Clone, Default)]
pub struct PciIdentity;

impl IdentityRule for PciIdentity {
    fn bus(&self) -> &str {
        "pci"
    }

    fn candidate_udi(&self, properties: &PropertyBag) -> Result<Udi, IdentityError> {
        let vendor = require_int("pci", properties, "pci.vendor_id")?;
        let product = require_int("pci", properties, "pci.product_id")?;
        Ok(Udi::new(format!("pci_{:04x}_{:04x}", vendor, product)))
    }
}

/// One component of a configured identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityKey {
    pub key: String,
    /// Used when the property is absent; without it the property is required
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_match_keys() -> Vec<String> {
    vec![SYSFS_PATH_KEY.to_string()]
}

fn default_persistent() -> bool {
    true
}

/// Identity rule declared in configuration.
///
/// The candidate is the prefix followed by each key's value: integers in
/// four-digit hex, strings sanitized, lists joined with `_`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedIdentity {
    pub bus: String,
    /// UDI prefix, defaults to the bus name
    #[serde(default)]
    pub prefix: Option<String>,
    pub keys: Vec<IdentityKey>,
    #[serde(default = "default_match_keys")]
    pub match_keys: Vec<String>,
    /// Prefixes refreshed on re-match; empty means `<bus>.` and `linux.`
    #[serde(default)]
    pub merge_namespaces: Vec<String>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

impl KeyedIdentity {
    /// Reject rules that cannot produce stable identities
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.keys.is_empty() {
            return Err(IdentityError::NoKeys {
                bus: self.bus.clone(),
            });
        }
        if let Some(key) = self
            .keys
            .iter()
            .find(|k| TOPOLOGY_KEYS.contains(&k.key.as_str()))
        {
            return Err(IdentityError::TopologyKey {
                bus: self.bus.clone(),
                key: key.key.clone(),
            });
        }
        Ok(())
    }

    fn render(&self, key: &IdentityKey, properties: &PropertyBag) -> Result<String, IdentityError> {
        let value = match properties.get(&key.key) {
            Ok(value) => value,
            Err(_) => {
                return key
                    .fallback
                    .as_deref()
                    .map(sanitize_component)
                    .ok_or_else(|| IdentityError::MissingProperty {
                        bus: self.bus.clone(),
                        key: key.key.clone(),
                    })
            }
        };
        Ok(match value {
            PropertyValue::String(s) => sanitize_component(s),
            PropertyValue::Int32(v) => format!("{:04x}", v),
            PropertyValue::UInt64(v) => format!("{:04x}", v),
            PropertyValue::Double(v) => sanitize_component(&v.to_string()),
            PropertyValue::Bool(v) => v.to_string(),
            PropertyValue::StringList(items) => items
                .iter()
                .map(|s| sanitize_component(s))
                .collect::<Vec<_>>()
                .join("_"),
        })
    }
}

impl IdentityRule for KeyedIdentity {
    fn bus(&self) -> &str {
        &self.bus
    }

    fn candidate_udi(&self, properties: &PropertyBag) -> Result<Udi, IdentityError> {
        let mut parts = vec![sanitize_component(self.prefix.as_deref().unwrap_or(&self.bus))];
        for key in &self.keys {
            parts.push(self.render(key, properties)?);
        }
        Ok(Udi::new(parts.join("_")))
    }

    fn match_keys(&self) -> Vec<String> {
        self.match_keys.clone()
    }

    fn merge_namespaces(&self) -> Vec<String> {
        if self.merge_namespaces.is_empty() {
            vec![format!("{}.", self.bus), "linux.".to_string()]
        } else {
            self.merge_namespaces.clone()
        }
    }

    fn persistent(&self) -> bool {
        self.persistent
    }
}

/// Identity rules by bus
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, Arc<dyn IdentityRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the buses probed out of the box
    pub fn builtin() -> Self {
        let mut rules = Self::new();
        rules.register(Arc::new(UsbDeviceIdentity));
        rules.register(Arc::new(PciIdentity));
        rules
    }

    /// Add a rule, replacing any rule for the same bus
    pub fn register(&mut self, rule: Arc<dyn IdentityRule>) {
        self.rules.insert(rule.bus().to_string(), rule);
    }

    pub fn register_keyed(&mut self, rule: KeyedIdentity) -> Result<(), IdentityError> {
        rule.validate()?;
        self.register(Arc::new(rule));
        Ok(())
    }

    pub fn get(&self, bus: &str) -> Option<Arc<dyn IdentityRule>> {
        self.rules.get(bus).cloned()
    }

    pub fn buses(&self) -> Vec<&str> {
        let mut buses: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        buses.sort_unstable();
        buses
    }
}
