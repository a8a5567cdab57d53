//! Administrator supplied property overrides
//!
//! An override matches probed devices by one property and merges extra
//! properties and capabilities into them before identity resolution, e.g. to
//! give a known disk a friendly `info.product` or to tag a device for policy.

use halcyon_core::{PropertyValue, TemporaryDevice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OverrideError {
    #[error("override value {value} for {key} is negative and does not fit int32")]
    OutOfRange { key: String, value: i64 },
}

/// Property value as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverrideValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl OverrideValue {
    /// Integers that fit `int32` stay signed, larger ones become `uint64`
    pub fn to_property(&self, key: &str) -> Result<PropertyValue, OverrideError> {
        Ok(match self {
            OverrideValue::Bool(v) => PropertyValue::Bool(*v),
            OverrideValue::Int(v) => match i32::try_from(*v) {
                Ok(small) => PropertyValue::Int32(small),
                Err(_) => PropertyValue::UInt64(u64::try_from(*v).map_err(|_| {
                    OverrideError::OutOfRange {
                        key: key.to_string(),
                        value: *v,
                    }
                })?),
            },
            OverrideValue::Float(v) => PropertyValue::Double(*v),
            OverrideValue::Text(v) => PropertyValue::String(v.clone()),
            OverrideValue::List(v) => PropertyValue::StringList(v.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceOverride {
    pub match_key: String,
    /// Compared against string properties verbatim and against integer
    /// properties in decimal or hex (`0x0781`, `0781`)
    pub match_value: String,
    #[serde(default)]
    pub properties: BTreeMap<String, OverrideValue>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn value_matches(value: &PropertyValue, expected: &str) -> bool {
    let as_int = |v: i64| {
        let hex = expected.trim_start_matches("0x");
        expected.parse::<i64>().ok() == Some(v) || i64::from_str_radix(hex, 16).ok() == Some(v)
    };
    match value {
        PropertyValue::String(s) => s == expected,
        PropertyValue::Int32(v) => as_int(i64::from(*v)),
        PropertyValue::UInt64(v) => i64::try_from(*v).map_or(false, as_int),
        PropertyValue::Bool(v) => v.to_string() == expected,
        PropertyValue::StringList(items) => items.iter().any(|s| s == expected),
        PropertyValue::Double(_) => false,
    }
}

impl DeviceOverride {
    /// Check every value converts to a property
    pub fn validate(&self) -> Result<(), OverrideError> {
        for (key, value) in &self.properties {
            value.to_property(key)?;
        }
        Ok(())
    }

    pub fn matches(&self, device: &TemporaryDevice) -> bool {
        device
            .properties()
            .get(&self.match_key)
            .map_or(false, |value| value_matches(value, &self.match_value))
    }

    /// Merge this override into `device`. Properties whose type would clash
    /// with a probed value are skipped.
    pub fn apply(&self, device: &mut TemporaryDevice) {
        for (key, value) in &self.properties {
            let value = match value.to_property(key) {
                Ok(value) => value,
                Err(e) => {
                    warn!(temp = device.id(), error = %e, "Skipping override property");
                    continue;
                }
            };
            if let Err(e) = device.set_property(key.clone(), value) {
                warn!(temp = device.id(), error = %e, "Skipping override property");
            }
        }
        for capability in &self.capabilities {
            device.add_capability(capability.clone());
        }
    }
}

/// Apply every matching override in order; returns how many matched
pub fn apply_overrides(overrides: &[DeviceOverride], device: &mut TemporaryDevice) -> usize {
    let mut applied = 0;
    for rule in overrides {
        if rule.matches(device) {
            debug!(temp = device.id(), key = %rule.match_key, "Applying device override");
            rule.apply(device);
            applied += 1;
        }
    }
    applied
}
