//! Typed device properties and atomic changesets
//!
//! Every device carries a [`PropertyBag`]: a map from dotted, namespaced keys
//! (`usb.vendor_id`, `linux.sysfs_path`, `info.product`) to typed values. The
//! type of a key is fixed once it has been set; writing a value of another
//! type is rejected with [`PropertyError::TypeMismatch`] and leaves the bag
//! untouched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("property {key} holds {existing}, refusing to store {attempted}")]
    TypeMismatch {
        key: String,
        existing: PropertyType,
        attempted: PropertyType,
    },
    #[error("property {0} not found")]
    NotFound(String),
}

/// The type tag of a [`PropertyValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Int32,
    #[serde(rename = "uint64")]
    UInt64,
    Double,
    Bool,
    StringList,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::String => "string",
            PropertyType::Int32 => "int32",
            PropertyType::UInt64 => "uint64",
            PropertyType::Double => "double",
            PropertyType::Bool => "bool",
            PropertyType::StringList => "strlist",
        };
        f.write_str(name)
    }
}

/// A single property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Int32(i32),
    #[serde(rename = "uint64")]
    UInt64(u64),
    Double(f64),
    Bool(bool),
    StringList(Vec<String>),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Int32(_) => PropertyType::Int32,
            PropertyValue::UInt64(_) => PropertyType::UInt64,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::StringList(_) => PropertyType::StringList,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "'{}'", s),
            PropertyValue::Int32(v) => write!(f, "{} (0x{:x})", v, v),
            PropertyValue::UInt64(v) => write!(f, "{} (0x{:x})", v, v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::StringList(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{}'", item)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int32(value)
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::UInt64(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::StringList(value)
    }
}

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a property-modified notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub key: String,
    pub kind: ChangeKind,
}

impl PropertyChange {
    pub fn new(key: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }
}

/// Outcome of [`PropertyBag::merge_from`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Keys that were added or changed in the target
    pub changes: Vec<PropertyChange>,
    /// Keys skipped because the target already holds them with another type
    pub conflicts: Vec<PropertyError>,
}

/// A typed key/value map describing one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag {
    entries: BTreeMap<String, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    ///
    /// Returns the resulting change, or `None` when the key already held
    /// exactly this value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<Option<PropertyChange>, PropertyError> {
        let key = key.into();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                if existing.property_type() != value.property_type() {
                    return Err(PropertyError::TypeMismatch {
                        existing: existing.property_type(),
                        attempted: value.property_type(),
                        key,
                    });
                }
                if *existing == value {
                    return Ok(None);
                }
                *existing = value;
                Ok(Some(PropertyChange::new(key, ChangeKind::Modified)))
            }
            None => {
                self.entries.insert(key.clone(), value);
                Ok(Some(PropertyChange::new(key, ChangeKind::Added)))
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<&PropertyValue, PropertyError> {
        self.entries
            .get(key)
            .ok_or_else(|| PropertyError::NotFound(key.to_string()))
    }

    pub fn get_type(&self, key: &str) -> Option<PropertyType> {
        self.entries.get(key).map(PropertyValue::property_type)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(PropertyValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(PropertyValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_uint64(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(PropertyValue::UInt64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(PropertyValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(PropertyValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_strlist(&self, key: &str) -> Option<&[String]> {
        match self.entries.get(key) {
            Some(PropertyValue::StringList(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy properties from `other` into this bag.
    ///
    /// With a filter, only keys starting with one of the given prefixes
    /// (e.g. `"usb."`) are copied. Keys already present with a different type
    /// are skipped and reported instead of aborting the merge.
    pub fn merge_from(&mut self, other: &PropertyBag, filter: Option<&[String]>) -> MergeReport {
        let mut report = MergeReport::default();
        for (key, value) in &other.entries {
            if let Some(prefixes) = filter {
                if !prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                    continue;
                }
            }
            match self.set(key.clone(), value.clone()) {
                Ok(Some(change)) => report.changes.push(change),
                Ok(None) => {}
                Err(e) => report.conflicts.push(e),
            }
        }
        report
    }

    /// True iff every key in `keys` is present in both bags with equal values.
    pub fn matches(&self, other: &PropertyBag, keys: &[String]) -> bool {
        keys.iter().all(|key| match (self.entries.get(key), other.entries.get(key)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }

    /// Apply a changeset atomically.
    ///
    /// All operations are type-checked before anything is written, so on error
    /// the bag is unchanged. The returned changes are coalesced per key: a key
    /// set and later removed within the same changeset yields no change.
    pub fn apply(&mut self, changeset: &Changeset) -> Result<Vec<PropertyChange>, PropertyError> {
        let mut pending: HashMap<&str, Option<PropertyType>> = HashMap::new();
        for op in &changeset.ops {
            match op {
                ChangeOp::Set { key, value } => {
                    let current = match pending.get(key.as_str()) {
                        Some(t) => *t,
                        None => self.get_type(key),
                    };
                    if let Some(existing) = current {
                        if existing != value.property_type() {
                            return Err(PropertyError::TypeMismatch {
                                key: key.clone(),
                                existing,
                                attempted: value.property_type(),
                            });
                        }
                    }
                    pending.insert(key, Some(value.property_type()));
                }
                ChangeOp::Remove { key } => {
                    pending.insert(key, None);
                }
            }
        }

        let mut touched: Vec<&str> = Vec::new();
        for op in &changeset.ops {
            let key = op.key();
            if !touched.contains(&key) {
                touched.push(key);
            }
        }
        let before: Vec<(&str, Option<PropertyValue>)> = touched
            .iter()
            .map(|k| (*k, self.entries.get(*k).cloned()))
            .collect();

        for op in &changeset.ops {
            match op {
                ChangeOp::Set { key, value } => {
                    self.set(key.clone(), value.clone())?;
                }
                ChangeOp::Remove { key } => {
                    self.entries.remove(key);
                }
            }
        }

        let changes = before
            .into_iter()
            .filter_map(|(key, old)| {
                let kind = match (old, self.entries.get(key)) {
                    (None, Some(_)) => ChangeKind::Added,
                    (Some(_), None) => ChangeKind::Removed,
                    (Some(a), Some(b)) if a != *b => ChangeKind::Modified,
                    _ => return None,
                };
                Some(PropertyChange::new(key, kind))
            })
            .collect();
        Ok(changes)
    }
}

/// One mutation inside a [`Changeset`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    Set { key: String, value: PropertyValue },
    Remove { key: String },
}

impl ChangeOp {
    pub fn key(&self) -> &str {
        match self {
            ChangeOp::Set { key, .. } | ChangeOp::Remove { key } => key,
        }
    }
}

/// A batch of property mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    ops: Vec<ChangeOp>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.ops.push(ChangeOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.ops.push(ChangeOp::Remove { key: key.into() });
        self
    }

    pub fn push(&mut self, op: ChangeOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut bag = PropertyBag::new();
        let change = bag.set("usb.vendor_id", 0x0781).unwrap();
        assert_eq!(change, Some(PropertyChange::new("usb.vendor_id", ChangeKind::Added)));
        assert_eq!(bag.get_int("usb.vendor_id"), Some(0x0781));
        assert_eq!(bag.get("usb.vendor_id").unwrap(), &PropertyValue::Int32(0x0781));
        assert!(matches!(bag.get("usb.serial"), Err(PropertyError::NotFound(_))));
    }

    #[test]
    fn test_set_same_value_is_no_change() {
        let mut bag = PropertyBag::new();
        bag.set("info.product", "Cruzer").unwrap();
        assert_eq!(bag.set("info.product", "Cruzer").unwrap(), None);
        assert_eq!(
            bag.set("info.product", "Cruzer Blade").unwrap(),
            Some(PropertyChange::new("info.product", ChangeKind::Modified))
        );
    }

    #[test]
    fn test_type_is_fixed_once_set() {
        let mut bag = PropertyBag::new();
        bag.set("usb.bus_number", 3).unwrap();
        let err = bag.set("usb.bus_number", "3").unwrap_err();
        assert_eq!(
            err,
            PropertyError::TypeMismatch {
                key: "usb.bus_number".to_string(),
                existing: PropertyType::Int32,
                attempted: PropertyType::String,
            }
        );
        assert_eq!(bag.get_int("usb.bus_number"), Some(3));

        // Removing the key releases its type
        bag.remove("usb.bus_number");
        bag.set("usb.bus_number", "3").unwrap();
        assert_eq!(bag.get_string("usb.bus_number"), Some("3"));
    }

    #[test]
    fn test_changeset_is_atomic() {
        let mut bag = PropertyBag::new();
        bag.set("battery.charge_level", 40).unwrap();
        bag.set("battery.present", true).unwrap();

        let bad = Changeset::new()
            .set("battery.charge_level", 41)
            .set("battery.present", "yes");
        assert!(bag.apply(&bad).is_err());
        assert_eq!(bag.get_int("battery.charge_level"), Some(40));
        assert_eq!(bag.get_bool("battery.present"), Some(true));

        let good = Changeset::new()
            .set("battery.charge_level", 41)
            .set("battery.rechargeable", true);
        let changes = bag.apply(&good).unwrap();
        assert_eq!(
            changes,
            vec![
                PropertyChange::new("battery.charge_level", ChangeKind::Modified),
                PropertyChange::new("battery.rechargeable", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn test_changeset_coalesces_per_key() {
        let mut bag = PropertyBag::new();
        bag.set("a", 1).unwrap();

        let changes = bag
            .apply(
                &Changeset::new()
                    .set("b", "tmp")
                    .remove("b")
                    .set("a", 2)
                    .set("a", 1)
                    .remove("a")
                    .set("a", "now a string"),
            )
            .unwrap();
        assert_eq!(changes, vec![PropertyChange::new("a", ChangeKind::Modified)]);
        assert_eq!(bag.get_string("a"), Some("now a string"));
        assert!(!bag.contains("b"));
    }

    #[test]
    fn test_merge_respects_namespace_filter() {
        let mut target = PropertyBag::new();
        target.set("usb.port_number", 1).unwrap();
        target.set("info.product", "User label").unwrap();
        target.set("storage.policy.mount", true).unwrap();

        let mut fresh = PropertyBag::new();
        fresh.set("usb.port_number", 4).unwrap();
        fresh.set("usb.bus_number", 2).unwrap();
        fresh.set("info.product", "Probed label").unwrap();

        let filter = vec!["usb.".to_string()];
        let report = target.merge_from(&fresh, Some(&filter));
        assert_eq!(report.changes.len(), 2);
        assert!(report.conflicts.is_empty());
        assert_eq!(target.get_int("usb.port_number"), Some(4));
        assert_eq!(target.get_int("usb.bus_number"), Some(2));
        assert_eq!(target.get_string("info.product"), Some("User label"));
        assert_eq!(target.get_bool("storage.policy.mount"), Some(true));
    }

    #[test]
    fn test_merge_skips_conflicting_types() {
        let mut target = PropertyBag::new();
        target.set("pci.vendor", 0x8086).unwrap();

        let mut fresh = PropertyBag::new();
        fresh.set("pci.vendor", "Intel").unwrap();
        fresh.set("pci.product_id", 0x1234).unwrap();

        let report = target.merge_from(&fresh, None);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(target.get_int("pci.vendor"), Some(0x8086));
        assert_eq!(target.get_int("pci.product_id"), Some(0x1234));
    }

    #[test]
    fn test_matches_requires_all_keys_present() {
        let mut a = PropertyBag::new();
        a.set("linux.sysfs_path", "/sys/devices/usb1/1-1").unwrap();
        a.set("usb.port_number", 1).unwrap();
        let mut b = a.clone();
        b.set("usb.port_number", 2).unwrap();

        let path = vec!["linux.sysfs_path".to_string()];
        assert!(a.matches(&b, &path));
        assert!(!a.matches(&b, &["usb.port_number".to_string()]));
        assert!(!a.matches(&PropertyBag::new(), &path));
    }

    #[test]
    fn test_value_serialization_keeps_type() {
        let value = PropertyValue::UInt64(42);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"uint64":42}"#);
        let back: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.property_type(), PropertyType::UInt64);
    }
}
