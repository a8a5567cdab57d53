//! Halcyon Discovery - Turning probed hardware into committed devices
//!
//! This crate provides:
//! - Bus identity rules that compute stable candidate UDIs
//! - Identity resolution with suffix disambiguation and re-matching
//! - Parent lookup with bounded exponential backoff
//! - The probe coordinator for coldplug passes and hotplug events
//! - USB and PCI probers reading sysfs

pub mod coordinator;
pub mod identity;
pub mod locks;
pub mod overrides;
pub mod parent;
pub mod resolver;
pub mod sysfs;

pub use coordinator::{
    HotplugEvent, HotplugOutcome, ProbeCoordinator, ProbeError, ProbeFailure, ProbeReport,
    ProbeRequest,
};
pub use identity::{
    IdentityError, IdentityKey, IdentityRule, KeyedIdentity, PciIdentity, RuleSet,
    UsbDeviceIdentity, SYSFS_PATH_KEY,
};
pub use locks::KeyedLocks;
pub use overrides::{DeviceOverride, OverrideError, OverrideValue};
pub use parent::{BackoffConfig, ParentLinker, PropertyMatch, ResolveMode};
pub use resolver::{IdentityResolver, Resolution, ResolveError, ResolverConfig};
pub use sysfs::{Bus, ParseError, SysfsError, SysfsProber};
