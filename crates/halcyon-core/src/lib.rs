//! Halcyon Core - Property bags, device records and the global device list
//!
//! This crate provides the foundational types for the Halcyon system:
//! - Typed property bags with atomic changesets
//! - Device records and the temporary devices probers fill in before commit
//! - The device store: global device list, property index, lifecycle
//! - Change notification for watchers
//! - State file records that let persistent devices survive a restart
//! - Topology tree for parent/child device relationships

pub mod device;
pub mod notify;
pub mod persist;
pub mod property;
pub mod store;
pub mod topology;

pub use device::{Device, DeviceState, TemporaryDevice, Udi};
pub use notify::{ChangeNotifier, DeviceEvent, WatchFilter, Watcher};
pub use persist::{PersistError, PersistedDevice, StateFile};
pub use property::{
    ChangeKind, ChangeOp, Changeset, MergeReport, PropertyBag, PropertyChange, PropertyError,
    PropertyType, PropertyValue,
};
pub use store::{DeviceStore, StoreError};
pub use topology::{Topology, TopologyGraph, TopologyNode};
