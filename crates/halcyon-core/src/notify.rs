//! Change notification for device list watchers
//!
//! Each watcher owns an unbounded queue. The store enqueues events while it
//! still holds its write lock, so events for one device reach every watcher in
//! the order the mutations happened. Delivery itself happens when the watcher
//! polls its queue from its own task: a slow or stalled watcher never blocks
//! the store or any other watcher, and nothing a watcher does can run inside
//! the publishing call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{DeviceState, Udi};
use crate::property::PropertyChange;

/// A change to the device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    DeviceAdded { udi: Udi },
    DeviceRemoved { udi: Udi },
    /// All changes of one changeset, delivered together
    PropertiesModified { udi: Udi, changes: Vec<PropertyChange> },
    CapabilityAdded { udi: Udi, capability: String },
    CapabilityRemoved { udi: Udi, capability: String },
    StateChanged { udi: Udi, state: DeviceState },
    ParentChanged { udi: Udi, parent: Option<Udi> },
}

impl DeviceEvent {
    pub fn udi(&self) -> &Udi {
        match self {
            DeviceEvent::DeviceAdded { udi }
            | DeviceEvent::DeviceRemoved { udi }
            | DeviceEvent::PropertiesModified { udi, .. }
            | DeviceEvent::CapabilityAdded { udi, .. }
            | DeviceEvent::CapabilityRemoved { udi, .. }
            | DeviceEvent::StateChanged { udi, .. }
            | DeviceEvent::ParentChanged { udi, .. } => udi,
        }
    }
}

/// Which events a watcher receives
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchFilter {
    #[default]
    All,
    Udi(Udi),
    /// Events for devices carrying this capability. Adding or removing the
    /// capability itself also matches.
    Capability(String),
}

impl WatchFilter {
    pub fn matches(&self, event: &DeviceEvent, capabilities: &BTreeSet<String>) -> bool {
        match self {
            WatchFilter::All => true,
            WatchFilter::Udi(udi) => event.udi() == udi,
            WatchFilter::Capability(cap) => {
                if capabilities.contains(cap) {
                    return true;
                }
                matches!(
                    event,
                    DeviceEvent::CapabilityAdded { capability, .. }
                    | DeviceEvent::CapabilityRemoved { capability, .. } if capability == cap
                )
            }
        }
    }
}

#[derive(Debug)]
struct WatcherSlot {
    id: u64,
    filter: WatchFilter,
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

#[derive(Debug, Default)]
struct NotifierInner {
    watchers: Mutex<Vec<WatcherSlot>>,
    next_id: AtomicU64,
}

/// Registry of watchers
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<WatcherSlot>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new watcher
    pub fn watch(&self, filter: WatchFilter) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(watcher = id, filter = ?filter, "Watcher registered");
        self.slots().push(WatcherSlot {
            id,
            filter: filter.clone(),
            tx,
        });
        Watcher { id, filter, rx }
    }

    /// Enqueue `event` once for every matching watcher.
    ///
    /// `capabilities` is the device's capability set at the time of the
    /// change. Watchers whose receiving end was dropped are pruned. Returns the
    /// number of watchers the event was queued for.
    pub fn publish(&self, event: &DeviceEvent, capabilities: &BTreeSet<String>) -> usize {
        let mut delivered = 0;
        self.slots().retain(|slot| {
            if !slot.filter.matches(event, capabilities) {
                return true;
            }
            match slot.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(watcher = slot.id, "Watcher dropped, unregistering");
                    false
                }
            }
        });
        delivered
    }

    pub fn watcher_count(&self) -> usize {
        self.slots().len()
    }
}

/// Receiving end of a watcher registration; dropping it unregisters
#[derive(Debug)]
pub struct Watcher {
    id: u64,
    filter: WatchFilter,
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Watcher {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &WatchFilter {
        &self.filter
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event
    pub fn drain(&mut self) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
