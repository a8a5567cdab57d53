//! Enable policy
//!
//! With `auto_enable` set, every device that finishes probing is moved from
//! `disabled` to `enabled`. Devices committed while still waiting for their
//! parent are enabled once the probe pass releases them. A device disabled by
//! hand later on is left alone.

use halcyon_core::{DeviceEvent, DeviceState, DeviceStore, Udi, WatchFilter};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn spawn_auto_enable(store: Arc<DeviceStore>) -> JoinHandle<()> {
    let mut watcher = store.watch(WatchFilter::All);
    tokio::spawn(async move {
        let mut waiting: HashSet<Udi> = HashSet::new();
        while let Some(event) = watcher.recv().await {
            let udi = match event {
                DeviceEvent::DeviceAdded { udi } => udi,
                DeviceEvent::StateChanged {
                    udi,
                    state: DeviceState::Disabled,
                } if waiting.contains(&udi) => {
                    waiting.remove(&udi);
                    udi
                }
                DeviceEvent::DeviceRemoved { udi } => {
                    waiting.remove(&udi);
                    continue;
                }
                _ => continue,
            };

            match store.find_by_udi(udi.as_str()).await.map(|d| d.state) {
                Some(DeviceState::Disabled) => {
                    match store.set_state(udi.as_str(), DeviceState::Enabled).await {
                        Ok(()) => info!(udi = %udi, "Device enabled by policy"),
                        Err(e) => warn!(udi = %udi, error = %e, "Cannot enable device"),
                    }
                }
                Some(DeviceState::NeedsInfo) => {
                    debug!(udi = %udi, "Waiting for device to finish probing");
                    waiting.insert(udi);
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_state(store: &DeviceStore, udi: &str, state: DeviceState) {
        for _ in 0..100 {
            if store.find_by_udi(udi).await.map(|d| d.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never reached {:?}", udi, state);
    }

    #[tokio::test]
    async fn test_new_devices_are_enabled() {
        let store = Arc::new(DeviceStore::new());
        let _policy = spawn_auto_enable(store.clone());

        store
            .commit(store.create_temporary(), Udi::new("pci_8086_a36d"))
            .await
            .unwrap();
        wait_for_state(&store, "pci_8086_a36d", DeviceState::Enabled).await;
    }

    #[tokio::test]
    async fn test_waits_for_probe_to_finish() {
        let store = Arc::new(DeviceStore::new());
        let _policy = spawn_auto_enable(store.clone());

        store
            .commit_with_state(
                store.create_temporary(),
                Udi::new("usb_0781_5567_0100_noserial"),
                DeviceState::NeedsInfo,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            store.find_by_udi("usb_0781_5567_0100_noserial").await.unwrap().state,
            DeviceState::NeedsInfo
        );

        store
            .set_state("usb_0781_5567_0100_noserial", DeviceState::Disabled)
            .await
            .unwrap();
        wait_for_state(&store, "usb_0781_5567_0100_noserial", DeviceState::Enabled).await;
    }

    #[tokio::test]
    async fn test_manual_disable_sticks() {
        let store = Arc::new(DeviceStore::new());
        let _policy = spawn_auto_enable(store.clone());

        store
            .commit(store.create_temporary(), Udi::new("pci_10de_1c82"))
            .await
            .unwrap();
        wait_for_state(&store, "pci_10de_1c82", DeviceState::Enabled).await;

        store
            .set_state("pci_10de_1c82", DeviceState::Disabled)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            store.find_by_udi("pci_10de_1c82").await.unwrap().state,
            DeviceState::Disabled
        );
    }
}
