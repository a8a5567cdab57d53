//! WebSocket change stream

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use halcyon_core::{Device, DeviceEvent, Udi, WatchFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::AppState;

/// Restrict the stream to one device or one capability
#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    udi: Option<String>,
    capability: Option<String>,
}

impl WatchQuery {
    fn filter(&self) -> WatchFilter {
        match (&self.udi, &self.capability) {
            (Some(udi), _) => WatchFilter::Udi(Udi::new(udi.as_str())),
            (None, Some(capability)) => WatchFilter::Capability(capability.clone()),
            (None, None) => WatchFilter::All,
        }
    }
}

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    /// Devices matching the filter at connect time
    #[serde(rename = "snapshot")]
    Snapshot(Vec<Device>),
    #[serde(rename = "event")]
    Event(DeviceEvent),
    #[serde(rename = "pong")]
    Pong,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WatchQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.filter()))
}

fn snapshot_matches(filter: &WatchFilter, device: &Device) -> bool {
    match filter {
        WatchFilter::All => true,
        WatchFilter::Udi(udi) => &device.udi == udi,
        WatchFilter::Capability(capability) => device.has_capability(capability),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, filter: WatchFilter) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before taking the snapshot so nothing falls in between
    let mut watcher = state.store.watch(filter.clone());

    info!(watcher = watcher.id(), filter = ?filter, "WebSocket client connected");

    let devices: Vec<Device> = state
        .store
        .all_devices(false)
        .await
        .into_iter()
        .filter(|d| snapshot_matches(&filter, d))
        .collect();
    if let Ok(json) = serde_json::to_string(&WsMessage::Snapshot(devices)) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = watcher.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let Ok(json) = serde_json::to_string(&WsMessage::Event(event)) {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            if let Ok(pong) = serde_json::to_string(&WsMessage::Pong) {
                                if sender.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(watcher = watcher.id(), "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_to_filter() {
        let query = WatchQuery {
            udi: Some("pci_8086_a36d".to_string()),
            capability: Some("usb_host".to_string()),
        };
        assert_eq!(query.filter(), WatchFilter::Udi(Udi::new("pci_8086_a36d")));

        let query = WatchQuery {
            udi: None,
            capability: Some("storage".to_string()),
        };
        assert_eq!(query.filter(), WatchFilter::Capability("storage".to_string()));
        assert_eq!(WatchQuery::default().filter(), WatchFilter::All);
    }

    #[test]
    fn test_event_message_shape() {
        let msg = WsMessage::Event(DeviceEvent::DeviceAdded {
            udi: Udi::new("usb_0781_5567_0100_noserial"),
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["data"]["type"], "device_added");
        assert_eq!(json["data"]["udi"], "usb_0781_5567_0100_noserial");
    }
}
