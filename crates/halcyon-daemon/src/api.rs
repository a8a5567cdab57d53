//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use halcyon_core::{
    Changeset, DeviceState, PropertyBag, PropertyType, PropertyValue, StoreError, Topology,
};
use halcyon_discovery::{
    Bus, HotplugEvent, HotplugOutcome, ProbeError, PropertyMatch, Resolution, ResolveError,
    SysfsError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn store_error_response(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) | StoreError::NotUnplugged(_) => StatusCode::CONFLICT,
        StoreError::ParentCycle { .. }
        | StoreError::InvalidTransition { .. }
        | StoreError::Property(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, e.to_string())
}

/// Map a failed hotplug to a status code by its underlying cause
fn hotplug_error_response(e: anyhow::Error) -> Response {
    let status = if let Some(probe) = e.downcast_ref::<ProbeError>() {
        match probe {
            ProbeError::NoSuchDevice { .. } => StatusCode::NOT_FOUND,
            ProbeError::Resolve(ResolveError::IdentityExhausted { .. }) => StatusCode::CONFLICT,
            ProbeError::Resolve(ResolveError::Identity(_) | ResolveError::UnknownBus(_)) => {
                StatusCode::BAD_REQUEST
            }
            ProbeError::Resolve(ResolveError::Store(_)) | ProbeError::Store(_) => {
                StatusCode::CONFLICT
            }
        }
    } else if e.downcast_ref::<SysfsError>().is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(status, format!("{:#}", e))
}

#[derive(Deserialize)]
pub struct ListQuery {
    /// Also list devices that are unplugged but remembered
    #[serde(default)]
    include_unplugged: bool,
}

/// List all devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.store.all_devices(query.include_unplugged).await)
}

/// Get a specific device by UDI, in any state
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(udi): Path<String>,
) -> impl IntoResponse {
    match state.store.find_by_udi(&udi).await {
        Some(device) => Json(device).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Device not found"),
    }
}

/// Live children of a device
pub async fn get_children(
    State(state): State<Arc<AppState>>,
    Path(udi): Path<String>,
) -> impl IntoResponse {
    if state.store.find_by_udi(&udi).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "Device not found");
    }
    Json(state.store.children(&udi).await).into_response()
}

/// Apply a changeset to a device's properties
pub async fn update_properties(
    State(state): State<Arc<AppState>>,
    Path(udi): Path<String>,
    Json(changeset): Json<Changeset>,
) -> impl IntoResponse {
    match state.store.apply_changeset(&udi, &changeset).await {
        Ok(changes) => {
            debug!(udi = %udi, changes = changes.len(), "Applied changeset");
            Json(changes).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct StateRequest {
    state: DeviceState,
}

/// Enable or disable a device
pub async fn set_state(
    State(state): State<Arc<AppState>>,
    Path(udi): Path<String>,
    Json(req): Json<StateRequest>,
) -> impl IntoResponse {
    match state.store.set_state(&udi, req.state).await {
        Ok(()) => {
            info!(udi = %udi, state = ?req.state, "Device state changed via API");
            match state.store.find_by_udi(&udi).await {
                Some(device) => Json(device).into_response(),
                None => error_response(StatusCode::NOT_FOUND, "Device not found"),
            }
        }
        Err(e) => store_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct FindQuery {
    key: String,
    value: String,
    /// Type of `value`; strings by default
    #[serde(default, rename = "type")]
    value_type: Option<PropertyType>,
}

fn parse_query_value(raw: &str, value_type: PropertyType) -> Result<PropertyValue, String> {
    let invalid = |e: &dyn std::fmt::Display| format!("invalid {} value {:?}: {}", value_type, raw, e);
    Ok(match value_type {
        PropertyType::String => PropertyValue::String(raw.to_string()),
        PropertyType::Int32 => {
            let parsed = match raw.strip_prefix("0x") {
                Some(hex) => i32::from_str_radix(hex, 16),
                None => raw.parse(),
            };
            PropertyValue::Int32(parsed.map_err(|e| invalid(&e))?)
        }
        PropertyType::UInt64 => PropertyValue::UInt64(raw.parse().map_err(|e| invalid(&e))?),
        PropertyType::Double => PropertyValue::Double(raw.parse().map_err(|e| invalid(&e))?),
        PropertyType::Bool => PropertyValue::Bool(raw.parse().map_err(|e| invalid(&e))?),
        PropertyType::StringList => {
            return Err(format!("cannot search by {} values", value_type));
        }
    })
}

/// Find live devices by property value
pub async fn find_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FindQuery>,
) -> impl IntoResponse {
    let value_type = query.value_type.unwrap_or(PropertyType::String);
    match parse_query_value(&query.value, value_type) {
        Ok(value) => Json(state.store.find_by_property(&query.key, &value).await).into_response(),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, msg),
    }
}

/// Device tree built from parent links
pub async fn get_tree(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let devices = state.store.all_devices(false).await;
    Json(Topology::from_devices(&devices).to_graph())
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HotplugAction {
    Add,
    Remove,
}

/// Hotplug notification. Either a sysfs path to probe, or the properties of
/// a device probed elsewhere.
#[derive(Deserialize)]
pub struct HotplugRequest {
    action: HotplugAction,
    bus: String,
    #[serde(default)]
    sysfs_path: Option<String>,
    #[serde(default)]
    properties: Option<PropertyBag>,
    /// Parent lookup for devices given by properties
    #[serde(default)]
    parent_sysfs_path: Option<String>,
}

#[derive(Serialize)]
pub struct HotplugResponse {
    action: HotplugAction,
    outcome: &'static str,
    udis: Vec<String>,
}

fn hotplug_response(action: HotplugAction, outcome: HotplugOutcome) -> HotplugResponse {
    let (outcome, udis) = match outcome {
        HotplugOutcome::Added(resolution) => {
            let kind = match &resolution {
                Resolution::Committed(_) => "committed",
                Resolution::Rematched(_) => "rematched",
                Resolution::Duplicate { .. } => "duplicate",
            };
            (kind, vec![resolution.udi().to_string()])
        }
        HotplugOutcome::Removed {
            unplugged,
            destroyed,
        } => (
            "removed",
            unplugged
                .iter()
                .chain(destroyed.iter())
                .map(|u| u.to_string())
                .collect(),
        ),
    };
    HotplugResponse {
        action,
        outcome,
        udis,
    }
}

/// Handle a hotplug notification
pub async fn hotplug(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HotplugRequest>,
) -> impl IntoResponse {
    info!(action = ?req.action, bus = %req.bus, path = ?req.sysfs_path, "Hotplug event");

    let result = match (req.action, req.sysfs_path, req.properties) {
        (HotplugAction::Add, Some(path), _) => match Bus::from_name(&req.bus) {
            Some(bus) => state.hotplug_path(bus, std::path::Path::new(&path)).await,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("cannot probe sysfs for bus {}", req.bus),
                )
            }
        },
        (HotplugAction::Add, None, Some(properties)) => {
            match state.request_from_properties(&req.bus, &properties) {
                Ok(mut request) => {
                    if let Some(parent) = req.parent_sysfs_path {
                        request = request.with_parent(PropertyMatch::sysfs_path(parent));
                    }
                    state.hotplug(HotplugEvent::Add(request)).await
                }
                Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
            }
        }
        (HotplugAction::Remove, Some(path), _) => {
            state
                .hotplug(HotplugEvent::Remove {
                    bus: req.bus.clone(),
                    lookup: PropertyMatch::sysfs_path(path),
                })
                .await
        }
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "add needs sysfs_path or properties, remove needs sysfs_path",
            )
        }
    };

    match result {
        Ok(outcome) => Json(hotplug_response(req.action, outcome)).into_response(),
        Err(e) => {
            warn!(bus = %req.bus, error = %e, "Hotplug event failed");
            hotplug_error_response(e)
        }
    }
}

/// Run a coldplug pass over the configured buses
pub async fn probe(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Manual probe requested");
    Json(state.coldplug().await)
}

/// Save persistent devices to the state file
pub async fn save(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.save().await {
        Ok(count) => Json(serde_json::json!({
            "status": "saved",
            "devices": count,
            "path": state.state_path().display().to_string(),
            "saved_at": Utc::now(),
        }))
        .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save state: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_value() {
        assert_eq!(
            parse_query_value("0x0781", PropertyType::Int32),
            Ok(PropertyValue::Int32(0x0781))
        );
        assert_eq!(
            parse_query_value("1921", PropertyType::Int32),
            Ok(PropertyValue::Int32(1921))
        );
        assert_eq!(
            parse_query_value("true", PropertyType::Bool),
            Ok(PropertyValue::Bool(true))
        );
        assert!(parse_query_value("abc", PropertyType::Double).is_err());
        assert!(parse_query_value("a", PropertyType::StringList).is_err());
    }

    #[test]
    fn test_store_error_status() {
        let response = store_error_response(StoreError::NotFound("x".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = store_error_response(StoreError::InvalidTransition {
            udi: "x".into(),
            from: DeviceState::Unplugged,
            to: DeviceState::Enabled,
        });
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
