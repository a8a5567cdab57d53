//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/devices", get(api::list_devices))
        .route("/api/devices/{udi}", get(api::get_device))
        .route("/api/devices/{udi}/children", get(api::get_children))
        .route("/api/devices/{udi}/properties", post(api::update_properties))
        .route("/api/devices/{udi}/state", post(api::set_state))
        .route("/api/find", get(api::find_devices))
        .route("/api/tree", get(api::get_tree))
        .route("/api/hotplug", post(api::hotplug))
        .route("/api/probe", post(api::probe))
        .route("/api/save", post(api::save))
        // WebSocket change stream
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn run(
    state: Arc<AppState>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, "Starting API server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
