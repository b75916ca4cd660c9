//! HTTP and WebSocket server using Axum.

use crate::api;
use crate::sync::SyncService;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

/// Shared application state.
pub struct AppState {
    pub service: SyncService,
}

/// Create the HTTP router.
///
/// Streaming and admin endpoints are served both at the root and under
/// `/api/v1`; the cell API lives under `/api/v1` only.
pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route(
            "/checkbox",
            get(api::get_checkboxes).patch(api::update_checkbox),
        )
        .route("/redis", get(api::probe_store).delete(api::clear_store))
        .route("/ws", get(ws_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/redis", get(api::probe_store).delete(api::clear_store))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    counter!("checkbox_health_checks_total").increment(1);
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.service.registry().size(),
    })
}

/// WebSocket upgrade handler.
///
/// A request that is not a valid upgrade is rejected before any connection
/// state exists.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Rejected WebSocket upgrade: {}", rejection);
            counter!("checkbox_ws_upgrade_failures_total").increment(1);
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(|e| {
        warn!("WebSocket upgrade failed: {}", e);
        counter!("checkbox_ws_upgrade_failures_total").increment(1);
    })
    .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Hand an upgraded connection to the synchronization service.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket upgraded");
    let (ws_tx, ws_rx) = socket.split();
    state.service.on_connect(ws_tx, ws_rx).await;
}
