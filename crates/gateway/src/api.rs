//! HTTP API handlers for the checkbox grid.
//!
//! Routes (mounted by [`crate::ws_server::create_router`]):
//! - GET /api/v1/checkbox - Full grid snapshot
//! - PATCH /api/v1/checkbox?row=&column=&value= - Write one cell
//! - GET /api/v1/redis - Store connectivity probe
//! - DELETE /api/v1/redis - Clear every grid cell

use crate::error::GatewayError;
use crate::ws_server::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use grid_store::GridSnapshot;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Raw query parameters for a cell write.
///
/// Kept as strings so each malformed field gets its own error message.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateParams {
    pub row: Option<String>,
    pub column: Option<String>,
    pub value: Option<String>,
}

/// A validated cell write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellUpdate {
    pub row: i64,
    pub column: i64,
    pub value: bool,
}

impl UpdateParams {
    /// Validate the query. Coordinate range is checked later by the service.
    pub fn parse(&self) -> Result<CellUpdate, ApiError> {
        let (row, column, value) = match (
            non_empty(&self.row),
            non_empty(&self.column),
            non_empty(&self.value),
        ) {
            (Some(r), Some(c), Some(v)) => (r, c, v),
            _ => {
                return Err(ApiError::BadRequest(
                    "Missing required parameters: row, column, and value are required".to_string(),
                ))
            }
        };

        let row = row.parse::<i64>().map_err(|_| {
            ApiError::BadRequest("Invalid row parameter: must be an integer".to_string())
        })?;
        let column = column.parse::<i64>().map_err(|_| {
            ApiError::BadRequest("Invalid column parameter: must be an integer".to_string())
        })?;
        let value = match value {
            "true" => true,
            "false" => false,
            _ => {
                return Err(ApiError::BadRequest(
                    "Invalid value parameter: must be 'true' or 'false'".to_string(),
                ))
            }
        };

        Ok(CellUpdate { row, column, value })
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    message: String,
    data: CellUpdate,
}

#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    status: String,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    status: String,
    removed: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Full grid snapshot, keyed by store key.
pub async fn get_checkboxes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GridSnapshot>, ApiError> {
    match state.service.snapshot().await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => {
            error!("Failed to get checkboxes: {:?}", e);
            Err(ApiError::Internal(format!("Failed to get checkboxes: {}", e)))
        }
    }
}

/// Write one cell and notify every viewer.
pub async fn update_checkbox(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpdateParams>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let update = params.parse()?;

    match state
        .service
        .write_cell(update.row, update.column, update.value)
        .await
    {
        Ok(_) => Ok(Json(UpdateResponse {
            message: "Checkbox state updated successfully".to_string(),
            data: update,
        })),
        Err(GatewayError::Store(e @ grid_store::Error::InvalidCoordinate { .. })) => {
            Err(ApiError::BadRequest(e.to_string()))
        }
        Err(e) => {
            error!(
                "Failed to update checkbox ({},{}): {:?}",
                update.row, update.column, e
            );
            Err(ApiError::Internal(format!(
                "Failed to update checkbox state: {}",
                e
            )))
        }
    }
}

/// Store connectivity probe.
pub async fn probe_store(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProbeResponse>, ApiError> {
    match state.service.store().ping().await {
        Ok(()) => Ok(Json(ProbeResponse {
            status: "ok".to_string(),
            message: "Redis is working properly".to_string(),
        })),
        Err(e) => {
            error!("Store probe failed: {:?}", e);
            Err(ApiError::Internal(format!("Failed to reach Redis: {}", e)))
        }
    }
}

/// Remove every grid cell. Viewers are not notified.
pub async fn clear_store(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearResponse>, ApiError> {
    match state.service.store().clear().await {
        Ok(removed) => {
            info!("Cleared {} cells on request", removed);
            counter!("checkbox_clears_total").increment(1);
            Ok(Json(ClearResponse {
                status: "cleared".to_string(),
                removed,
            }))
        }
        Err(e) => {
            error!("Failed to clear grid: {:?}", e);
            Err(ApiError::Internal(format!(
                "Failed to clear Redis database: {}",
                e
            )))
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error types.
#[derive(Debug, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
