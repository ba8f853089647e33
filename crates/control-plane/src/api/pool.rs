// Worker pool routes

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use labelq_fleet::WorkerPoolController;
use tracing::error;

use super::common::{ErrorResponse, ListResponse};

/// App state for pool routes
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<WorkerPoolController>,
}

impl AppState {
    pub fn new(controller: Arc<WorkerPoolController>) -> Self {
        Self { controller }
    }
}

/// Create pool routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/pool", get(list_workers))
        .with_state(state)
}

/// GET /v1/pool - Slot names of live workers
pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<String>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .controller
        .live_workers()
        .await
        .map(|workers| Json(ListResponse::new(workers)))
        .map_err(|e| {
            error!("Failed to list workers: {}", e);
            ErrorResponse::new("Failed to list workers")
                .into_response(StatusCode::SERVICE_UNAVAILABLE)
        })
}
