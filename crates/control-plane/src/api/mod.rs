// HTTP API routes
//
// Each submodule handles one resource with its own AppState; `build_app`
// merges them under the health route and the trace layer.

pub mod common;
pub mod labels;
pub mod pool;

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use labelq_fleet::config::{parse_setting, ConfigError};
use labelq_fleet::{Dispatcher, WorkerPoolController};
use serde::Serialize;
use tower_http::trace::TraceLayer;

// Re-export common types
pub use common::{ErrorResponse, ListResponse};

/// Default cap on upload size
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl ApiConfig {
    /// Environment variables:
    /// - `LABELQ_HTTP_ADDR`: listen address (default: 0.0.0.0:9000)
    /// - `LABELQ_MAX_UPLOAD_BYTES`: upload size cap (default: 10 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("LABELQ_HTTP_ADDR") {
            config.addr = addr;
        }
        if let Some(raw) = lookup("LABELQ_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_setting("LABELQ_MAX_UPLOAD_BYTES", &raw)?;
        }
        if config.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "LABELQ_MAX_UPLOAD_BYTES",
                reason: "must be positive".to_string(),
            });
        }
        Ok(config)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full router
pub fn build_app(
    dispatcher: Arc<Dispatcher>,
    controller: Arc<WorkerPoolController>,
    max_upload_bytes: usize,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(labels::routes(labels::AppState::new(dispatcher), max_upload_bytes))
        .merge(pool::routes(pool::AppState::new(controller)))
        .layer(TraceLayer::new_for_http())
}
