// Image labeling route
//
// POST / with a multipart `myfile` field. The request blocks until a worker
// has labeled the image or the result timeout elapsed.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    routing::post,
    Json, Router,
};
use labelq_fleet::Dispatcher;
use tracing::{error, info, warn};

use super::common::ErrorResponse;

/// Multipart field carrying the image
pub const IMAGE_FIELD: &str = "myfile";

/// Name used when the upload has no file name
const DEFAULT_FILE_NAME: &str = "image";

/// App state for the labeling route
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Create labeling routes
pub fn routes(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", post(label_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn no_image() -> ApiError {
    ErrorResponse::new("No image provided").into_response(StatusCode::BAD_REQUEST)
}

fn read_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("Upload exceeds size limit: {}", e);
        return ErrorResponse::new("Image too large").into_response(StatusCode::PAYLOAD_TOO_LARGE);
    }
    warn!("Malformed multipart body: {}", e);
    no_image()
}

/// POST / - Label an uploaded image
///
/// Responds with the label as a JSON string.
pub async fn label_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<String>, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Err(no_image());
    };

    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(read_error(e)),
        };
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
            .to_string();
        let data = field.bytes().await.map_err(read_error)?;
        upload = Some((file_name, data));
    }

    let Some((file_name, data)) = upload.filter(|(_, data)| !data.is_empty()) else {
        return Err(no_image());
    };

    match state.dispatcher.dispatch(&data, &file_name).await {
        Ok(Some(label)) => {
            info!(file_name = %file_name, label = %label, "image labeled");
            Ok(Json(label))
        }
        Ok(None) => Err(ErrorResponse::new("No result before timeout")
            .into_response(StatusCode::GATEWAY_TIMEOUT)),
        Err(e) => {
            error!(file_name = %file_name, "Failed to label image: {}", e);
            Err(ErrorResponse::new("Failed to label image")
                .into_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}
