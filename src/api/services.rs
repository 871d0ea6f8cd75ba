use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{
    error::ApiError,
    models::{HealthResponse, IMAGE_FIELD, UploadResponse},
    state::AppState,
};

/// Image upload endpoint (POST /upload)
///
/// ## Flow:
/// 1. Read the `image` multipart field and its client filename
/// 2. Store it as `<task_id>_<filename>` and publish a task for it
/// 3. Return the task id as `correlation_id` with the stored filename
///
/// The artifact is fully written before the task is published. If publishing
/// fails the request fails with 503 and the artifact stays behind.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let accepted = match multipart {
        Ok(multipart) => accept_upload(&state, multipart).await,
        Err(rejection) => Err(ApiError::InvalidUpload(rejection.body_text())),
    };

    match accepted {
        Ok(response) => {
            state.metrics.upload_accepted();
            state.metrics.task_published();
            Ok(Json(response))
        }
        Err(err) => {
            state.metrics.upload_failed();
            warn!(code = err.code(), error = %err, "Upload rejected");
            Err(err)
        }
    }
}

async fn accept_upload(state: &AppState, mut multipart: Multipart) -> Result<UploadResponse, ApiError> {
    let (filename, content) = read_image_field(&mut multipart).await?;
    let size = content.len();

    let submission = state.producer.submit(&filename, content).await?;

    info!(
        correlation_id = %submission.task_id,
        filename = %submission.stored_filename,
        size,
        "Upload accepted"
    );

    Ok(UploadResponse {
        correlation_id: submission.task_id.to_string(),
        filename: submission.stored_filename,
    })
}

/// First `image` field with its client filename; other fields are skipped
async fn read_image_field(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ApiError::InvalidUpload("image field has no filename".to_string()))?;
        let content = field.bytes().await?;

        return Ok((filename, content));
    }

    Err(ApiError::InvalidUpload(format!(
        "missing multipart field '{}'",
        IMAGE_FIELD
    )))
}

/// Health check endpoint (GET /health)
///
/// Checks the artifact store and opens (then closes) a broker connection.
/// Returns 503 Service Unavailable if any component is unhealthy.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();

    components.insert("api".to_string(), "healthy".to_string());

    let storage = match state.producer.storage().health_check().await {
        Ok(()) => "healthy".to_string(),
        Err(err) => format!("unhealthy: {}", err),
    };
    components.insert("storage".to_string(), storage);

    let broker = match state.producer.connector().connect().await {
        Ok(channel) => {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Health check channel close failed");
            }
            "healthy".to_string()
        }
        Err(err) => format!("unhealthy: {}", err),
    };
    components.insert("broker".to_string(), broker);

    let all_healthy = components.values().all(|status| status == "healthy");
    let (status_code, overall_status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
