use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::IntoResponse,
};
use thiserror::Error;

use super::models::ErrorResponse;
use crate::producer::ProduceError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("upload too large: {0}")]
    PayloadTooLarge(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("task queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidUpload(_) => "INVALID_UPLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Storage(_) => "STORAGE_ERROR",
            ApiError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ProduceError> for ApiError {
    fn from(value: ProduceError) -> Self {
        match value {
            ProduceError::InvalidFilename(_) => ApiError::InvalidUpload(value.to_string()),
            ProduceError::Storage(err) => ApiError::Storage(err.to_string()),
            ProduceError::Queue(err) => ApiError::QueueUnavailable(err.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(value: MultipartError) -> Self {
        // Body limit violations surface while reading fields
        if value.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(value.body_text())
        } else {
            ApiError::InvalidUpload(value.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueError;
    use crate::storage::StorageError;

    #[test]
    fn test_produce_errors_map_to_status() {
        let cases = [
            (
                ProduceError::InvalidFilename("..".into()),
                StatusCode::BAD_REQUEST,
                "INVALID_UPLOAD",
            ),
            (
                ProduceError::Storage(StorageError::InvalidKey("a/b".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
            ),
            (
                ProduceError::Queue(QueueError::Connection("refused".into())),
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_UNAVAILABLE",
            ),
        ];

        for (err, status, code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status_code(), status);
            assert_eq!(api.code(), code);
        }
    }
}
