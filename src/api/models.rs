//! Wire types for the upload API
//!
//! - `POST /upload` (multipart, field `image`) returns [`UploadResponse`]
//! - `GET /health` returns [`HealthResponse`]
//! - Failures return [`ErrorResponse`]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the multipart field carrying the image
pub const IMAGE_FIELD: &str = "image";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    /// Task id assigned to the upload
    pub correlation_id: String,
    /// Name the artifact was stored under: `<correlation_id>_<original name>`
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
