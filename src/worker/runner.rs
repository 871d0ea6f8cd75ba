//! Task runner - processes individual task messages

use super::classify::{Label, classify_token, name_token};
use crate::storage::{StorageClient, StorageError};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding(#[from] std::string::FromUtf8Error),

    #[error("Malformed task payload: {0}")]
    MalformedPayload(String),

    #[error("Artifact lookup failed: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// What happened to one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Classified {
        filename: String,
        label: Label,
        size: u64,
    },
    /// The referenced artifact does not exist; the task is dropped
    MissingArtifact { filename: String },
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Classified {
                filename,
                label,
                size,
            } => write!(
                f,
                "Image {} contains a {}. Size: {} bytes.",
                filename, label, size
            ),
            TaskOutcome::MissingArtifact { filename } => {
                write!(f, "Image with filename {} not found.", filename)
            }
        }
    }
}

/// Process a single task payload
///
/// A missing artifact is an outcome, not an error: the file will never
/// appear, so the caller should acknowledge. Existence is checked before the
/// name is parsed, so any name without an artifact is dropped. Errors mean
/// the message must not be acknowledged.
pub async fn process_task(storage: &StorageClient, payload: Vec<u8>) -> Result<TaskOutcome> {
    let filename = String::from_utf8(payload)?;

    let size = match storage.size_of(&filename).await {
        Ok(Some(size)) => size,
        Ok(None) => return Ok(missing(filename)),
        // An unusable key cannot name an existing artifact either
        Err(StorageError::InvalidKey(_)) => return Ok(missing(filename)),
        Err(err) => return Err(err.into()),
    };

    let token = name_token(&filename)
        .ok_or_else(|| TaskError::MalformedPayload(filename.clone()))?;
    let label = classify_token(token);

    let outcome = TaskOutcome::Classified {
        filename,
        label,
        size,
    };
    info!(label = %label, size, "{}", outcome);

    Ok(outcome)
}

fn missing(filename: String) -> TaskOutcome {
    let outcome = TaskOutcome::MissingArtifact { filename };
    warn!("{}", outcome);
    outcome
}
