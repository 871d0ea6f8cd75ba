//! Artifact store for uploaded images
//! Uses Apache Arrow object_store crate
//!
//! Files live flat under the configured root. The local filesystem backend
//! stages each put in a temporary file and renames it into place, so an
//! artifact is either absent or fully written.

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::{ObjectStore, path::Path as StoragePath};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata returned after upload
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub key: String,
    pub size: usize,
}

/// Storage client wrapping object_store
#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl StorageClient {
    /// Filesystem-backed store rooted at `root`, created if missing
    pub fn local(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;

        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self {
            store: Arc::new(store),
            location: root.display().to_string(),
        })
    }

    /// Create in-memory storage for testing/development
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            location: "memory".to_string(),
        }
    }

    /// Where artifacts are kept, for logging
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Write an artifact under `key`, replacing nothing partially
    pub async fn upload(&self, key: &str, data: Bytes) -> Result<UploadMetadata> {
        let path = artifact_path(key)?;
        let size = data.len();

        self.store.put(&path, data.into()).await?;

        tracing::info!(key, size, "Uploaded to storage");

        Ok(UploadMetadata {
            key: key.to_string(),
            size,
        })
    }

    /// Size in bytes of the artifact, or `None` if it does not exist
    pub async fn size_of(&self, key: &str) -> Result<Option<u64>> {
        let path = artifact_path(key)?;

        match self.store.head(&path).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check the backend with a listing of the root
    pub async fn health_check(&self) -> Result<()> {
        self.store.list_with_delimiter(None).await?;
        Ok(())
    }
}

/// Artifacts are a single path segment directly under the root
fn artifact_path(key: &str) -> Result<StoragePath> {
    if key.is_empty() || key.contains('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    StoragePath::parse(key).map_err(|_| StorageError::InvalidKey(key.to_string()))
}
