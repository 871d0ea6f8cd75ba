//! Upload submission: persist the artifact, then publish a task referencing it
//!
//! ## Flow
//! 1. Validate the client filename
//! 2. Generate a UUIDv4 task id and compose `<task_id>_<filename>`
//! 3. Write the bytes to the artifact store (fully visible before step 4)
//! 4. Connect, declare the durable task queue, publish the stored filename
//!    with persistent delivery, close the connection
//!
//! A failed write publishes nothing. A failed publish after a successful
//! write leaves the artifact orphaned; submission is not retried here since
//! a blind retry could enqueue the same artifact twice.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::{QueueChannel, QueueConnector, QueueError};
use crate::storage::{StorageClient, StorageError};

/// Separator between task id and original filename in stored names
pub const TASK_ID_SEPARATOR: char = '_';

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("invalid filename '{0}'")]
    InvalidFilename(String),

    #[error("artifact write failed: {0}")]
    Storage(#[from] StorageError),

    #[error("task enqueue failed: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, ProduceError>;

/// Accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: Uuid,
    pub stored_filename: String,
}

/// Stored name for an artifact: `<task_id>_<original_filename>`
pub fn stored_filename(task_id: &Uuid, original_filename: &str) -> String {
    format!("{}{}{}", task_id, TASK_ID_SEPARATOR, original_filename)
}

/// The original filename must be a single, non-empty path component
pub fn validate_filename(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(ProduceError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

pub struct Producer {
    storage: Arc<StorageClient>,
    connector: Arc<dyn QueueConnector>,
    queue: String,
}

impl Producer {
    pub fn new(
        storage: Arc<StorageClient>,
        connector: Arc<dyn QueueConnector>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            connector,
            queue: queue.into(),
        }
    }

    pub fn storage(&self) -> &Arc<StorageClient> {
        &self.storage
    }

    pub fn connector(&self) -> &Arc<dyn QueueConnector> {
        &self.connector
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Persist `content` and enqueue a task for it
    pub async fn submit(&self, original_filename: &str, content: Bytes) -> Result<Submission> {
        validate_filename(original_filename)?;

        let task_id = Uuid::new_v4();
        let stored = stored_filename(&task_id, original_filename);

        self.storage.upload(&stored, content).await?;

        if let Err(err) = self.enqueue(&stored).await {
            warn!(
                %task_id,
                filename = %stored,
                error = %err,
                "Task not enqueued, artifact left without a task"
            );
            return Err(err.into());
        }

        info!(%task_id, filename = %stored, queue = %self.queue, "Task submitted");

        Ok(Submission {
            task_id,
            stored_filename: stored,
        })
    }

    /// Publish on a connection scoped to this call
    async fn enqueue(&self, stored_filename: &str) -> std::result::Result<(), QueueError> {
        let channel = self.connector.connect().await?;

        let result = publish_task(&*channel, &self.queue, stored_filename).await;

        if let Err(err) = channel.close().await {
            warn!(error = %err, "Failed to close broker connection");
        }

        result
    }
}

async fn publish_task(
    channel: &dyn QueueChannel,
    queue: &str,
    stored_filename: &str,
) -> std::result::Result<(), QueueError> {
    channel.declare_queue(queue, true).await?;
    channel
        .publish(queue, stored_filename.as_bytes(), true)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{LocalBroker, Subscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const QUEUE: &str = "task_queue";

    #[test]
    fn test_stored_filename_layout() {
        let task_id = Uuid::new_v4();
        let stored = stored_filename(&task_id, "my_cat photo.PNG");

        assert!(stored.starts_with(&format!("{}_", task_id)));
        let (_, original) = stored.split_once(TASK_ID_SEPARATOR).unwrap();
        assert_eq!(original, "my_cat photo.PNG");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("cat_01.png").is_ok());
        assert!(validate_filename(".hidden.jpg").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("dir/cat.png").is_err());
        assert!(validate_filename("dir\\cat.png").is_err());
    }

    #[tokio::test]
    async fn test_submit_persists_then_publishes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageClient::local(temp_dir.path().join("images")).unwrap());
        let broker = LocalBroker::open(temp_dir.path().join("broker")).unwrap();
        let producer = Producer::new(storage, Arc::new(broker.connector()), QUEUE);

        let content = Bytes::from_static(b"not really a png");
        let submission = producer.submit("cat_01.png", content.clone()).await.unwrap();

        assert_eq!(
            submission.stored_filename,
            format!("{}_cat_01.png", submission.task_id)
        );
        let on_disk =
            std::fs::read(temp_dir.path().join("images").join(&submission.stored_filename))
                .unwrap();
        assert_eq!(on_disk, content);

        assert_eq!(broker.depth(QUEUE).unwrap(), 1);
        let channel = broker.connector().connect().await.unwrap();
        let mut subscription = channel.subscribe(QUEUE).await.unwrap();
        let delivery = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), submission.stored_filename.as_bytes());
    }

    #[tokio::test]
    async fn test_task_ids_are_unique() {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::open(temp_dir.path()).unwrap();
        let producer = Producer::new(
            Arc::new(StorageClient::in_memory()),
            Arc::new(broker.connector()),
            QUEUE,
        );

        let first = producer.submit("dog.jpg", Bytes::new()).await.unwrap();
        let second = producer.submit("dog.jpg", Bytes::new()).await.unwrap();

        assert_ne!(first.task_id, second.task_id);
        assert_ne!(first.stored_filename, second.stored_filename);
        assert_eq!(broker.depth(QUEUE).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_filename_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::open(temp_dir.path()).unwrap();
        let producer = Producer::new(
            Arc::new(StorageClient::in_memory()),
            Arc::new(broker.connector()),
            QUEUE,
        );

        let err = producer.submit("", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ProduceError::InvalidFilename(_)));
        // Queue was never declared
        assert!(broker.depth(QUEUE).is_err());
    }

    #[tokio::test]
    async fn test_broker_down_fails_submission() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageClient::in_memory());
        let broker = LocalBroker::open(temp_dir.path()).unwrap();
        broker.close();

        let producer = Producer::new(storage.clone(), Arc::new(broker.connector()), QUEUE);
        let err = producer.submit("cat.png", Bytes::from_static(b"x")).await.unwrap_err();

        assert!(matches!(err, ProduceError::Queue(QueueError::Connection(_))));
    }

    /// Channel whose publish always fails; counts close calls
    struct FailingPublish {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueueChannel for FailingPublish {
        async fn declare_queue(&self, _name: &str, _durable: bool) -> crate::queue::Result<()> {
            Ok(())
        }

        async fn publish(
            &self,
            _queue: &str,
            _payload: &[u8],
            _persistent: bool,
        ) -> crate::queue::Result<()> {
            Err(QueueError::Publish("connection reset".to_string()))
        }

        async fn subscribe(&self, queue: &str) -> crate::queue::Result<Box<dyn Subscription>> {
            Err(QueueError::QueueNotFound(queue.to_string()))
        }

        async fn close(&self) -> crate::queue::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingConnector {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueueConnector for FailingConnector {
        async fn connect(&self) -> crate::queue::Result<Box<dyn QueueChannel>> {
            Ok(Box::new(FailingPublish {
                closes: self.closes.clone(),
            }))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[tokio::test]
    async fn test_publish_failure_still_closes_connection() {
        let closes = Arc::new(AtomicUsize::new(0));
        let storage = Arc::new(StorageClient::in_memory());
        let producer = Producer::new(
            storage.clone(),
            Arc::new(FailingConnector {
                closes: closes.clone(),
            }),
            QUEUE,
        );

        let err = producer.submit("cat.png", Bytes::from_static(b"x")).await.unwrap_err();

        assert!(matches!(err, ProduceError::Queue(QueueError::Publish(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
