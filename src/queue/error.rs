use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Queue '{queue}' already exists with durable={existing}, requested durable={requested}")]
    QueueConflict {
        queue: String,
        existing: bool,
        requested: bool,
    },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The broker refused the operation on a live connection
    #[error("Broker refused operation: {0}")]
    Rejected(String),

    #[error("Invalid queue name: '{0}'")]
    InvalidQueueName(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),
}

impl QueueError {
    /// Whether the failure is transient broker unavailability
    ///
    /// The consumer retries only these; everything else is treated as a
    /// configuration or logic fault.
    pub fn is_connection(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue names are restricted to `[A-Za-z0-9_.-]+`
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}
