//! Task consumer
//!
//! Single receive loop that resolves each task's artifact, classifies it by
//! filename and acknowledges. Broker outages are bridged with bounded
//! exponential backoff; everything else stops the consumer.

pub mod backoff;
pub mod classify;
pub mod consumer;
pub mod runner;

pub use backoff::RetryPolicy;
pub use classify::Label;
pub use consumer::Consumer;
pub use runner::{TaskError, TaskOutcome, process_task};

use crate::queue::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: QueueError,
    },

    #[error("Consumer setup failed: {0}")]
    Setup(#[source] QueueError),

    #[error("Task handling failed: {0}")]
    Handler(#[from] TaskError),

    #[error("Queue error while consuming: {0}")]
    Queue(#[source] QueueError),
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Lifecycle of a [`Consumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Shutdown,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Shutdown => "shutdown",
        }
    }
}
