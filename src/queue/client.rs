//! Broker-agnostic task queue primitives
//!
//! A [`QueueConnector`] opens a [`QueueChannel`] (connection + channel in AMQP
//! terms). Channels declare queues, publish payloads, and open a
//! [`Subscription`] that yields [`Delivery`] values with manual acknowledgment.

use async_trait::async_trait;

use super::error::Result;

/// Opens broker channels
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Establish a connection and a channel on it
    async fn connect(&self) -> Result<Box<dyn QueueChannel>>;

    /// Broker address for logging (credentials redacted)
    fn describe(&self) -> String;
}

/// One open channel on a broker connection
///
/// Dropping a channel without calling [`QueueChannel::close`] still releases
/// it, but close lets the caller observe errors.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Create the queue if absent; no-op if an identical queue exists
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    /// Enqueue a payload, returning once the broker accepted it
    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()>;

    /// Start consuming with manual acknowledgment
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>>;

    /// Close the channel and its connection. Unacked deliveries are requeued.
    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries from a single queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the channel or connection is gone.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}

/// Backend-specific acknowledgment
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Acknowledgment handle for exactly one delivery
///
/// `ack` consumes the handle, so a delivery cannot be acknowledged twice.
/// Dropping it without acking leaves the message to the broker's redelivery.
pub struct Acker {
    inner: Box<dyn Acknowledge>,
}

impl Acker {
    pub fn new(inner: impl Acknowledge + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.inner.ack().await
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker").finish_non_exhaustive()
    }
}

/// A message handed to the consumer
#[derive(Debug)]
pub struct Delivery {
    payload: Vec<u8>,
    redelivered: bool,
    acker: Acker,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Acker) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Set when the broker handed this message out before without an ack
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn into_parts(self) -> (Vec<u8>, bool, Acker) {
        (self.payload, self.redelivered, self.acker)
    }
}
