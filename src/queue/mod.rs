//! Durable task queue client
//!
//! One trait seam ([`QueueConnector`] → [`QueueChannel`] → [`Subscription`])
//! with two backends:
//! - [`AmqpConnector`]: RabbitMQ over AMQP 0-9-1
//! - [`LocalConnector`]: embedded Fjall broker with the same ack/redelivery
//!   semantics, for single-process deployments and tests

mod amqp;
mod client;
mod error;
mod local;

pub use amqp::{AmqpConnector, redact_credentials};
pub use client::{
    Acker, Acknowledge, Delivery, QueueChannel, QueueConnector, Subscription,
};
pub use error::{QueueError, Result, validate_queue_name};
pub use local::{LocalBroker, LocalConnector};

use crate::config::{BrokerBackend, BrokerConfig};
use std::sync::Arc;

/// Build the connector selected by configuration
///
/// For the local backend this opens the broker, so call it once per process.
pub fn connector_from_config(config: &BrokerConfig) -> Result<Arc<dyn QueueConnector>> {
    match config.backend {
        BrokerBackend::Amqp => Ok(Arc::new(AmqpConnector::new(config.address.clone()))),
        BrokerBackend::Local => {
            let broker = LocalBroker::open(&config.local_path)?;
            Ok(Arc::new(broker.connector()))
        }
    }
}
