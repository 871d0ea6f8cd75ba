use super::models::{BrokerBackend, Config};
use crate::queue::validate_queue_name;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid queue name '{0}' (allowed: ASCII letters, digits, '_', '-', '.')")]
    InvalidQueueName(String),

    #[error("Invalid AMQP address '{address}', expected 'amqp://' or 'amqps://'")]
    InvalidBrokerAddress { address: String },

    #[error("consumer.max_retries must be at least 1")]
    NoRetries,

    #[error("consumer.initial_retry_delay_secs must be positive")]
    ZeroRetryDelay,

    #[error("server.max_upload_bytes must be positive")]
    ZeroUploadLimit,

    #[error("storage.root must not be empty")]
    EmptyStorageRoot,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_broker(config)?;
    validate_consumer(config)?;
    validate_server(config)?;
    validate_storage(config)?;
    Ok(())
}

fn validate_broker(config: &Config) -> Result<(), ValidationError> {
    let broker = &config.broker;

    if validate_queue_name(&broker.queue).is_err() {
        return Err(ValidationError::InvalidQueueName(broker.queue.clone()));
    }

    // The address is only dialed by the AMQP backend
    if broker.backend == BrokerBackend::Amqp
        && !broker.address.starts_with("amqp://")
        && !broker.address.starts_with("amqps://")
    {
        return Err(ValidationError::InvalidBrokerAddress {
            address: broker.address.clone(),
        });
    }

    Ok(())
}

fn validate_consumer(config: &Config) -> Result<(), ValidationError> {
    if config.consumer.max_retries == 0 {
        return Err(ValidationError::NoRetries);
    }
    if config.consumer.initial_retry_delay_secs == 0 {
        return Err(ValidationError::ZeroRetryDelay);
    }
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    if config.server.max_upload_bytes.as_u64() == 0 {
        return Err(ValidationError::ZeroUploadLimit);
    }
    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.root.as_os_str().is_empty() {
        return Err(ValidationError::EmptyStorageRoot);
    }
    Ok(())
}
