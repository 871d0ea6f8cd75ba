use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// Upload server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Request body limit for `POST /upload`
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: ByteSize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_max_upload_bytes() -> ByteSize {
    ByteSize(64 * 1024 * 1024) // 64 MB
}

/// Artifact store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding uploaded images
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/data/images")
}

/// Broker backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    #[default]
    Amqp,
    Local,
}

/// Message broker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    /// AMQP URI, used by the `amqp` backend
    #[serde(default = "default_broker_address")]
    pub address: String,
    /// Fjall directory, used by the `local` backend
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            address: default_broker_address(),
            local_path: default_local_path(),
            queue: default_queue(),
        }
    }
}

fn default_broker_address() -> String {
    "amqp://rabbitmq:5672/%2f".to_string()
}

fn default_local_path() -> PathBuf {
    PathBuf::from("data/broker")
}

fn default_queue() -> String {
    "task_queue".to_string()
}

/// Consumer connection retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Connection attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles after each failure
    #[serde(default = "default_initial_retry_delay_secs")]
    pub initial_retry_delay_secs: u64,
}

impl ConsumerConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs(self.initial_retry_delay_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_retry_delay_secs: default_initial_retry_delay_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_retry_delay_secs() -> u64 {
    5
}
