#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, header},
};
use std::sync::Arc;
use tempfile::TempDir;

use imgpipe::api::{self, AppState};
use imgpipe::config::Config;
use imgpipe::observability::Metrics;
use imgpipe::producer::Producer;
use imgpipe::queue::LocalBroker;
use imgpipe::storage::StorageClient;

pub const QUEUE: &str = "task_queue";
const BOUNDARY: &str = "imgpipe-test-boundary";

/// Router wired to a temp-dir artifact store and an embedded broker
pub struct TestApp {
    pub router: Router,
    pub storage: Arc<StorageClient>,
    pub broker: LocalBroker,
    pub metrics: Arc<Metrics>,
    pub config: Config,
    pub temp_dir: TempDir,
}

/// Minimal config; the upload limit is small so oversize bodies are cheap
pub fn test_config() -> Config {
    let config_toml = r#"
[server]
bind_addr = "127.0.0.1:0"
max_upload_bytes = "16KB"

[broker]
backend = "local"
queue = "task_queue"

[consumer]
max_retries = 2
initial_retry_delay_secs = 1
    "#;

    toml::from_str(config_toml).expect("Failed to parse test config")
}

pub fn build_test_app() -> TestApp {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config();
    config.storage.root = temp_dir.path().join("images");
    config.broker.local_path = temp_dir.path().join("broker");

    let storage =
        Arc::new(StorageClient::local(&config.storage.root).expect("Failed to open artifact store"));
    let broker = LocalBroker::open(&config.broker.local_path).expect("Failed to open broker");
    let metrics = Arc::new(Metrics::new());

    let producer = Producer::new(storage.clone(), Arc::new(broker.connector()), QUEUE);
    let state = AppState::new(config.clone(), producer, metrics.clone());

    TestApp {
        router: api::router(state),
        storage,
        broker,
        metrics,
        config,
        temp_dir,
    }
}

/// `multipart/form-data` body with one file field
pub fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
    Request::builder()
        .uri("/upload")
        .method("POST")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(field, filename, content)))
        .unwrap()
}

pub async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
