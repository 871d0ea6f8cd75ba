use std::sync::Arc;

use imgpipe::api::{self, AppState};
use imgpipe::config::{BrokerBackend, Config};
use imgpipe::observability::Metrics;
use imgpipe::producer::Producer;
use imgpipe::queue::{self, QueueConnector};
use imgpipe::storage::StorageClient;
use imgpipe::worker::{Consumer, RetryPolicy};
use tokio::sync::watch;
use tracing::{error, info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

struct Components {
    storage: Arc<StorageClient>,
    connector: Arc<dyn QueueConnector>,
    metrics: Arc<Metrics>,
}

impl Components {
    fn open(config: &Config) -> Result<Self, AnyError> {
        info!(root = %config.storage.root.display(), "Opening artifact store");
        let storage = StorageClient::local(&config.storage.root)
            .map_err(|e| format!("Failed to open artifact store: {}", e))?;

        let connector = queue::connector_from_config(&config.broker)
            .map_err(|e| format!("Failed to set up broker: {}", e))?;
        info!(broker = %connector.describe(), queue = %config.broker.queue, "Broker configured");

        Ok(Self {
            storage: Arc::new(storage),
            connector,
            metrics: Arc::new(Metrics::new()),
        })
    }

    fn producer(&self, config: &Config) -> Producer {
        Producer::new(
            self.storage.clone(),
            self.connector.clone(),
            config.broker.queue.clone(),
        )
    }

    fn consumer(&self, config: &Config) -> Consumer {
        Consumer::new(
            self.connector.clone(),
            self.storage.clone(),
            config.broker.queue.clone(),
            RetryPolicy::new(
                config.consumer.max_retries,
                config.consumer.initial_retry_delay(),
            ),
            self.metrics.clone(),
        )
    }
}

fn warn_if_process_local(config: &Config) {
    if config.broker.backend == BrokerBackend::Local {
        warn!(
            path = %config.broker.local_path.display(),
            "Local broker is only reachable from this process; use `standalone` to run both halves"
        );
    }
}

pub async fn run_server(config: Config) -> Result<(), AnyError> {
    warn_if_process_local(&config);
    let components = Components::open(&config)?;

    let address = config.server.bind_addr;
    let producer = components.producer(&config);
    let state = AppState::new(config, producer, components.metrics.clone());

    api::run(state, address, shutdown_signal()).await?;

    info!(metrics = ?components.metrics.snapshot(), "Server stopped");
    Ok(())
}

pub async fn run_consumer(config: Config) -> Result<(), AnyError> {
    warn_if_process_local(&config);
    let components = Components::open(&config)?;

    let consumer = components.consumer(&config);
    consumer.run(shutdown_signal()).await?;

    info!(metrics = ?components.metrics.snapshot(), "Consumer stopped");
    Ok(())
}

/// Upload API and consumer sharing one broker connector and artifact store
///
/// A signal stops both halves; either half failing stops the other.
pub async fn run_standalone(config: Config) -> Result<(), AnyError> {
    let components = Components::open(&config)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    tokio::spawn({
        let stop_tx = stop_tx.clone();
        async move {
            shutdown_signal().await;
            stop_tx.send_replace(true);
        }
    });

    let consumer = components.consumer(&config);
    let address = config.server.bind_addr;
    let producer = components.producer(&config);
    let state = AppState::new(config, producer, components.metrics.clone());

    let server = {
        let stop_tx = stop_tx.clone();
        let stop_rx = stop_rx.clone();
        async move {
            let result = api::run(state, address, stopped(stop_rx)).await;
            stop_tx.send_replace(true);
            result
        }
    };

    let consuming = async {
        let result = consumer.run(stopped(stop_rx.clone())).await;
        if let Err(err) = &result {
            error!(error = %err, "Consumer terminated, stopping server");
        }
        stop_tx.send_replace(true);
        result
    };

    let (served, consumed) = tokio::join!(server, consuming);

    info!(metrics = ?components.metrics.snapshot(), "Standalone stopped");
    served?;
    consumed?;
    Ok(())
}

async fn stopped(mut stop_rx: watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
