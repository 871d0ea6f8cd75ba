//! Consuming loop with reconnect and backoff

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::runner::{TaskOutcome, process_task};
use super::{ConsumerError, ConsumerState, Result};
use crate::observability::Metrics;
use crate::queue::{self, Delivery, QueueChannel, QueueConnector, QueueError, Subscription};
use crate::storage::StorageClient;

type Session = (Box<dyn QueueChannel>, Box<dyn Subscription>);

/// How a consuming session ended
enum SessionEnd {
    /// Shutdown future resolved
    Stopped,
    /// Broker went away; reconnect
    Lost(Option<QueueError>),
    /// Terminal failure
    Failed(ConsumerError),
}

pub struct Consumer {
    connector: Arc<dyn QueueConnector>,
    storage: Arc<StorageClient>,
    queue: String,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        storage: Arc<StorageClient>,
        queue: impl Into<String>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            connector,
            storage,
            queue: queue.into(),
            policy,
            metrics,
            state,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` resolves or a terminal error occurs
    ///
    /// A task that is being handled when `shutdown` resolves runs to
    /// completion first. Any delivery not yet acknowledged when the loop
    /// exits is returned to the queue by closing the channel.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            broker = %self.connector.describe(),
            queue = %self.queue,
            storage = %self.storage.location(),
            "Consumer starting"
        );

        loop {
            let established = tokio::select! {
                _ = &mut shutdown => None,
                session = self.establish() => Some(session),
            };

            let (channel, mut subscription) = match established {
                Some(Ok(session)) => session,
                Some(Err(err)) => {
                    self.set_state(ConsumerState::Shutdown);
                    return Err(err);
                }
                None => {
                    self.set_state(ConsumerState::Shutdown);
                    info!("Consumer stopped");
                    return Ok(());
                }
            };

            self.set_state(ConsumerState::Consuming);
            info!(queue = %self.queue, "Waiting for messages");

            let end = loop {
                let next = tokio::select! {
                    _ = &mut shutdown => break SessionEnd::Stopped,
                    next = subscription.next_delivery() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if let Some(end) = self.handle(delivery).await {
                            break end;
                        }
                    }
                    Some(Err(err)) if err.is_connection() => break SessionEnd::Lost(Some(err)),
                    Some(Err(err)) => break SessionEnd::Failed(ConsumerError::Queue(err)),
                    None => break SessionEnd::Lost(None),
                }
            };

            drop(subscription);
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Channel close failed");
            }

            match end {
                SessionEnd::Stopped => {
                    self.set_state(ConsumerState::Shutdown);
                    info!("Consumer stopped");
                    return Ok(());
                }
                SessionEnd::Lost(err) => {
                    match err {
                        Some(err) => warn!(error = %err, "Broker connection lost, reconnecting"),
                        None => warn!("Subscription ended, reconnecting"),
                    }
                    self.set_state(ConsumerState::Disconnected);
                }
                SessionEnd::Failed(err) => {
                    error!(error = %err, "Consumer failed");
                    self.set_state(ConsumerState::Shutdown);
                    return Err(err);
                }
            }
        }
    }

    /// Connect, declare and subscribe, retrying connection failures
    async fn establish(&self) -> Result<Session> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.set_state(ConsumerState::Connecting);

            let err = match self.open_session().await {
                Ok(session) => {
                    info!(attempt, broker = %self.connector.describe(), "Connected to broker");
                    return Ok(session);
                }
                Err(err) => err,
            };

            if !err.is_connection() {
                error!(error = %err, "Consumer setup failed");
                return Err(ConsumerError::Setup(err));
            }

            match self.policy.delay_after(attempt) {
                Some(delay) => {
                    warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "Broker unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(attempts = attempt, error = %err, "Broker unavailable, giving up");
                    return Err(ConsumerError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
            }
        }
    }

    async fn open_session(&self) -> queue::Result<Session> {
        let channel = self.connector.connect().await?;

        let subscribed = async {
            channel.declare_queue(&self.queue, true).await?;
            channel.subscribe(&self.queue).await
        }
        .await;

        match subscribed {
            Ok(subscription) => Ok((channel, subscription)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Channel close failed");
                }
                Err(err)
            }
        }
    }

    /// Handle one delivery; `Some` ends the session
    async fn handle(&self, delivery: Delivery) -> Option<SessionEnd> {
        let (payload, redelivered, acker) = delivery.into_parts();
        debug!(size = payload.len(), redelivered, "Message received");

        match process_task(&self.storage, payload).await {
            Ok(outcome) => {
                if let TaskOutcome::MissingArtifact { .. } = outcome {
                    self.metrics.artifact_missing();
                }
            }
            // Not acked: the broker hands the message out again once the
            // channel closes
            Err(err) => {
                error!(error = %err, "Task handling failed");
                return Some(SessionEnd::Failed(err.into()));
            }
        }

        match acker.ack().await {
            Ok(()) => {
                self.metrics.task_consumed();
                None
            }
            Err(err) => Some(SessionEnd::Lost(Some(err))),
        }
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "Consumer state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LocalBroker;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    const QUEUE: &str = "task_queue";
    const TASK_ID: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    /// Connector that refuses every connection and records when it was asked
    #[derive(Default)]
    struct Unreachable {
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl QueueConnector for Unreachable {
        async fn connect(&self) -> queue::Result<Box<dyn QueueChannel>> {
            self.attempts
                .lock()
                .unwrap()
                .push(Instant::now());
            Err(QueueError::Connection("connection refused".to_string()))
        }

        fn describe(&self) -> String {
            "amqp://unreachable".to_string()
        }
    }

    /// Channel on which the task queue exists as transient
    struct ConflictingChannel;

    #[async_trait]
    impl QueueChannel for ConflictingChannel {
        async fn declare_queue(&self, name: &str, durable: bool) -> queue::Result<()> {
            Err(QueueError::QueueConflict {
                queue: name.to_string(),
                existing: !durable,
                requested: durable,
            })
        }

        async fn publish(&self, _queue: &str, _payload: &[u8], _persistent: bool) -> queue::Result<()> {
            Ok(())
        }

        async fn subscribe(&self, queue: &str) -> queue::Result<Box<dyn Subscription>> {
            Err(QueueError::QueueNotFound(queue.to_string()))
        }

        async fn close(&self) -> queue::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Conflicting {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl QueueConnector for Conflicting {
        async fn connect(&self) -> queue::Result<Box<dyn QueueChannel>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConflictingChannel))
        }

        fn describe(&self) -> String {
            "amqp://conflicting".to_string()
        }
    }

    fn consumer(connector: Arc<dyn QueueConnector>, storage: Arc<StorageClient>) -> Consumer {
        Consumer::new(
            connector,
            storage,
            QUEUE,
            RetryPolicy::new(4, Duration::from_secs(5)),
            Arc::new(Metrics::new()),
        )
    }

    async fn publish(broker: &LocalBroker, payload: &[u8]) {
        let channel = broker.connector().connect().await.unwrap();
        channel.declare_queue(QUEUE, true).await.unwrap();
        channel.publish(QUEUE, payload, true).await.unwrap();
        channel.close().await.unwrap();
    }

    async fn wait_until_drained(broker: &LocalBroker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.depth(QUEUE).unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue was not drained");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_then_gives_up() {
        let connector = Arc::new(Unreachable::default());
        let consumer = consumer(connector.clone(), Arc::new(StorageClient::in_memory()));
        let mut state = consumer.state();

        let started = Instant::now();
        let err = consumer.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::RetriesExhausted { attempts: 4, .. }
        ));

        let attempts = connector.attempts.lock().unwrap().clone();
        let offsets: Vec<_> = attempts.iter().map(|t| *t - started).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(35),
            ]
        );
        // No sleep after the last failure
        assert_eq!(started.elapsed(), Duration::from_secs(35));
        assert_eq!(*state.borrow_and_update(), ConsumerState::Shutdown);
    }

    #[tokio::test]
    async fn test_setup_fault_is_not_retried() {
        let connector = Arc::new(Conflicting::default());
        let consumer = consumer(connector.clone(), Arc::new(StorageClient::in_memory()));

        let err = consumer.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::Setup(QueueError::QueueConflict { .. })
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let connector = Arc::new(Unreachable::default());
        let consumer = consumer(connector.clone(), Arc::new(StorageClient::in_memory()));

        let result = consumer
            .run(tokio::time::sleep(Duration::from_secs(7)))
            .await;

        assert!(result.is_ok());
        // Attempts at 0s and 5s; the third would be at 15s
        assert_eq!(connector.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_classifies_and_acks() {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::open(temp_dir.path().join("broker")).unwrap();
        let storage = Arc::new(StorageClient::in_memory());

        let cat = format!("{}_photo_cat_1.png", TASK_ID);
        storage
            .upload(&cat, Bytes::from_static(&[7u8; 128]))
            .await
            .unwrap();
        publish(&broker, cat.as_bytes()).await;
        // Missing artifact is still acknowledged
        publish(&broker, format!("{}_gone_dog.jpg", TASK_ID).as_bytes()).await;

        let metrics = Arc::new(Metrics::new());
        let consumer = Arc::new(Consumer::new(
            Arc::new(broker.connector()),
            storage,
            QUEUE,
            RetryPolicy::default(),
            metrics.clone(),
        ));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn({
            let consumer = consumer.clone();
            async move {
                consumer
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        wait_until_drained(&broker).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_consumed, 2);
        assert_eq!(snapshot.artifacts_missing, 1);
        assert_eq!(broker.in_flight(QUEUE), 0);
        assert_eq!(*consumer.state().borrow(), ConsumerState::Shutdown);
    }

    #[tokio::test]
    async fn test_handler_failure_leaves_message_queued() {
        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::open(temp_dir.path()).unwrap();
        publish(&broker, &[0xff, 0xfe, 0xfd]).await;

        let consumer = consumer(
            Arc::new(broker.connector()),
            Arc::new(StorageClient::in_memory()),
        );
        let err = consumer.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(err, ConsumerError::Handler(_)));
        assert_eq!(broker.depth(QUEUE).unwrap(), 1);
        assert_eq!(broker.in_flight(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_broker_drops_subscription() {
        /// Hands out channels on the broker, ending the first subscription
        /// as soon as it is consuming
        struct Flaky {
            broker: LocalBroker,
            connects: AtomicUsize,
        }

        struct EndedSubscription;

        #[async_trait]
        impl Subscription for EndedSubscription {
            async fn next_delivery(&mut self) -> Option<queue::Result<Delivery>> {
                None
            }
        }

        struct FirstChannel(Box<dyn QueueChannel>);

        #[async_trait]
        impl QueueChannel for FirstChannel {
            async fn declare_queue(&self, name: &str, durable: bool) -> queue::Result<()> {
                self.0.declare_queue(name, durable).await
            }

            async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> queue::Result<()> {
                self.0.publish(queue, payload, persistent).await
            }

            async fn subscribe(&self, _queue: &str) -> queue::Result<Box<dyn Subscription>> {
                Ok(Box::new(EndedSubscription))
            }

            async fn close(&self) -> queue::Result<()> {
                self.0.close().await
            }
        }

        #[async_trait]
        impl QueueConnector for Flaky {
            async fn connect(&self) -> queue::Result<Box<dyn QueueChannel>> {
                let channel = self.broker.connector().connect().await?;
                if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Box::new(FirstChannel(channel)))
                } else {
                    Ok(channel)
                }
            }

            fn describe(&self) -> String {
                "flaky".to_string()
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let broker = LocalBroker::open(temp_dir.path()).unwrap();
        let storage = Arc::new(StorageClient::in_memory());
        let name = format!("{}_dog.jpg", TASK_ID);
        storage.upload(&name, Bytes::from_static(b"woof")).await.unwrap();
        publish(&broker, name.as_bytes()).await;

        let connector = Arc::new(Flaky {
            broker: broker.clone(),
            connects: AtomicUsize::new(0),
        });
        let metrics = Arc::new(Metrics::new());
        let consumer = Consumer::new(
            connector.clone(),
            storage,
            QUEUE,
            RetryPolicy::default(),
            metrics.clone(),
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = consumer.run(async {
            let _ = stop_rx.await;
        });
        let drive = async {
            wait_until_drained(&broker).await;
            stop_tx.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(run, drive);

        result.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.snapshot().tasks_consumed, 1);
    }
}
