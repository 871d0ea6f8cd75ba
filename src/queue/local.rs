use super::client::{
    Acker, Acknowledge, Delivery, QueueChannel, QueueConnector, Subscription,
};
use super::error::{QueueError, Result, validate_queue_name};
use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

const QUEUES_PARTITION: &str = "queues";
const METADATA_PARTITION: &str = "metadata";
const NEXT_SEQ_KEY: &[u8] = b"next_seq";

/// Embedded durable broker backed by Fjall
///
/// Layout:
/// - `queues` partition: queue name → durability flag (1 byte)
/// - `metadata` partition: "next_seq" → u64 (big-endian)
/// - `q_<name>` partition per queue: u64 seq (big-endian) → payload
///
/// A message stays in its queue partition until acknowledged. While handed
/// out it is tracked as in flight for the channel that received it; closing
/// or dropping that channel puts it back in line for redelivery. Delivery is
/// in ascending sequence order with a prefetch of one per channel.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    keyspace: Keyspace,
    queues: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: AtomicU64,
    next_channel_id: AtomicU64,
    state: Mutex<BrokerState>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    partitions: HashMap<String, PartitionHandle>,
    /// queue → seqs handed out and not yet acked or released
    in_flight: HashMap<String, HashSet<u64>>,
    /// queue → seqs delivered at least once since open
    delivered: HashMap<String, HashSet<u64>>,
    /// channel id → (queue, seq) it holds unacked
    unacked: HashMap<u64, HashSet<(String, u64)>>,
}

struct ChannelState {
    id: u64,
    closed: AtomicBool,
}

impl LocalBroker {
    /// Open or create a broker at the specified path
    ///
    /// Contents of non-durable queues do not survive this call.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening local broker at: {}", path.display());

        let keyspace = Config::new(&path).open()?;
        let queues = keyspace.open_partition(QUEUES_PARTITION, PartitionCreateOptions::default())?;
        let metadata =
            keyspace.open_partition(METADATA_PARTITION, PartitionCreateOptions::default())?;

        let stored_seq = metadata
            .get(NEXT_SEQ_KEY)?
            .map(|bytes| decode_seq(&bytes))
            .unwrap_or(0);

        let inner = Inner {
            path,
            keyspace,
            queues,
            metadata,
            seq_counter: AtomicU64::new(stored_seq),
            next_channel_id: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        };
        inner.discard_transient_queues()?;

        // A crash between the message write and the next_seq write leaves
        // the stored counter behind the newest key
        let current_seq = stored_seq.max(inner.highest_stored_seq()?.map_or(0, |seq| seq + 1));
        inner.seq_counter.store(current_seq, Ordering::SeqCst);

        info!("Local broker opened, current sequence: {}", current_seq);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn connector(&self) -> LocalConnector {
        LocalConnector {
            broker: self.clone(),
        }
    }

    /// Stop accepting connections and end all open subscriptions
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        info!(path = %self.inner.path.display(), "Local broker closed");
    }

    /// Number of messages in the queue that are not yet acknowledged
    /// (ready + in flight)
    pub fn depth(&self, queue: &str) -> Result<usize> {
        let partition = {
            let mut state = self.inner.lock();
            self.inner.partition(&mut state, queue)?
        };

        let mut count = 0;
        for item in partition.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Number of messages handed out and awaiting acknowledgment
    pub fn in_flight(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .in_flight
            .get(queue)
            .map_or(0, HashSet::len)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.inner.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("local broker is closed".to_string()));
        }
        Ok(())
    }

    /// Largest sequence number present in any queue partition
    fn highest_stored_seq(&self) -> Result<Option<u64>> {
        let mut highest = None;
        for item in self.queues.iter() {
            let (name, _) = item?;
            let name = String::from_utf8_lossy(&name).into_owned();
            let partition = self
                .keyspace
                .open_partition(&partition_name(&name), PartitionCreateOptions::default())?;

            if let Some((key, _)) = partition.last_key_value()? {
                let seq = decode_seq(&key);
                highest = Some(highest.map_or(seq, |h: u64| h.max(seq)));
            }
        }
        Ok(highest)
    }

    fn discard_transient_queues(&self) -> Result<()> {
        let mut transient = Vec::new();
        for item in self.queues.iter() {
            let (name, flag) = item?;
            if !decode_flag(&flag) {
                transient.push(String::from_utf8_lossy(&name).into_owned());
            }
        }

        for name in transient {
            let partition = self
                .keyspace
                .open_partition(&partition_name(&name), PartitionCreateOptions::default())?;

            let mut keys = Vec::new();
            for item in partition.iter() {
                let (key, _) = item?;
                keys.push(key);
            }
            let purged = keys.len();
            for key in keys {
                partition.remove(key)?;
            }
            self.queues.remove(name.as_bytes())?;

            info!(queue = %name, purged, "Discarded non-durable queue");
        }

        Ok(())
    }

    fn partition(&self, state: &mut BrokerState, queue: &str) -> Result<PartitionHandle> {
        if let Some(partition) = state.partitions.get(queue) {
            return Ok(partition.clone());
        }

        if self.queues.get(queue.as_bytes())?.is_none() {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }

        let partition = self
            .keyspace
            .open_partition(&partition_name(queue), PartitionCreateOptions::default())?;
        state
            .partitions
            .insert(queue.to_string(), partition.clone());
        Ok(partition)
    }

    fn declare(&self, queue: &str, durable: bool) -> Result<()> {
        validate_queue_name(queue)?;
        self.ensure_open()?;

        let mut state = self.lock();
        match self.queues.get(queue.as_bytes())? {
            Some(flag) => {
                let existing = decode_flag(&flag);
                if existing != durable {
                    return Err(QueueError::QueueConflict {
                        queue: queue.to_string(),
                        existing,
                        requested: durable,
                    });
                }
            }
            None => {
                self.queues.insert(queue.as_bytes(), encode_flag(durable))?;
                self.keyspace.persist(PersistMode::SyncAll)?;
                debug!(queue, durable, "Queue declared");
            }
        }

        self.partition(&mut state, queue)?;
        Ok(())
    }

    fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;

        let partition = {
            let mut state = self.lock();
            self.partition(&mut state, queue)?
        };

        // Allocation and both writes happen under the state lock, so the
        // persisted next_seq never moves backwards
        let seq = {
            let _state = self.lock();
            let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
            partition.insert(seq.to_be_bytes(), payload)?;
            self.metadata.insert(NEXT_SEQ_KEY, (seq + 1).to_be_bytes())?;
            seq
        };

        if persistent {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }

        debug!(seq, queue, size = payload.len(), persistent, "Message published");

        self.notify.notify_waiters();
        Ok(())
    }

    /// Hand out the oldest message that is not in flight, if the channel has
    /// no unacked message on this queue
    fn claim(self: &Arc<Self>, queue: &str, channel: &Arc<ChannelState>) -> Result<Option<Delivery>> {
        let mut state = self.lock();
        // Checked under the lock: release_channel runs after the flag is set
        if channel.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let partition = self.partition(&mut state, queue)?;

        let BrokerState {
            in_flight,
            delivered,
            unacked,
            ..
        } = &mut *state;

        let held = unacked.entry(channel.id).or_default();
        if held.iter().any(|(q, _)| q == queue) {
            return Ok(None);
        }

        let in_flight = in_flight.entry(queue.to_string()).or_default();
        for item in partition.iter() {
            let (key, value) = item?;
            let seq = decode_seq(&key);
            if in_flight.contains(&seq) {
                continue;
            }

            in_flight.insert(seq);
            held.insert((queue.to_string(), seq));
            let redelivered = !delivered.entry(queue.to_string()).or_default().insert(seq);

            debug!(seq, queue, channel = channel.id, redelivered, "Message delivered");

            let acker = Acker::new(LocalAcker {
                broker: Arc::clone(self),
                channel: Arc::clone(channel),
                queue: queue.to_string(),
                seq,
            });
            return Ok(Some(Delivery::new(value.to_vec(), redelivered, acker)));
        }

        Ok(None)
    }

    fn ack(&self, queue: &str, seq: u64, channel: &ChannelState) -> Result<()> {
        if channel.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Ack(format!(
                "channel {} is closed, delivery {} was requeued",
                channel.id, seq
            )));
        }

        let mut state = self.lock();
        let held = state
            .unacked
            .get_mut(&channel.id)
            .is_some_and(|held| held.remove(&(queue.to_string(), seq)));
        if !held {
            return Err(QueueError::Ack(format!(
                "unknown delivery {} on queue '{}'",
                seq, queue
            )));
        }

        let partition = self.partition(&mut state, queue)?;
        partition.remove(seq.to_be_bytes())?;

        if let Some(in_flight) = state.in_flight.get_mut(queue) {
            in_flight.remove(&seq);
        }
        if let Some(delivered) = state.delivered.get_mut(queue) {
            delivered.remove(&seq);
        }
        drop(state);

        debug!(seq, queue, channel = channel.id, "Message acknowledged");

        self.notify.notify_waiters();
        Ok(())
    }

    /// Return every message held by the channel to the ready set
    fn release_channel(&self, channel_id: u64) {
        let mut state = self.lock();
        let held = state.unacked.remove(&channel_id).unwrap_or_default();
        let released = held.len();

        for (queue, seq) in held {
            if let Some(in_flight) = state.in_flight.get_mut(&queue) {
                in_flight.remove(&seq);
            }
        }
        drop(state);

        if released > 0 {
            debug!(channel = channel_id, released, "Requeued unacked messages");
        }
        self.notify.notify_waiters();
    }
}

/// Connector handing out channels on a shared [`LocalBroker`]
#[derive(Clone)]
pub struct LocalConnector {
    broker: LocalBroker,
}

#[async_trait]
impl QueueConnector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn QueueChannel>> {
        let inner = &self.broker.inner;
        inner.ensure_open()?;

        let id = inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        debug!(channel = id, "Local channel opened");

        Ok(Box::new(LocalChannel {
            broker: Arc::clone(inner),
            state: Arc::new(ChannelState {
                id,
                closed: AtomicBool::new(false),
            }),
        }))
    }

    fn describe(&self) -> String {
        format!("local://{}", self.broker.inner.path.display())
    }
}

pub struct LocalChannel {
    broker: Arc<Inner>,
    state: Arc<ChannelState>,
}

impl LocalChannel {
    fn ensure_open(&self) -> Result<()> {
        self.broker.ensure_open()?;
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Connection(format!(
                "channel {} is closed",
                self.state.id
            )));
        }
        Ok(())
    }

    fn shut(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.broker.release_channel(self.state.id);
            debug!(channel = self.state.id, "Local channel closed");
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.shut();
    }
}

#[async_trait]
impl QueueChannel for LocalChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare(name, durable)
    }

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.publish(queue, payload, persistent)
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        validate_queue_name(queue)?;
        {
            let mut state = self.broker.lock();
            self.broker.partition(&mut state, queue)?;
        }

        Ok(Box::new(LocalSubscription {
            broker: Arc::clone(&self.broker),
            channel: Arc::clone(&self.state),
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        Ok(())
    }
}

struct LocalSubscription {
    broker: Arc<Inner>,
    channel: Arc<ChannelState>,
    queue: String,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            // Register for wakeups before checking, so a publish or close
            // between the check and the await is not missed.
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.channel.closed.load(Ordering::SeqCst)
                || self.broker.closed.load(Ordering::SeqCst)
            {
                return None;
            }

            match self.broker.claim(&self.queue, &self.channel) {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }

            notified.await;
        }
    }
}

struct LocalAcker {
    broker: Arc<Inner>,
    channel: Arc<ChannelState>,
    queue: String,
    seq: u64,
}

#[async_trait]
impl Acknowledge for LocalAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.ack(&self.queue, self.seq, &self.channel)
    }
}

/// Fjall partition names allow `[A-Za-z0-9_#$-]`
fn partition_name(queue: &str) -> String {
    format!("q_{}", queue.replace('.', "$"))
}

fn encode_flag(durable: bool) -> [u8; 1] {
    [u8::from(durable)]
}

fn decode_flag(bytes: &[u8]) -> bool {
    bytes.first() == Some(&1)
}

fn decode_seq(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().unwrap_or([0u8; 8]))
}
