//! Topic logs, committed offsets and the ordered delivery worker

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use tributary::client::{DeliveryCallback, OutboundMessage};
use tributary::error::{ClientError, ClientResult};
use tributary::record::{Position, TopicPartition};

/// Base of the logical log-append clock; each appended record advances it
/// by one millisecond, so log-append times are deterministic.
const CLOCK_BASE_MS: i64 = 1_700_000_000_000;

/// A record at rest in a partition log.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
    /// Log-append time, or the producer's timestamp when one was set
    pub timestamp: i64,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
}

struct BrokerState {
    topics: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, TopicPartition), i64>,
    failing_topics: HashSet<String>,
    round_robin: HashMap<String, usize>,
    rebalance_epoch: u64,
    clock: i64,
}

/// In-flight accounting shared between one producer and the delivery
/// worker.
#[derive(Default)]
pub(crate) struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn add(&self) {
        *self.count.lock().expect("lock poisoned") += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().expect("lock poisoned");
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock().expect("lock poisoned")
    }

    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        let count = self.count.lock().expect("lock poisoned");
        let (count, result) = self
            .drained
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .expect("lock poisoned");
        drop(count);
        !result.timed_out()
    }
}

type DeliveryJob = (DeliveryCallback, ClientResult<Position>, Arc<Inflight>);

/// A deterministic in-memory broker.
///
/// Deliveries run on a single worker thread in submission order, so
/// per-`{topic, key}` ordering holds the way it does on a real client's
/// delivery path.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    delivery_tx: Mutex<Option<Sender<DeliveryJob>>>,
    default_partitions: usize,
}

impl MemoryBroker {
    /// A broker that auto-creates single-partition topics.
    pub fn new() -> Arc<Self> {
        Self::with_default_partitions(1)
    }

    pub fn with_default_partitions(default_partitions: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<DeliveryJob>();
        thread::Builder::new()
            .name("memory-broker-delivery".to_string())
            .spawn(move || {
                while let Ok((callback, result, inflight)) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                        warn!("delivery callback panicked");
                    }
                    inflight.done();
                }
            })
            .expect("failed to start delivery thread");
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                topics: HashMap::new(),
                committed: HashMap::new(),
                failing_topics: HashSet::new(),
                round_robin: HashMap::new(),
                rebalance_epoch: 0,
                clock: CLOCK_BASE_MS,
            }),
            delivery_tx: Mutex::new(Some(tx)),
            default_partitions: default_partitions.max(1),
        })
    }

    /// Pre-create `topic` with an explicit partition count.
    pub fn create_topic(&self, topic: impl Into<String>, partitions: usize) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.topics.entry(topic.into()).or_insert_with(|| {
            (0..partitions.max(1))
                .map(|_| PartitionLog::default())
                .collect()
        });
    }

    /// Every produce to `topic` from now on fails at delivery.
    pub fn fail_produces_to(&self, topic: impl Into<String>) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failing_topics
            .insert(topic.into());
    }

    /// Force every group subscription through a revoke/assign cycle on
    /// its next poll.
    pub fn trigger_rebalance(&self) {
        self.state.lock().expect("lock poisoned").rebalance_epoch += 1;
    }

    /// Append a record directly, bypassing any producer.
    pub fn seed(
        &self,
        topic: impl Into<String>,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<(String, Bytes)>,
    ) -> Position {
        let topic = topic.into();
        let mut state = self.state.lock().expect("lock poisoned");
        let partition = self.pick_partition(&mut state, &topic, key.as_deref());
        Self::append(&mut state, &topic, partition, key, value, headers, None)
    }

    /// Records at rest in one partition.
    pub fn partition_records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Every record of `topic` across partitions, in partition order.
    pub fn topic_records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flat_map(|log| log.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The committed next-to-read offset of a group on one partition.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().expect("lock poisoned").rebalance_epoch
    }

    pub(crate) fn produce(
        &self,
        message: OutboundMessage,
        on_delivery: DeliveryCallback,
        inflight: &Arc<Inflight>,
    ) -> ClientResult<()> {
        let result = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.failing_topics.contains(&message.topic) {
                Err(ClientError::Fatal(format!(
                    "injected produce failure for topic {}",
                    message.topic,
                )))
            } else {
                let partition =
                    self.pick_partition(&mut state, &message.topic, message.key.as_deref());
                Ok(Self::append(
                    &mut state,
                    &message.topic,
                    partition,
                    message.key,
                    message.value,
                    message.headers,
                    message.timestamp,
                ))
            }
        };

        inflight.add();
        let job: DeliveryJob = (on_delivery, result, Arc::clone(inflight));
        let job = {
            let tx = self.delivery_tx.lock().expect("lock poisoned");
            match tx.as_ref() {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::SendError(job)) => job,
                },
                None => job,
            }
        };
        // the worker is gone; report through the callback inline
        let (callback, _, inflight) = job;
        callback(Err(ClientError::Closed));
        inflight.done();
        Err(ClientError::Closed)
    }

    pub(crate) fn commit(&self, group: &str, positions: &[Position]) {
        let mut state = self.state.lock().expect("lock poisoned");
        for position in positions {
            state.committed.insert(
                (group.to_string(), position.topic_partition()),
                position.offset,
            );
        }
    }

    pub(crate) fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .committed
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    pub(crate) fn partition_ids(&self, topic: &str) -> Vec<i32> {
        let mut state = self.state.lock().expect("lock poisoned");
        let count = self.partitions_of(&mut state, topic);
        (0..count as i32).collect()
    }

    pub(crate) fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> (Option<(StoredRecord, Position)>, i64) {
        let state = self.state.lock().expect("lock poisoned");
        let Some(log) = state
            .topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
        else {
            return (None, 0);
        };
        let end = log.records.len() as i64;
        let record = log.records.get(offset as usize).map(|stored| {
            let position = Position::new(tp.topic.clone(), tp.partition, offset)
                .with_timestamp(stored.timestamp);
            (stored.clone(), position)
        });
        (record, end)
    }

    pub(crate) fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        let state = self.state.lock().expect("lock poisoned");
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.records.len() as i64)
            .unwrap_or(0)
    }

    fn partitions_of(&self, state: &mut BrokerState, topic: &str) -> usize {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                (0..self.default_partitions)
                    .map(|_| PartitionLog::default())
                    .collect()
            })
            .len()
    }

    fn pick_partition(&self, state: &mut BrokerState, topic: &str, key: Option<&[u8]>) -> i32 {
        let count = self.partitions_of(state, topic);
        match key {
            Some(key) => (fnv1a(key) % count as u64) as i32,
            None => {
                let counter = state.round_robin.entry(topic.to_string()).or_insert(0);
                let partition = (*counter % count) as i32;
                *counter += 1;
                partition
            }
        }
    }

    fn append(
        state: &mut BrokerState,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<(String, Bytes)>,
        timestamp: Option<i64>,
    ) -> Position {
        state.clock += 1;
        let timestamp = timestamp.unwrap_or(state.clock);
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .expect("partition exists");
        let offset = log.records.len() as i64;
        log.records.push(StoredRecord {
            key,
            value,
            headers,
            timestamp,
        });
        Position::new(topic.to_string(), partition, offset).with_timestamp(timestamp)
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
