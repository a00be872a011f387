//! A uniform asynchronous record stream over a polling broker client
//!
//! The adapter owns a blocking poll worker and hands records to the
//! consumer through a single-slot channel, so the caller's consumption
//! rate throttles polling. Position tracking keeps, per partition, the
//! highest contiguous ready-to-commit offset; commits never regress and
//! never exceed it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};

use crate::client::{
    ClientFactory, ClientObserver, ConsumerClient, LogLevel, Polled, RawRecord,
};
use crate::codec::{default_deserializer, Deserializer};
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Error, Result};
use crate::interceptor::{EventKind, InterceptorChain};
use crate::record::{Headers, Position, Record, TopicPartition};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const WATERMARK_TIMEOUT: Duration = Duration::from_secs(5);

/// The asynchronous record stream handed out by [`StreamingConsumer`].
pub type RecordStream = ReceiverStream<Record>;

/// Distance between a partition's committed position and its end of log,
/// snapshotted when a subscription stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGap {
    pub topic: String,
    pub partition: i32,
    /// Next offset this subscription would consume
    pub current: i64,
    /// End of log (next offset to be written)
    pub end: i64,
}

impl SubscriptionGap {
    pub fn gap(&self) -> i64 {
        self.end - self.current
    }
}

/// Per-partition commit progress.
///
/// `floor` is the highest offset such that every offset up to and
/// including it has been tracked; `committed` trails it and equals the
/// floor covered by the last commit.
struct PartitionProgress {
    floor: i64,
    committed: i64,
    pending: BTreeSet<i64>,
}

#[derive(Default)]
pub(crate) struct PositionTracker {
    partitions: HashMap<TopicPartition, PartitionProgress>,
}

impl PositionTracker {
    /// Note that a record at `position` was handed to the consumer; the
    /// first hand-out pins the partition's commit base.
    fn handed(&mut self, position: &Position) {
        self.partitions
            .entry(position.topic_partition())
            .or_insert_with(|| PartitionProgress {
                floor: position.offset - 1,
                committed: position.offset - 1,
                pending: BTreeSet::new(),
            });
    }

    /// Mark `position` ready to commit. Positions of partitions no longer
    /// owned are ignored.
    fn track(&mut self, position: &Position) {
        let Some(progress) = self.partitions.get_mut(&position.topic_partition()) else {
            return;
        };
        if position.offset <= progress.floor {
            return;
        }
        progress.pending.insert(position.offset);
        while progress.pending.remove(&(progress.floor + 1)) {
            progress.floor += 1;
        }
    }

    /// Drain every partition whose floor advanced past its last commit,
    /// yielding next-to-read positions.
    fn take_committable(&mut self) -> Vec<Position> {
        let mut commits = Vec::new();
        for (tp, progress) in &mut self.partitions {
            if progress.floor > progress.committed {
                progress.committed = progress.floor;
                commits.push(Position::new(tp.topic.clone(), tp.partition, progress.floor + 1));
            }
        }
        commits
    }

    fn next_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).map(|p| p.floor + 1)
    }

    fn forget(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.partitions.remove(tp);
        }
    }
}

type FlushHook = Box<dyn Fn() + Send + Sync>;
type PartitionEndHook = Box<dyn Fn(&Position) + Send + Sync>;

struct Shared {
    client: Arc<dyn ConsumerClient>,
    chain: Arc<InterceptorChain>,
    deserializer: Arc<dyn Deserializer>,
    tracker: Mutex<PositionTracker>,
    flush_hook: Mutex<Option<FlushHook>>,
    partition_end_hook: Mutex<Option<PartitionEndHook>>,
    fatal: Mutex<Option<ClientError>>,
    stopping: AtomicBool,
    auto_commit: Duration,
    topics: Vec<String>,
}

impl Shared {
    fn commit_tracked(&self) {
        let commits = self.tracker.lock().expect("lock poisoned").take_committable();
        if commits.is_empty() {
            return;
        }
        if let Err(error) = self.client.commit(&commits) {
            self.chain.emit(EventKind::ConsumerError { error });
        }
    }

    fn make_record(&self, raw: RawRecord) -> Result<Record> {
        let headers: Headers = raw.headers.into_iter().collect();
        let value = match raw.value {
            Some(value) => Some(self.deserializer.deserialize(value, &headers)?),
            None => None,
        };
        Ok(Record::assemble(raw.position, raw.key, value, headers))
    }

    fn snapshot_gaps(&self) -> Vec<SubscriptionGap> {
        let assignment = self.client.assignment().unwrap_or_default();
        let mut ends = Vec::with_capacity(assignment.len());
        for tp in &assignment {
            match self
                .client
                .watermarks(&tp.topic, tp.partition, WATERMARK_TIMEOUT)
            {
                Ok((low, high)) => ends.push((tp.clone(), low, high)),
                Err(error) => warn!(topic = %tp, %error, "watermark query failed; skipping gap"),
            }
        }
        let tracker = self.tracker.lock().expect("lock poisoned");
        ends.into_iter()
            .map(|(tp, low, high)| {
                let current = tracker.next_offset(&tp).unwrap_or(low);
                SubscriptionGap {
                    topic: tp.topic,
                    partition: tp.partition,
                    current,
                    end: high,
                }
            })
            .collect()
    }
}

/// Forwards broker callbacks into the interceptor chain and drives the
/// flush-then-commit rebalance protocol.
#[derive(Default)]
struct Observer {
    shared: OnceLock<Arc<Shared>>,
}

impl Observer {
    fn with_shared(&self, f: impl FnOnce(&Shared)) {
        if let Some(shared) = self.shared.get() {
            f(shared);
        }
    }
}

impl ClientObserver for Observer {
    fn log(&self, level: LogLevel, message: &str) {
        self.with_shared(|s| {
            s.chain.emit(EventKind::ConsumerLog {
                level,
                message: message.to_string(),
            })
        });
    }

    fn error(&self, error: &ClientError) {
        self.with_shared(|s| s.chain.emit(EventKind::ConsumerError { error: error.clone() }));
    }

    fn partitions_assigned(&self, partitions: &[TopicPartition]) {
        self.with_shared(|s| {
            s.chain.emit(EventKind::PartitionsAssigned {
                partitions: partitions.to_vec(),
            })
        });
    }

    fn partitions_revoked(&self, partitions: &[TopicPartition]) {
        self.with_shared(|s| {
            // flush in-flight produces first so committed offsets never
            // precede durable outputs
            if let Some(flush) = s.flush_hook.lock().expect("lock poisoned").as_ref() {
                flush();
            }
            s.commit_tracked();
            s.tracker.lock().expect("lock poisoned").forget(partitions);
            s.chain.emit(EventKind::PartitionsRevoked {
                partitions: partitions.to_vec(),
            });
        });
    }

    fn partitions_lost(&self, partitions: &[TopicPartition]) {
        self.with_shared(|s| {
            // ownership is already gone; committing would fence anyway
            s.tracker.lock().expect("lock poisoned").forget(partitions);
            s.chain.emit(EventKind::PartitionsLost {
                partitions: partitions.to_vec(),
            });
        });
    }

    fn offsets_committed(&self, positions: &[Position]) {
        self.with_shared(|s| {
            s.chain.emit(EventKind::PositionsCommitted {
                positions: positions.to_vec(),
            })
        });
    }
}

/// Builds a [`StreamingConsumer`].
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    deserializer: Arc<dyn Deserializer>,
    chain: Option<Arc<InterceptorChain>>,
}

impl ConsumerBuilder {
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn chain(mut self, chain: Arc<InterceptorChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn build(self) -> Result<StreamingConsumer> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("consumer requires a client factory".into()))?;
        let chain = self
            .chain
            .unwrap_or_else(|| Arc::new(InterceptorChain::new(self.config.client_id.clone(), vec![])));
        let observer = Arc::new(Observer::default());
        let client = factory.consumer(&self.config, observer.clone() as Arc<dyn ClientObserver>)?;
        let shared = Arc::new(Shared {
            client,
            chain,
            deserializer: self.deserializer,
            tracker: Mutex::new(PositionTracker::default()),
            flush_hook: Mutex::new(None),
            partition_end_hook: Mutex::new(None),
            fatal: Mutex::new(None),
            stopping: AtomicBool::new(false),
            auto_commit: self.config.auto_commit_interval(),
            topics: self.config.topics.clone(),
        });
        let _ = observer.shared.set(Arc::clone(&shared));
        Ok(StreamingConsumer {
            shared,
            worker: Mutex::new(None),
            records: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }
}

/// A lazily polled, cancellable record stream over a subscription.
pub struct StreamingConsumer {
    shared: Arc<Shared>,
    worker: Mutex<Option<tokio::task::JoinHandle<Vec<SubscriptionGap>>>>,
    records: Mutex<Option<mpsc::Receiver<Record>>>,
    stopped: AtomicBool,
}

impl StreamingConsumer {
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder {
            config: ConsumerConfig::default(),
            factory: None,
            deserializer: default_deserializer(),
            chain: None,
        }
    }

    /// Register the hook run at the head of every revocation, before
    /// tracked positions are committed.
    pub fn set_flush_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.flush_hook.lock().expect("lock poisoned") = Some(Box::new(hook));
    }

    /// Register a hook fired when a partition's poll catches up with its
    /// end of log.
    pub fn on_partition_end(&self, hook: impl Fn(&Position) + Send + Sync + 'static) {
        *self.shared.partition_end_hook.lock().expect("lock poisoned") = Some(Box::new(hook));
    }

    /// Subscribe to the configured topics and start the poll worker.
    pub fn subscribe(&self) -> Result<()> {
        let mut worker = self.worker.lock().expect("lock poisoned");
        if worker.is_some() {
            return Err(Error::Configuration("consumer is already subscribed".into()));
        }
        self.shared.client.subscribe(&self.shared.topics)?;
        let (tx, rx) = mpsc::channel(1);
        *self.records.lock().expect("lock poisoned") = Some(rx);
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::task::spawn_blocking(move || poll_loop(shared, tx)));
        Ok(())
    }

    /// Take the record stream. Single-slot: the poll worker stalls until
    /// the previous record is consumed.
    pub fn records(&self) -> Result<RecordStream> {
        self.records
            .lock()
            .expect("lock poisoned")
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Configuration("record stream already taken".into()))
    }

    /// Mark a record's position ready to commit.
    pub fn track_position(&self, record: &Record) {
        self.shared
            .tracker
            .lock()
            .expect("lock poisoned")
            .track(&record.position);
    }

    /// Commit everything tracked so far, immediately.
    pub fn commit_tracked(&self) {
        self.shared.commit_tracked();
    }

    /// The error that ended polling, if the stream closed on its own.
    pub fn fatal_error(&self) -> Option<ClientError> {
        self.shared.fatal.lock().expect("lock poisoned").clone()
    }

    /// Stop polling, drive revocation (flush, final commit), and return
    /// the gap snapshot. Stopping twice is an error; transport resources
    /// are released when the consumer is dropped.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<Vec<SubscriptionGap>> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        let worker = self.worker.lock().expect("lock poisoned").take();
        match worker {
            Some(handle) => handle.await.map_err(Error::handler),
            None => Ok(Vec::new()),
        }
    }
}

fn poll_loop(shared: Arc<Shared>, tx: mpsc::Sender<Record>) -> Vec<SubscriptionGap> {
    let mut last_commit = Instant::now();
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        match shared.client.poll(POLL_TIMEOUT) {
            Ok(Polled::Record(raw)) => match shared.make_record(raw) {
                Ok(record) => {
                    shared
                        .tracker
                        .lock()
                        .expect("lock poisoned")
                        .handed(&record.position);
                    if tx.blocking_send(record).is_err() {
                        // stream consumer went away; nothing left to feed
                        break;
                    }
                }
                Err(error) => {
                    // a poison payload is neither handed out nor tracked,
                    // so its offset stays uncommitted
                    warn!(%error, "dropping undecodable record");
                }
            },
            Ok(Polled::PartitionEof(position)) => {
                if let Some(hook) = shared
                    .partition_end_hook
                    .lock()
                    .expect("lock poisoned")
                    .as_ref()
                {
                    hook(&position);
                }
                shared.chain.emit(EventKind::PartitionEndReached { position });
            }
            Ok(Polled::Idle) => {}
            Err(error) => {
                shared.chain.emit(EventKind::ConsumerError { error: error.clone() });
                if error.is_fatal() {
                    *shared.fatal.lock().expect("lock poisoned") = Some(error);
                    break;
                }
            }
        }
        if last_commit.elapsed() >= shared.auto_commit {
            shared.commit_tracked();
            last_commit = Instant::now();
        }
    }

    drop(tx);
    let gaps = shared.snapshot_gaps();
    // drives revocation: flush hook, final commit, revoked events
    shared.client.close();
    gaps
}

#[cfg(test)]
mod test {
    use super::*;

    fn pos(offset: i64) -> Position {
        Position::new("orders", 0, offset)
    }

    #[test]
    fn tracker_commits_highest_contiguous_offset() {
        let mut tracker = PositionTracker::default();
        for offset in 3..6 {
            tracker.handed(&pos(offset));
        }
        tracker.track(&pos(3));
        tracker.track(&pos(5));
        let commits = tracker.take_committable();
        assert_eq!(commits, vec![pos(4)]);

        tracker.track(&pos(4));
        let commits = tracker.take_committable();
        assert_eq!(commits, vec![pos(6)]);
    }

    #[test]
    fn tracker_commits_are_monotonic_and_deduplicated() {
        let mut tracker = PositionTracker::default();
        tracker.handed(&pos(0));
        tracker.track(&pos(0));
        assert_eq!(tracker.take_committable(), vec![pos(1)]);
        // nothing new to commit
        assert!(tracker.take_committable().is_empty());
        // re-tracking an already committed offset changes nothing
        tracker.track(&pos(0));
        assert!(tracker.take_committable().is_empty());
    }

    #[test]
    fn tracker_ignores_unknown_partitions() {
        let mut tracker = PositionTracker::default();
        tracker.track(&pos(7));
        assert!(tracker.take_committable().is_empty());
        assert_eq!(tracker.next_offset(&TopicPartition::new("orders", 0)), None);
    }

    #[test]
    fn tracker_forget_clears_progress() {
        let mut tracker = PositionTracker::default();
        tracker.handed(&pos(0));
        tracker.track(&pos(0));
        tracker.forget(&[TopicPartition::new("orders", 0)]);
        assert!(tracker.take_committable().is_empty());
    }
}
