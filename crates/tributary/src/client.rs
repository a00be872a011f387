//! The broker-client seam consumed by the toolkit
//!
//! The toolkit presumes a classical Kafka client surface: subscribe, poll,
//! assign, commit, produce with delivery reports, watermark queries and
//! rebalance callbacks. Backends implement these traits; the toolkit never
//! touches a broker library directly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::{ClientError, ClientResult};
use crate::record::{Position, TopicPartition};

/// A record as fetched off the wire, before event-time resolution.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub position: Position,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
}

/// A message handed to a producer client for delivery.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
    /// Message timestamp in unix ms; `None` lets the broker assign
    /// log-append time.
    pub timestamp: Option<i64>,
}

/// Outcome of a single consumer poll.
#[derive(Debug, Clone)]
pub enum Polled {
    /// A record was fetched
    Record(RawRecord),
    /// The consumer reached the end of a partition; the position is the
    /// end offset (next offset to be written)
    PartitionEof(Position),
    /// Nothing arrived within the poll timeout
    Idle,
}

/// Severity of a broker-client log line forwarded to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Callbacks a broker client invokes from inside `poll`/`close`.
///
/// Implementations must be observer-safe: they may run on the polling
/// thread or the client's delivery path.
pub trait ClientObserver: Send + Sync {
    fn log(&self, _level: LogLevel, _message: &str) {}
    fn error(&self, _error: &ClientError) {}
    fn partitions_assigned(&self, _partitions: &[TopicPartition]) {}
    /// Invoked before ownership of the partitions is returned to the
    /// broker; tracked positions are still committable at this point.
    fn partitions_revoked(&self, _partitions: &[TopicPartition]) {}
    fn partitions_lost(&self, _partitions: &[TopicPartition]) {}
    fn offsets_committed(&self, _positions: &[Position]) {}
}

/// A no-op observer for clients that nobody watches (readers).
pub struct NoopObserver;

impl ClientObserver for NoopObserver {}

/// The consuming half of the broker surface.
pub trait ConsumerClient: Send + Sync {
    /// Join the configured group and subscribe to `topics`; assignment is
    /// delivered through [`ClientObserver::partitions_assigned`] during a
    /// subsequent `poll`.
    fn subscribe(&self, topics: &[String]) -> ClientResult<()>;

    /// Take manual ownership of exact positions, bypassing group
    /// assignment. No rebalance callbacks fire.
    fn assign(&self, positions: &[Position]) -> ClientResult<()>;

    fn poll(&self, timeout: Duration) -> ClientResult<Polled>;

    /// Commit next-to-read offsets. Completion is reported through
    /// [`ClientObserver::offsets_committed`].
    fn commit(&self, positions: &[Position]) -> ClientResult<()>;

    fn assignment(&self) -> ClientResult<Vec<TopicPartition>>;

    /// Low and high watermark offsets for a partition.
    fn watermarks(&self, topic: &str, partition: i32, timeout: Duration)
        -> ClientResult<(i64, i64)>;

    /// Partition ids of a topic, from broker metadata.
    fn partitions(&self, topic: &str) -> ClientResult<Vec<i32>>;

    /// Leave the group, driving revocation callbacks for the current
    /// assignment before transport resources are released on drop.
    fn close(&self);
}

/// Invoked exactly once per sent message with the durable position on
/// success or the delivery failure.
pub type DeliveryCallback = Box<dyn FnOnce(ClientResult<Position>) + Send>;

/// The producing half of the broker surface.
pub trait ProducerClient: Send + Sync {
    /// Enqueue a message; the callback fires from the client's delivery
    /// path. Delivery order is preserved per `{topic, key}`. When the
    /// message cannot be enqueued at all, the callback is invoked inline
    /// with the failure before `send` returns it.
    fn send(&self, message: OutboundMessage, on_delivery: DeliveryCallback) -> ClientResult<()>;

    /// Block until every enqueued message is acknowledged or failed.
    fn flush(&self, timeout: Duration) -> ClientResult<()>;

    /// Messages sent but not yet acknowledged.
    fn in_flight(&self) -> usize;

    fn close(&self);
}

/// Builds clients for a particular broker backend.
pub trait ClientFactory: Send + Sync {
    fn consumer(
        &self,
        config: &ConsumerConfig,
        observer: Arc<dyn ClientObserver>,
    ) -> ClientResult<Arc<dyn ConsumerClient>>;

    fn producer(&self, config: &ProducerConfig) -> ClientResult<Arc<dyn ProducerClient>>;
}
