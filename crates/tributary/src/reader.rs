//! Stateless, bounded reads over topics
//!
//! Every call builds a fresh consumer with manual assignment and no
//! subscription state, so concurrent readers are independent. Streams end
//! once every assigned partition reaches the end offset captured at
//! assign time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::client::{ClientFactory, ConsumerClient, NoopObserver, Polled};
use crate::codec::{default_deserializer, Deserializer};
use crate::config::ReaderConfig;
use crate::consumer::RecordStream;
use crate::error::{Error, Result};
use crate::record::{Headers, Position, Record};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const WATERMARK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a bounded read begins.
#[derive(Debug, Clone)]
pub struct StartPosition {
    pub topic: String,
    /// `None` reads all partitions
    pub partition: Option<i32>,
    pub offset: StartOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Beginning,
    Offset(i64),
}

impl StartPosition {
    /// All partitions of `topic`, from the beginning.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: StartOffset::Beginning,
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = StartOffset::Offset(offset);
        self
    }
}

/// Builds a [`Reader`].
pub struct ReaderBuilder {
    config: ReaderConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    deserializer: Arc<dyn Deserializer>,
}

impl ReaderBuilder {
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
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

    pub fn build(self) -> Result<Reader> {
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("reader requires a client factory".into()))?;
        Ok(Reader {
            config: self.config,
            factory,
            deserializer: self.deserializer,
        })
    }
}

/// High-level bounded reads: tail ranges, latest positions, last records.
#[derive(Clone)]
pub struct Reader {
    config: ReaderConfig,
    factory: Arc<dyn ClientFactory>,
    deserializer: Arc<dyn Deserializer>,
}

impl Reader {
    pub fn builder() -> ReaderBuilder {
        ReaderBuilder {
            config: ReaderConfig::default(),
            factory: None,
            deserializer: default_deserializer(),
        }
    }

    fn consumer(&self, topic: &str) -> Result<Arc<dyn ConsumerClient>> {
        self.factory
            .consumer(&self.config.as_consumer_config(topic), Arc::new(NoopObserver))
            .map_err(Error::from)
    }

    /// Read all partitions of `topic` from the beginning until the end
    /// positions captured at assign time.
    pub async fn records(&self, topic: impl Into<String>) -> Result<RecordStream> {
        self.records_from(StartPosition::topic(topic)).await
    }

    /// Read from an explicit start until the captured end positions.
    pub async fn records_from(&self, start: StartPosition) -> Result<RecordStream> {
        let client = self.consumer(&start.topic)?;
        let ranges = {
            let client = Arc::clone(&client);
            let start = start.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<(Position, i64)>> {
                let partitions = match start.partition {
                    Some(partition) => vec![partition],
                    None => client.partitions(&start.topic)?,
                };
                let mut ranges = Vec::new();
                for partition in partitions {
                    let (low, high) =
                        client.watermarks(&start.topic, partition, WATERMARK_TIMEOUT)?;
                    let begin = match start.offset {
                        StartOffset::Beginning => low,
                        StartOffset::Offset(offset) => offset.max(low),
                    };
                    // partitions already at their end are complete up front
                    if begin < high {
                        ranges.push((Position::new(start.topic.clone(), partition, begin), high));
                    }
                }
                Ok(ranges)
            })
            .await
            .map_err(Error::handler)??
        };
        bounded_stream(client, Arc::clone(&self.deserializer), ranges)
    }

    /// End offset per partition of `topic`.
    pub async fn latest_positions(&self, topic: impl Into<String>) -> Result<Vec<Position>> {
        let topic = topic.into();
        let client = self.consumer(&topic)?;
        tokio::task::spawn_blocking(move || -> Result<Vec<Position>> {
            let mut positions = Vec::new();
            for partition in client.partitions(&topic)? {
                let (_, high) = client.watermarks(&topic, partition, WATERMARK_TIMEOUT)?;
                positions.push(Position::new(topic.clone(), partition, high));
            }
            client.close();
            Ok(positions)
        })
        .await
        .map_err(Error::handler)?
    }

    /// The last written record on each non-empty partition of `topic`.
    pub async fn last_records(&self, topic: impl Into<String>) -> Result<Vec<Record>> {
        let topic = topic.into();
        let client = self.consumer(&topic)?;
        let ranges = {
            let client = Arc::clone(&client);
            let topic = topic.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<(Position, i64)>> {
                let mut ranges = Vec::new();
                for partition in client.partitions(&topic)? {
                    let (low, high) = client.watermarks(&topic, partition, WATERMARK_TIMEOUT)?;
                    // empty partitions are skipped
                    if high > low {
                        ranges.push((Position::new(topic.clone(), partition, high - 1), high));
                    }
                }
                Ok(ranges)
            })
            .await
            .map_err(Error::handler)??
        };
        let stream = bounded_stream(client, Arc::clone(&self.deserializer), ranges)?;
        Ok(stream.collect().await)
    }
}

/// Poll assigned ranges to their captured ends, then close the client.
fn bounded_stream(
    client: Arc<dyn ConsumerClient>,
    deserializer: Arc<dyn Deserializer>,
    ranges: Vec<(Position, i64)>,
) -> Result<RecordStream> {
    let (tx, rx) = mpsc::channel(1);
    if ranges.is_empty() {
        client.close();
        return Ok(ReceiverStream::new(rx));
    }

    let starts: Vec<Position> = ranges.iter().map(|(start, _)| start.clone()).collect();
    client.assign(&starts)?;
    let mut remaining: HashMap<i32, i64> = ranges
        .into_iter()
        .map(|(start, end)| (start.partition, end))
        .collect();

    tokio::task::spawn_blocking(move || {
        while !remaining.is_empty() {
            match client.poll(POLL_TIMEOUT) {
                Ok(Polled::Record(raw)) => {
                    let partition = raw.position.partition;
                    let done = remaining
                        .get(&partition)
                        .is_some_and(|end| raw.position.offset + 1 >= *end);
                    let headers: Headers = raw.headers.into_iter().collect();
                    let value = match raw.value {
                        Some(value) => match deserializer.deserialize(value, &headers) {
                            Ok(value) => Some(value),
                            Err(error) => {
                                warn!(%error, "dropping undecodable record");
                                if done {
                                    remaining.remove(&partition);
                                }
                                continue;
                            }
                        },
                        None => None,
                    };
                    let record = Record::assemble(raw.position, raw.key, value, headers);
                    if tx.blocking_send(record).is_err() {
                        break;
                    }
                    if done {
                        remaining.remove(&partition);
                    }
                }
                Ok(Polled::PartitionEof(position)) => {
                    if remaining
                        .get(&position.partition)
                        .is_some_and(|end| position.offset >= *end)
                    {
                        remaining.remove(&position.partition);
                    }
                }
                Ok(Polled::Idle) => {}
                Err(error) => {
                    warn!(%error, "reader poll failed");
                    if error.is_fatal() {
                        break;
                    }
                }
            }
        }
        client.close();
    });

    Ok(ReceiverStream::new(rx))
}
