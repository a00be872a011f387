//! Seam consumer over a `BaseConsumer`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Headers as _, Message};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::ClientContext;
use tracing::warn;

use tributary::client::{ClientObserver, ConsumerClient, Polled, RawRecord};
use tributary::error::{ClientError, ClientResult};
use tributary::record::{Position, TopicPartition, NO_TIMESTAMP};

use crate::{map_error, map_log_level};

const CLOSE_POLL_ATTEMPTS: usize = 50;

/// Forwards librdkafka callbacks to the seam observer.
pub(crate) struct SeamConsumerContext {
    observer: Arc<dyn ClientObserver>,
}

impl ClientContext for SeamConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        self.observer
            .log(map_log_level(level), &format!("{fac}: {log_message}"));
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(%error, reason, "librdkafka error");
        self.observer.error(&map_error(&error));
    }
}

impl ConsumerContext for SeamConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.observer.partitions_revoked(&to_topic_partitions(tpl));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                self.observer.partitions_assigned(&to_topic_partitions(tpl));
            }
            Rebalance::Error(error) => {
                self.observer.error(&map_error(error));
            }
            Rebalance::Revoke(_) => {}
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => self.observer.offsets_committed(&to_positions(offsets)),
            Err(error) => self.observer.error(&map_error(&error)),
        }
    }
}

fn to_topic_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

fn to_positions(tpl: &TopicPartitionList) -> Vec<Position> {
    tpl.elements()
        .iter()
        .filter_map(|e| match e.offset() {
            Offset::Offset(offset) => Some(Position::new(e.topic(), e.partition(), offset)),
            _ => None,
        })
        .collect()
}

/// A [`ConsumerClient`] over a manually committed `BaseConsumer`.
pub struct KafkaConsumerClient {
    consumer: BaseConsumer<SeamConsumerContext>,
}

impl KafkaConsumerClient {
    pub(crate) fn from_config(
        config: &ClientConfig,
        observer: Arc<dyn ClientObserver>,
    ) -> ClientResult<Self> {
        let consumer = config
            .create_with_context(SeamConsumerContext { observer })
            .map_err(|e| map_error(&e))?;
        Ok(Self { consumer })
    }

    /// `KafkaError::PartitionEOF` names only the partition; recover the
    /// topic from the current assignment. Readers assign a single topic,
    /// so the lookup is unambiguous where EOF matters.
    fn eof_position(&self, partition: i32) -> Option<Position> {
        let assignment = self.consumer.assignment().ok()?;
        let element = assignment
            .elements()
            .into_iter()
            .find(|e| e.partition() == partition)?;
        let (_, high) = self
            .consumer
            .fetch_watermarks(element.topic(), partition, Duration::from_secs(5))
            .ok()?;
        Some(Position::new(element.topic(), partition, high))
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn subscribe(&self, topics: &[String]) -> ClientResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(|e| map_error(&e))
    }

    fn assign(&self, positions: &[Position]) -> ClientResult<()> {
        let mut tpl = TopicPartitionList::new();
        for position in positions {
            tpl.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
            )
            .map_err(|e| map_error(&e))?;
        }
        self.consumer.assign(&tpl).map_err(|e| map_error(&e))
    }

    fn poll(&self, timeout: Duration) -> ClientResult<Polled> {
        match self.consumer.poll(timeout) {
            None => Ok(Polled::Idle),
            Some(Ok(message)) => {
                let position = Position::new(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                )
                .with_timestamp(message.timestamp().to_millis().unwrap_or(NO_TIMESTAMP));
                let headers = message
                    .headers()
                    .map(|headers| {
                        headers
                            .iter()
                            .map(|header| {
                                (
                                    header.key.to_string(),
                                    Bytes::copy_from_slice(header.value.unwrap_or_default()),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Polled::Record(RawRecord {
                    position,
                    key: message.key().map(Bytes::copy_from_slice),
                    value: message.payload().map(Bytes::copy_from_slice),
                    headers,
                }))
            }
            Some(Err(KafkaError::PartitionEOF(partition))) => match self.eof_position(partition) {
                Some(position) => Ok(Polled::PartitionEof(position)),
                None => Ok(Polled::Idle),
            },
            Some(Err(error)) => Err(map_error(&error)),
        }
    }

    fn commit(&self, positions: &[Position]) -> ClientResult<()> {
        let mut tpl = TopicPartitionList::new();
        for position in positions {
            tpl.add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
            )
            .map_err(|e| map_error(&e))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| map_error(&e))
    }

    fn assignment(&self) -> ClientResult<Vec<TopicPartition>> {
        self.consumer
            .assignment()
            .map(|tpl| to_topic_partitions(&tpl))
            .map_err(|e| map_error(&e))
    }

    fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> ClientResult<(i64, i64)> {
        self.consumer
            .fetch_watermarks(topic, partition, timeout)
            .map_err(|e| map_error(&e))
    }

    fn partitions(&self, topic: &str) -> ClientResult<Vec<i32>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), Duration::from_secs(5))
            .map_err(|e| map_error(&e))?;
        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(ClientError::UnknownPartition {
                topic: topic.to_string(),
                partition: -1,
            });
        };
        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|p| p.id())
            .collect())
    }

    fn close(&self) {
        self.consumer.unsubscribe();
        // drive the revocation callbacks before the handle drops
        for _ in 0..CLOSE_POLL_ATTEMPTS {
            match self.consumer.assignment() {
                Ok(tpl) if tpl.count() == 0 => break,
                Err(_) => break,
                _ => {
                    let _ = self.consumer.poll(Duration::from_millis(100));
                }
            }
        }
    }
}
