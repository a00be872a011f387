//! Event-time checkpoints derived from destination-topic tails
//!
//! There is no separate checkpoint store: the truth is the output topic
//! itself. On first access per topic the manager reads the last record of
//! each partition, keeps the newest one written by this connector, and
//! caches it. Updates are monotonic. If a retention policy deletes the
//! newest record of a destination topic, rehydration regresses to the
//! newest surviving one; records older than that may be produced again.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::reader::Reader;
use crate::record::{RecordId, SOURCE_HEADER};

/// The greatest event time this connector has observed on one destination
/// topic, with the record that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub record_id: Option<RecordId>,
    pub event_time: i64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            record_id: None,
            event_time: i64::MIN,
        }
    }
}

/// Lazily rehydrated, in-memory checkpoints keyed by destination topic.
/// Single-writer: only the connector runtime mutates it, one tick at a
/// time.
pub struct SourceCheckpointManager {
    source_name: Arc<str>,
    reader: Reader,
    checkpoints: HashMap<String, Checkpoint>,
}

impl SourceCheckpointManager {
    pub fn new(source_name: impl Into<Arc<str>>, reader: Reader) -> Self {
        Self {
            source_name: source_name.into(),
            reader,
            checkpoints: HashMap::new(),
        }
    }

    /// The active checkpoint for `topic`, scanning the topic's partition
    /// tails on first access.
    pub async fn get(&mut self, topic: &str) -> Result<Checkpoint> {
        if let Some(checkpoint) = self.checkpoints.get(topic) {
            return Ok(checkpoint.clone());
        }
        let tails = self.reader.last_records(topic).await?;
        let checkpoint = tails
            .into_iter()
            .filter(|record| {
                record
                    .headers
                    .get_str(SOURCE_HEADER)
                    .is_some_and(|source| source == self.source_name.as_ref())
            })
            .max_by_key(|record| record.event_time)
            .map(|record| Checkpoint {
                event_time: record.event_time,
                record_id: Some(record.id),
            })
            .unwrap_or_default();
        debug!(
            source = %self.source_name,
            topic,
            event_time = checkpoint.event_time,
            "checkpoint rehydrated",
        );
        self.checkpoints.insert(topic.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Advance the in-memory checkpoint for `topic`. Non-monotonic
    /// updates are rejected.
    pub fn track(&mut self, topic: &str, record_id: RecordId, event_time: i64) -> bool {
        let checkpoint = self.checkpoints.entry(topic.to_string()).or_default();
        if event_time <= checkpoint.event_time {
            return false;
        }
        checkpoint.event_time = event_time;
        checkpoint.record_id = Some(record_id);
        true
    }

    /// The cached checkpoint, if `topic` has been touched this lifetime.
    pub fn cached(&self, topic: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(topic)
    }
}
