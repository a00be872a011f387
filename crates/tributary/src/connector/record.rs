//! Connector-domain records with per-record completion state

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Error;
use crate::producer::ProducerRequest;
use crate::record::{Headers, RecordId, SOURCE_HEADER};

/// What a source item represents upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOperation {
    Snapshot,
    Insert,
    Update,
    Delete,
}

/// Processing outcome of one source record within a tick.
///
/// `Pending` is the only non-terminal state; the first transition out of
/// it wins and later transitions are ignored.
#[derive(Debug, Clone)]
pub enum ProcessingState {
    Pending,
    /// Deduplicated against the destination-topic checkpoint
    Skipped,
    /// Durably written as `record_id`
    Acked(RecordId),
    /// Delivery failed
    Naked(Error),
}

impl ProcessingState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProcessingState::Pending)
    }
}

/// Set-once completion cell shared between a record and the delivery
/// callback that resolves it.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<ProcessingState>>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ProcessingState::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn resolve(&self, state: ProcessingState) {
        self.tx.send_if_modified(|current| {
            if current.is_pending() {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn current(&self) -> ProcessingState {
        self.tx.borrow().clone()
    }

    async fn terminal(&self) -> ProcessingState {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            // the sender cannot drop while the record is alive
            Err(_) => self.current(),
        };
        result
    }
}

/// A record parsed from an external data origin, carrying dedup metadata
/// and a completion future.
#[derive(Clone)]
pub struct SourceRecord {
    /// Upstream identity of the item
    pub id: String,
    /// Producing connector; defaulted to the connector name
    pub source: Option<String>,
    /// Destination topic; defaulted to the producer's topic
    pub destination_topic: Option<String>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Headers,
    /// Event time in unix ms; the dedup ordering key
    pub event_time: i64,
    /// Upstream type or schema name
    pub record_type: Option<String>,
    pub operation: SourceOperation,
    pub request_id: Uuid,
    state: StateCell,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, event_time: i64) -> Self {
        Self {
            id: id.into(),
            source: None,
            destination_topic: None,
            key: None,
            value: None,
            headers: Headers::new(),
            event_time,
            record_type: None,
            operation: SourceOperation::Insert,
            request_id: Uuid::new_v4(),
            state: StateCell::new(),
        }
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn destination_topic(mut self, topic: impl Into<String>) -> Self {
        self.destination_topic = Some(topic.into());
        self
    }

    pub fn record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    pub fn operation(mut self, operation: SourceOperation) -> Self {
        self.operation = operation;
        self
    }

    pub fn state(&self) -> ProcessingState {
        self.state.current()
    }

    /// Resolves once the record reaches a terminal state.
    pub async fn ensure_processed(&self) -> ProcessingState {
        self.state.terminal().await
    }

    /// Mark deduplicated. Ignored after a terminal transition.
    pub fn skip(&self) {
        self.state.resolve(ProcessingState::Skipped);
    }

    /// Mark durably written. Ignored after a terminal transition.
    pub fn ack(&self, record_id: RecordId) {
        self.state.resolve(ProcessingState::Acked(record_id));
    }

    /// Mark failed. Ignored after a terminal transition.
    pub fn nak(&self, error: Error) {
        self.state.resolve(ProcessingState::Naked(error));
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Build the produce request for this record.
    pub(crate) fn to_request(&self) -> ProducerRequest {
        let mut request = ProducerRequest::new()
            .event_time(self.event_time)
            .request_id(self.request_id);
        request.topic = self.destination_topic.clone();
        request.key = self.key.clone();
        request.value = self.value.clone();
        request.headers = self.headers.clone();
        if let Some(source) = &self.source {
            request.headers.append(SOURCE_HEADER, source.clone());
        }
        request
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record_id() -> RecordId {
        RecordId {
            topic: "meters".into(),
            partition: 0,
            offset: 7,
        }
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let record = SourceRecord::new("item-1", 100);
        assert!(record.state().is_pending());

        record.ack(record_id());
        record.nak(Error::Cancelled);
        record.skip();

        match record.ensure_processed().await {
            ProcessingState::Acked(id) => assert_eq!(id, record_id()),
            other => panic!("expected ack to stick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_processed_unblocks_on_transition() {
        let record = SourceRecord::new("item-1", 100);
        let waiter = {
            let record = record.clone();
            tokio::spawn(async move { record.ensure_processed().await })
        };
        record.skip();
        let state = waiter.await.expect("waiter panicked");
        assert!(matches!(state, ProcessingState::Skipped));
    }
}
