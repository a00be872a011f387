//! Asynchronous producer with delivery callbacks and a flush discipline
//!
//! Produce enqueues and returns; the delivery callback fires exactly once
//! from the client's delivery path. The producer never retries at the
//! application layer and never throws from the awaiting variant; failures
//! travel inside the result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::client::{ClientFactory, OutboundMessage, ProducerClient};
use crate::codec::{default_serializer, Serializer};
use crate::config::ProducerConfig;
use crate::error::{Error, Result};
use crate::record::{Headers, RecordId, EVENT_TIME_HEADER, REQUEST_ID_HEADER};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// A request to append one record to an output topic.
#[derive(Debug, Clone)]
pub struct ProducerRequest {
    /// Output topic; `None` falls back to the producer's default
    pub topic: Option<String>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Headers,
    /// Explicit event time (unix ms); `None` leaves event time to the
    /// broker's log-append timestamp
    pub event_time: Option<i64>,
    /// Correlation tag echoed back in the [`ProducerResult`]
    pub request_id: Uuid,
}

impl Default for ProducerRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerRequest {
    pub fn new() -> Self {
        Self {
            topic: None,
            key: None,
            value: None,
            headers: Headers::new(),
            event_time: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Start a request addressed to `topic`.
    pub fn to(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::new()
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

    pub fn event_time(mut self, unix_ms: i64) -> Self {
        self.event_time = Some(unix_ms);
        self
    }

    pub fn request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Outcome of one produce request; the record id exists iff the record
/// was durably written.
#[derive(Debug, Clone)]
pub struct ProducerResult {
    pub request_id: Uuid,
    pub outcome: std::result::Result<RecordId, Error>,
}

impl ProducerResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }
}

/// Builds a [`Producer`] from a configuration and a client factory.
pub struct ProducerBuilder {
    config: ProducerConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    serializer: Arc<dyn Serializer>,
}

impl ProducerBuilder {
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = Some(topic.into());
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn build(self) -> Result<Producer> {
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("producer requires a client factory".into()))?;
        let client = factory.producer(&self.config)?;
        Ok(Producer {
            name: Arc::from(self.config.client_id.as_str()),
            topic: self.config.topic,
            client,
            serializer: self.serializer,
            closed: AtomicBool::new(false),
        })
    }
}

/// An asynchronous producer over a broker client.
///
/// `produce` is thread-safe; ordering is preserved per `{topic, key}` by
/// the client's single delivery path. `close` flushes then releases the
/// client and is idempotent.
pub struct Producer {
    name: Arc<str>,
    topic: Option<String>,
    client: Arc<dyn ProducerClient>,
    serializer: Arc<dyn Serializer>,
    closed: AtomicBool,
}

impl Producer {
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder {
            config: ProducerConfig::default(),
            factory: None,
            serializer: default_serializer(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured default output topic, if any.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Messages sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.client.in_flight()
    }

    /// Enqueue a send; returns immediately. The callback is invoked
    /// exactly once with the delivery outcome, possibly inline when the
    /// request cannot be enqueued at all.
    pub fn produce(
        &self,
        request: ProducerRequest,
        on_delivery: impl FnOnce(ProducerResult) + Send + 'static,
    ) {
        let request_id = request.request_id;
        let message = match self.prepare(request) {
            Ok(message) => message,
            Err(error) => {
                on_delivery(ProducerResult {
                    request_id,
                    outcome: Err(error),
                });
                return;
            }
        };

        let callback = Box::new(move |delivered: crate::error::ClientResult<crate::record::Position>| {
            on_delivery(ProducerResult {
                request_id,
                outcome: delivered
                    .map(|position| RecordId::from(&position))
                    .map_err(Error::from),
            });
        });
        if let Err(error) = self.client.send(message, callback) {
            // the client has already reported the failure through the
            // callback; nothing to do but note it
            debug!(name = %self.name, %error, "produce enqueue failed");
        }
    }

    /// Produce and await the delivery outcome. Delivery failures are
    /// reported inside the result, never as `Err`.
    pub async fn produce_sync(&self, request: ProducerRequest) -> ProducerResult {
        let request_id = request.request_id;
        let (tx, rx) = oneshot::channel();
        self.produce(request, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or_else(|_| ProducerResult {
            request_id,
            outcome: Err(Error::Client(crate::error::ClientError::Closed)),
        })
    }

    /// Block until every queued request is acknowledged or failed.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let client = Arc::clone(&self.client);
        let timeout = timeout.unwrap_or(FLUSH_TIMEOUT);
        tokio::task::spawn_blocking(move || client.flush(timeout))
            .await
            .map_err(|e| Error::Configuration(format!("flush worker failed: {e}")))?
            .map_err(Error::from)
    }

    /// Synchronous flush for revocation hooks running on the poll thread.
    pub(crate) fn flush_blocking(&self, timeout: Duration) -> Result<()> {
        self.client.flush(timeout).map_err(Error::from)
    }

    /// Flush then release the client. Idempotent.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let flushed = self.flush(None).await;
        self.client.close();
        flushed
    }

    fn prepare(&self, request: ProducerRequest) -> Result<OutboundMessage> {
        let topic = request
            .topic
            .or_else(|| self.topic.clone())
            .ok_or_else(|| {
                Error::Configuration(
                    "producer request names no topic and no default topic is configured".into(),
                )
            })?;

        let mut headers = request.headers;
        headers.append(REQUEST_ID_HEADER, request.request_id.to_string());
        if let Some(event_time) = request.event_time {
            headers.append(EVENT_TIME_HEADER, event_time.to_string());
        }

        let value = match request.value {
            Some(value) => Some(self.serializer.serialize(value, &mut headers)?),
            None => None,
        };

        Ok(OutboundMessage {
            topic,
            key: request.key,
            value,
            headers: headers.into_iter().collect(),
            timestamp: request.event_time,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_builder_assembles_fields() {
        let request = ProducerRequest::to("events")
            .key("a")
            .value("v")
            .header("h", "1")
            .event_time(42);
        assert_eq!(request.topic.as_deref(), Some("events"));
        assert_eq!(request.event_time, Some(42));
        assert_eq!(request.headers.get_str("h"), Some("1"));
    }
}
