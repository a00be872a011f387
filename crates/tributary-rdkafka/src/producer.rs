//! Seam producer over a `ThreadedProducer`
//!
//! The delivery opaque carries the seam callback, so each send resolves
//! exactly once from librdkafka's delivery report.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{
    BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer,
};
use rdkafka::ClientContext;

use tributary::client::{DeliveryCallback, OutboundMessage, ProducerClient};
use tributary::error::{ClientError, ClientResult};
use tributary::record::{Position, NO_TIMESTAMP};

use crate::map_error;

/// One pending delivery callback, consumed by the delivery report.
///
/// The opaque must be `Sync`; the mutex carries the `FnOnce` across that
/// bound.
pub(crate) struct DeliveryState(Mutex<Option<DeliveryCallback>>);

impl DeliveryState {
    fn new(callback: DeliveryCallback) -> Box<Self> {
        Box::new(Self(Mutex::new(Some(callback))))
    }

    fn resolve(self, outcome: ClientResult<Position>) {
        let callback = self.0.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

pub(crate) struct SeamProducerContext;

impl ClientContext for SeamProducerContext {}

impl ProducerContext for SeamProducerContext {
    type DeliveryOpaque = Box<DeliveryState>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(message) => {
                let position =
                    Position::new(message.topic(), message.partition(), message.offset())
                        .with_timestamp(message.timestamp().to_millis().unwrap_or(NO_TIMESTAMP));
                delivery_opaque.resolve(Ok(position));
            }
            Err((error, _)) => delivery_opaque.resolve(Err(map_error(error))),
        }
    }
}

/// A [`ProducerClient`] over a `ThreadedProducer`; the polling thread
/// serves delivery reports without caller involvement.
pub struct KafkaProducerClient {
    producer: ThreadedProducer<SeamProducerContext>,
}

impl KafkaProducerClient {
    pub(crate) fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let producer = config
            .create_with_context(SeamProducerContext)
            .map_err(|e| map_error(&e))?;
        Ok(Self { producer })
    }
}

impl ProducerClient for KafkaProducerClient {
    fn send(&self, message: OutboundMessage, on_delivery: DeliveryCallback) -> ClientResult<()> {
        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (name, value) in &message.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_ref()),
            });
        }
        let mut record: BaseRecord<'_, [u8], [u8], Box<DeliveryState>> =
            BaseRecord::with_opaque_to(&message.topic, DeliveryState::new(on_delivery))
                .headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key.as_ref());
        }
        if let Some(value) = &message.value {
            record = record.payload(value.as_ref());
        }
        if let Some(timestamp) = message.timestamp {
            record = record.timestamp(timestamp);
        }
        match self.producer.send(record) {
            Ok(()) => Ok(()),
            Err((error, failed)) => {
                // the callback still fires exactly once, inline
                let mapped = map_error(&error);
                failed.delivery_opaque.resolve(Err(mapped.clone()));
                Err(mapped)
            }
        }
    }

    fn flush(&self, timeout: Duration) -> ClientResult<()> {
        self.producer.flush(timeout).map_err(|e| map_error(&e))
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn close(&self) {
        let _ = self.producer.flush(Duration::from_secs(5));
    }
}
