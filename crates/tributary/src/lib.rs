//! Tributary is a message-streaming application toolkit for
//! Kafka-compatible brokers.
//!
//! Applications consume records from input topics, transform them through
//! a routed handler pipeline, and produce derived records to output
//! topics; input positions are committed only after every derived record
//! is durably acknowledged. Periodic [`connector`] sources ingest
//! external data and publish it as first-class stream records,
//! deduplicated against per-destination event-time checkpoints that live
//! in the output topics themselves.
//!
//! The broker client is consumed through the [`client`] seam; the
//! `tributary-rdkafka` crate provides the production backend and
//! `tributary-test-util` an in-memory one for tests.

pub mod client;
pub mod codec;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod interceptor;
pub mod processor;
pub mod producer;
pub mod reader;
pub mod record;

pub use config::{ConsumerConfig, ProducerConfig, ReaderConfig, SourceConnectorOptions};
pub use connector::{
    Checkpoint, DataSource, ProcessingState, SourceConnector, SourceContext, SourceOperation,
    SourceRecord,
};
pub use consumer::{RecordStream, StreamingConsumer, SubscriptionGap};
pub use error::{ClientError, ClientResult, Error, Result};
pub use interceptor::{EventKind, Interceptor, InterceptorChain, ProcessorEvent};
pub use processor::{
    OnTerminated, Processor, ProcessorStatus, RecordContext, Router, TopicRouter,
};
pub use producer::{Producer, ProducerRequest, ProducerResult};
pub use reader::{Reader, StartOffset, StartPosition};
pub use record::{
    Headers, Position, Record, RecordId, TopicPartition, EVENT_TIME_HEADER, REQUEST_ID_HEADER,
    SOURCE_HEADER,
};
