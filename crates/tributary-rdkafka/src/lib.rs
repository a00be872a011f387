//! librdkafka backend for the tributary client seam
//!
//! Consumers are `BaseConsumer`s with a context that forwards rebalance,
//! commit and log callbacks to the seam observer; producers are
//! `ThreadedProducer`s whose delivery opaque carries the seam callback.
//! Commits are manual (`enable.auto.commit=false`): the toolkit's
//! position tracker owns commit timing.

mod consumer;
mod producer;

use std::sync::Arc;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::error::KafkaError;

use tributary::client::{ClientFactory, ClientObserver, ConsumerClient, LogLevel, ProducerClient};
use tributary::error::{ClientError, ClientResult};
use tributary::{ConsumerConfig, ProducerConfig};

pub use consumer::KafkaConsumerClient;
pub use producer::KafkaProducerClient;

/// Builds rdkafka-backed consumers and producers.
#[derive(Debug, Clone, Default)]
pub struct KafkaClientFactory;

impl KafkaClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ClientFactory for KafkaClientFactory {
    fn consumer(
        &self,
        config: &ConsumerConfig,
        observer: Arc<dyn ClientObserver>,
    ) -> ClientResult<Arc<dyn ConsumerClient>> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.hosts.join(","))
            .set("group.id", &config.group_id)
            // the toolkit's position tracker owns commit timing
            .set("enable.auto.commit", "false")
            // surfaces Polled::PartitionEof for bounded reads
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", "6000")
            .set_log_level(RDKafkaLogLevel::Info);
        if !config.client_id.is_empty() {
            client_config.set("client.id", &config.client_id);
        }
        Ok(Arc::new(KafkaConsumerClient::from_config(
            &client_config,
            observer,
        )?))
    }

    fn producer(&self, config: &ProducerConfig) -> ClientResult<Arc<dyn ProducerClient>> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.hosts.join(","))
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set_log_level(RDKafkaLogLevel::Info);
        if !config.client_id.is_empty() {
            client_config.set("client.id", &config.client_id);
        }
        Ok(Arc::new(KafkaProducerClient::from_config(&client_config)?))
    }
}

pub(crate) fn map_error(error: &KafkaError) -> ClientError {
    match error {
        KafkaError::MessageProduction(code) => {
            ClientError::Fatal(format!("message production failed: {code}"))
        }
        other => ClientError::Transport(other.to_string()),
    }
}

pub(crate) fn map_log_level(level: RDKafkaLogLevel) -> LogLevel {
    match level {
        RDKafkaLogLevel::Debug => LogLevel::Debug,
        RDKafkaLogLevel::Info | RDKafkaLogLevel::Notice => LogLevel::Info,
        RDKafkaLogLevel::Warning => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}
