//! An in-memory broker for tests
//!
//! [`MemoryBroker`] implements the tributary client seam with seedable
//! topic logs, key-hash partitioning, an ordered asynchronous delivery
//! worker, per-topic produce-failure injection and operator-triggered
//! rebalances. Group subscriptions resume from committed offsets, so
//! commit behavior is observable end to end.

mod broker;
mod consumer;
mod producer;

pub use broker::{MemoryBroker, StoredRecord};

use std::sync::Arc;

use tributary::client::{ClientFactory, ClientObserver, ConsumerClient, ProducerClient};
use tributary::{ClientResult, ConsumerConfig, ProducerConfig};

use consumer::MemoryConsumer;
use producer::MemoryProducer;

/// Client factory handing out consumers and producers bound to one
/// [`MemoryBroker`].
pub struct MemoryClientFactory {
    broker: Arc<MemoryBroker>,
}

impl MemoryClientFactory {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

impl ClientFactory for MemoryClientFactory {
    fn consumer(
        &self,
        config: &ConsumerConfig,
        observer: Arc<dyn ClientObserver>,
    ) -> ClientResult<Arc<dyn ConsumerClient>> {
        Ok(Arc::new(MemoryConsumer::new(
            Arc::clone(&self.broker),
            config.group_id.clone(),
            observer,
        )))
    }

    fn producer(&self, _config: &ProducerConfig) -> ClientResult<Arc<dyn ProducerClient>> {
        Ok(Arc::new(MemoryProducer::new(Arc::clone(&self.broker))))
    }
}
