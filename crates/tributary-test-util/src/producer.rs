//! Seam producer over the in-memory broker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tributary::client::{DeliveryCallback, OutboundMessage, ProducerClient};
use tributary::error::{ClientError, ClientResult};

use crate::broker::{Inflight, MemoryBroker};

pub(crate) struct MemoryProducer {
    broker: Arc<MemoryBroker>,
    inflight: Arc<Inflight>,
    closed: AtomicBool,
}

impl MemoryProducer {
    pub(crate) fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            inflight: Arc::new(Inflight::default()),
            closed: AtomicBool::new(false),
        }
    }
}

impl ProducerClient for MemoryProducer {
    fn send(&self, message: OutboundMessage, on_delivery: DeliveryCallback) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            on_delivery(Err(ClientError::Closed));
            return Err(ClientError::Closed);
        }
        self.broker.produce(message, on_delivery, &self.inflight)
    }

    fn flush(&self, timeout: Duration) -> ClientResult<()> {
        if self.inflight.wait_drained(timeout) {
            Ok(())
        } else {
            Err(ClientError::Transport("flush timed out".to_string()))
        }
    }

    fn in_flight(&self) -> usize {
        self.inflight.count()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
