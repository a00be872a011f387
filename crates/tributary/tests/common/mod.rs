#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tributary::client::ClientFactory;
use tributary::interceptor::{Interceptor, ProcessorEvent};
use tributary_test_util::{MemoryBroker, MemoryClientFactory};

pub fn factory(broker: &Arc<MemoryBroker>) -> Arc<dyn ClientFactory> {
    Arc::new(MemoryClientFactory::new(Arc::clone(broker)))
}

/// Interceptor recording every event for later assertions.
#[derive(Default)]
pub struct Events(Mutex<Vec<ProcessorEvent>>);

impl Events {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<ProcessorEvent> {
        self.0.lock().expect("lock poisoned").clone()
    }
}

impl Interceptor for Events {
    fn intercept(&self, event: &ProcessorEvent) {
        self.0.lock().expect("lock poisoned").push(event.clone());
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
