//! The stream processor
//!
//! Subscribes to input topics, routes each record through a handler,
//! produces the handler's outputs, and tracks the input position only
//! after every output is durably acknowledged. Commits happen on the
//! auto-commit cadence, on rebalances and at termination; the shutdown
//! order (stop consumer, close producer, dispose consumer) guarantees
//! committed offsets never run ahead of durable outputs.

mod context;
mod router;

pub use context::RecordContext;
pub use router::{Handler, Router, TopicRouter};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::ClientFactory;
use crate::codec::{default_deserializer, default_serializer, Deserializer, Serializer};
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::consumer::{StreamingConsumer, SubscriptionGap};
use crate::error::{Error, Result};
use crate::interceptor::{EventKind, Interceptor, InterceptorChain};
use crate::producer::Producer;
use crate::record::Record;

const REVOCATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle status of a [`Processor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    Terminated,
    Activated,
    Terminating,
}

impl ProcessorStatus {
    fn as_str(self) -> &'static str {
        match self {
            ProcessorStatus::Terminated => "terminated",
            ProcessorStatus::Activated => "activated",
            ProcessorStatus::Terminating => "terminating",
        }
    }
}

/// Invoked exactly once when the processor has terminated, with the final
/// gap snapshot and the aggregated cause.
pub type OnTerminated = Box<dyn FnOnce(&[SubscriptionGap], Option<&Error>) + Send>;

struct Active {
    consumer: Arc<StreamingConsumer>,
    producer: Arc<Producer>,
    token: CancellationToken,
    on_terminated: Option<OnTerminated>,
}

struct Inner {
    status: ProcessorStatus,
    active: Option<Active>,
}

/// Builds a [`Processor`].
pub struct ProcessorBuilder {
    consumer_config: ConsumerConfig,
    producer_config: ProducerConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    router: Option<Arc<dyn Router>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
}

impl ProcessorBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        self.consumer_config.client_id = client_id.clone();
        self.producer_config.client_id = client_id;
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.consumer_config.group_id = group_id.into();
        self
    }

    pub fn input_topic(mut self, topic: impl Into<String>) -> Self {
        self.consumer_config.topics.push(topic.into());
        self
    }

    pub fn input_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.consumer_config
            .topics
            .extend(topics.into_iter().map(Into::into));
        self
    }

    /// Default topic for output requests that name none.
    pub fn output_topic(mut self, topic: impl Into<String>) -> Self {
        self.producer_config.topic = Some(topic.into());
        self
    }

    pub fn consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    pub fn producer_config(mut self, config: ProducerConfig) -> Self {
        self.producer_config = config;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn build(self) -> Result<Processor> {
        self.consumer_config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("processor requires a client factory".into()))?;
        let router = self
            .router
            .ok_or_else(|| Error::Configuration("processor requires a router".into()))?;
        let name: Arc<str> = Arc::from(self.consumer_config.client_id.as_str());
        let chain = Arc::new(InterceptorChain::new(Arc::clone(&name), self.interceptors));
        Ok(Processor {
            name,
            consumer_config: self.consumer_config,
            producer_config: self.producer_config,
            factory,
            router,
            chain,
            serializer: self.serializer,
            deserializer: self.deserializer,
            inner: Mutex::new(Inner {
                status: ProcessorStatus::Terminated,
                active: None,
            }),
        })
    }
}

/// A stream processor bound to one consumer group subscription and one
/// producer.
///
/// Status walks `Terminated → Activated → Terminating → Terminated`; only
/// one activation may be in progress. Outputs of one input are not
/// atomic: when one of several outputs fails, the processor terminates
/// without retracting the outputs that succeeded, and the input position
/// is never committed.
pub struct Processor {
    name: Arc<str>,
    consumer_config: ConsumerConfig,
    producer_config: ProducerConfig,
    factory: Arc<dyn ClientFactory>,
    router: Arc<dyn Router>,
    chain: Arc<InterceptorChain>,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
    inner: Mutex<Inner>,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder {
            consumer_config: ConsumerConfig::default(),
            producer_config: ProducerConfig::default(),
            factory: None,
            router: None,
            interceptors: Vec::new(),
            serializer: default_serializer(),
            deserializer: default_deserializer(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessorStatus {
        self.inner.lock().expect("lock poisoned").status
    }

    /// Subscribe and run the poll loop until the termination token fires,
    /// a handler fails, or an output delivery fails. Returns after
    /// termination has fully completed.
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn activate(
        &self,
        termination_token: CancellationToken,
        on_terminated: Option<OnTerminated>,
    ) -> Result<()> {
        let (consumer, producer, local, fatal) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.status != ProcessorStatus::Terminated || inner.active.is_some() {
                return Err(Error::InvalidTransition {
                    operation: "activate",
                    status: inner.status.as_str(),
                    cause: None,
                });
            }

            let producer = Arc::new(
                Producer::builder()
                    .config(self.producer_config.clone())
                    .factory(Arc::clone(&self.factory))
                    .serializer(Arc::clone(&self.serializer))
                    .build()?,
            );
            let consumer = Arc::new(
                StreamingConsumer::builder()
                    .config(self.consumer_config.clone())
                    .factory(Arc::clone(&self.factory))
                    .deserializer(Arc::clone(&self.deserializer))
                    .chain(Arc::clone(&self.chain))
                    .build()?,
            );
            {
                let producer = Arc::clone(&producer);
                consumer.set_flush_hook(move || {
                    let _ = producer.flush_blocking(REVOCATION_FLUSH_TIMEOUT);
                });
            }
            consumer.subscribe()?;

            let local = termination_token.child_token();
            let fatal = Arc::new(Mutex::new(None));
            inner.active = Some(Active {
                consumer: Arc::clone(&consumer),
                producer: Arc::clone(&producer),
                token: local.clone(),
                on_terminated,
            });
            inner.status = ProcessorStatus::Activated;
            (consumer, producer, local, fatal)
        };

        self.chain.emit(EventKind::ProcessorActivated);

        let mut stream = consumer.records()?;
        let cause = loop {
            tokio::select! {
                _ = local.cancelled() => {
                    break fatal.lock().expect("lock poisoned").take();
                }
                item = stream.next() => match item {
                    Some(record) => {
                        if let Err(error) = self
                            .process_record(record, &consumer, &producer, &local, &fatal)
                            .await
                        {
                            break Some(error);
                        }
                    }
                    None => {
                        // the poll worker went away on its own
                        break consumer.fatal_error().map(Error::from);
                    }
                },
            }
        };

        // release the single-slot handoff so the poll worker can never
        // wedge on it while stop waits for the worker
        drop(stream);
        self.terminate(cause).await;
        Ok(())
    }

    /// Drive one record through the router and produce its outputs.
    async fn process_record(
        &self,
        record: Record,
        consumer: &Arc<StreamingConsumer>,
        producer: &Arc<Producer>,
        token: &CancellationToken,
        fatal: &Arc<Mutex<Option<Error>>>,
    ) -> Result<()> {
        let record = Arc::new(record);
        self.chain.emit(EventKind::InputConsumed {
            record: Arc::clone(&record),
        });

        if !self.router.can_route(&record) {
            consumer.track_position(&record);
            self.chain.emit(EventKind::InputSkipped { record });
            return Ok(());
        }

        self.chain.emit(EventKind::InputReady {
            record: Arc::clone(&record),
        });

        let mut ctx = RecordContext::new(Arc::clone(&record), token.clone());
        match self.router.process(&mut ctx).await {
            // termination is handled by the outer loop
            Err(Error::Cancelled) => return Ok(()),
            Err(error) => {
                self.chain.emit(EventKind::InputError {
                    record,
                    error: error.clone(),
                });
                return Err(error);
            }
            Ok(()) => {}
        }

        let outputs = ctx.take_outputs();
        if outputs.is_empty() {
            consumer.track_position(&record);
            self.chain.emit(EventKind::InputProcessed { record });
            return Ok(());
        }

        let total = outputs.len();
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        for request in outputs {
            let chain = Arc::clone(&self.chain);
            let consumer = Arc::clone(consumer);
            let record = Arc::clone(&record);
            let succeeded = Arc::clone(&succeeded);
            let failed = Arc::clone(&failed);
            let fatal = Arc::clone(fatal);
            let token = token.clone();
            producer.produce(request, move |result| {
                chain.emit(EventKind::OutputProcessed {
                    input: Arc::clone(&record),
                    result: result.clone(),
                });
                match result.outcome {
                    Ok(_) => {
                        let done = succeeded.fetch_add(1, Ordering::SeqCst) + 1 == total;
                        if done && !failed.load(Ordering::SeqCst) {
                            consumer.track_position(&record);
                            chain.emit(EventKind::InputProcessed { record });
                        }
                    }
                    Err(error) => {
                        if !failed.swap(true, Ordering::SeqCst) {
                            chain.emit(EventKind::InputError {
                                record,
                                error: error.clone(),
                            });
                            // fire-and-forget terminate: post the cause,
                            // let the poll loop act on it
                            fatal
                                .lock()
                                .expect("lock poisoned")
                                .get_or_insert(error);
                            token.cancel();
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Terminate the processor: stop the consumer (revocation flushes the
    /// producer and commits tracked positions), close the producer,
    /// dispose the consumer. Idempotent; a second call emits only a
    /// diagnostic `ProcessorTerminated`.
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn terminate(&self, cause: Option<Error>) {
        let cause = Error::normalize_cause(cause);

        let active = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if let Some(active) = inner.active.as_ref() {
                active.token.cancel();
            }
            if inner.status != ProcessorStatus::Activated {
                let status = inner.status.as_str();
                drop(inner);
                self.chain.emit(EventKind::ProcessorTerminated {
                    gaps: Vec::new(),
                    error: Some(Error::InvalidTransition {
                        operation: "terminate",
                        status,
                        cause: cause.map(Arc::new),
                    }),
                });
                return;
            }
            inner.status = ProcessorStatus::Terminating;
            inner.active.take()
        };

        self.chain.emit(EventKind::ProcessorTerminating);

        let mut error = cause;
        let mut gaps = Vec::new();
        let mut handler = None;
        if let Some(mut active) = active {
            handler = active.on_terminated.take();
            match active.consumer.stop().await {
                Ok(snapshot) => gaps = snapshot,
                Err(stop_error) => error = Error::aggregate(error, Some(stop_error)),
            }
            if let Err(close_error) = active.producer.close().await {
                error = Error::aggregate(error, Some(close_error));
            }
            // dropping the consumer releases the broker client
            drop(active);
        }

        self.inner.lock().expect("lock poisoned").status = ProcessorStatus::Terminated;
        self.chain.emit(EventKind::ProcessorTerminated {
            gaps: gaps.clone(),
            error: error.clone(),
        });

        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(&gaps, error.as_ref()))).is_err() {
                self.chain.emit(EventKind::ProcessorTerminatedUserHandlingError {
                    detail: "on_terminated handler panicked".to_string(),
                });
            }
        }
    }
}
