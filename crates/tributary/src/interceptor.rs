//! Lifecycle events and the interceptor chain
//!
//! Events are plain values fanned out to observers in declaration order.
//! The chain is composed once at construction and never mutated after
//! activation; a panicking interceptor is isolated and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::client::LogLevel;
use crate::consumer::SubscriptionGap;
use crate::error::{ClientError, Error};
use crate::producer::ProducerResult;
use crate::record::{Position, Record, TopicPartition};

/// A lifecycle event together with the identity of the component that
/// emitted it.
#[derive(Debug, Clone)]
pub struct ProcessorEvent {
    pub source: Arc<str>,
    pub kind: EventKind,
}

/// The closed vocabulary of lifecycle events.
#[derive(Debug, Clone)]
pub enum EventKind {
    ConsumerLog {
        level: LogLevel,
        message: String,
    },
    ConsumerError {
        error: ClientError,
    },
    PartitionsAssigned {
        partitions: Vec<TopicPartition>,
    },
    PartitionsRevoked {
        partitions: Vec<TopicPartition>,
    },
    PartitionsLost {
        partitions: Vec<TopicPartition>,
    },
    PositionsCommitted {
        positions: Vec<Position>,
    },
    PartitionEndReached {
        position: Position,
    },
    ProcessorActivated,
    ProcessorTerminating,
    ProcessorTerminated {
        gaps: Vec<SubscriptionGap>,
        error: Option<Error>,
    },
    /// A record was pulled off the input stream
    InputConsumed {
        record: Arc<Record>,
    },
    /// The router accepted the record; a handler is about to run
    InputReady {
        record: Arc<Record>,
    },
    /// The router declined the record; its position was tracked as-is
    InputSkipped {
        record: Arc<Record>,
    },
    /// Every output of the record was durably acknowledged (or there were
    /// none) and its position is ready to commit
    InputProcessed {
        record: Arc<Record>,
    },
    InputError {
        record: Arc<Record>,
        error: Error,
    },
    /// A single output delivery completed, successfully or not
    OutputProcessed {
        input: Arc<Record>,
        result: ProducerResult,
    },
    /// The user `on_terminated` handler itself failed
    ProcessorTerminatedUserHandlingError {
        detail: String,
    },
}

/// An observer of lifecycle events. Interceptors must not mutate state the
/// toolkit relies on and may be invoked concurrently from the poll loop
/// and delivery paths.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, event: &ProcessorEvent);
}

impl<F> Interceptor for F
where
    F: Fn(&ProcessorEvent) + Send + Sync,
{
    fn intercept(&self, event: &ProcessorEvent) {
        self(event)
    }
}

/// An ordered, immutable fan-out of events: the built-in event logger and
/// broker-log adapter at the head, user interceptors after, in
/// declaration order.
pub struct InterceptorChain {
    source: Arc<str>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(source: impl Into<Arc<str>>, user: Vec<Arc<dyn Interceptor>>) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(EventLogger), Arc::new(ClientLogAdapter)];
        interceptors.extend(user);
        Self {
            source: source.into(),
            interceptors,
        }
    }

    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    pub fn emit(&self, kind: EventKind) {
        let event = ProcessorEvent {
            source: Arc::clone(&self.source),
            kind,
        };
        for interceptor in &self.interceptors {
            if catch_unwind(AssertUnwindSafe(|| interceptor.intercept(&event))).is_err() {
                warn!(source = %event.source, "interceptor panicked; isolating");
            }
        }
    }
}

/// Built-in interceptor translating lifecycle events into `tracing`.
struct EventLogger;

impl Interceptor for EventLogger {
    fn intercept(&self, event: &ProcessorEvent) {
        let source = event.source.as_ref();
        match &event.kind {
            // broker-client log traffic belongs to the adapter below
            EventKind::ConsumerLog { .. } | EventKind::ConsumerError { .. } => {}
            EventKind::PartitionsAssigned { partitions } => {
                info!(source, count = partitions.len(), "partitions assigned")
            }
            EventKind::PartitionsRevoked { partitions } => {
                info!(source, count = partitions.len(), "partitions revoked")
            }
            EventKind::PartitionsLost { partitions } => {
                warn!(source, count = partitions.len(), "partitions lost")
            }
            EventKind::PositionsCommitted { positions } => {
                debug!(source, count = positions.len(), "positions committed")
            }
            EventKind::PartitionEndReached { position } => {
                debug!(source, %position, "partition end reached")
            }
            EventKind::ProcessorActivated => info!(source, "processor activated"),
            EventKind::ProcessorTerminating => info!(source, "processor terminating"),
            EventKind::ProcessorTerminated { gaps, error } => match error {
                Some(error) => error!(source, gaps = gaps.len(), %error, "processor terminated"),
                None => info!(source, gaps = gaps.len(), "processor terminated"),
            },
            EventKind::InputConsumed { record } => {
                debug!(source, position = %record.position, "input consumed")
            }
            EventKind::InputReady { record } => {
                debug!(source, position = %record.position, "input ready")
            }
            EventKind::InputSkipped { record } => {
                debug!(source, position = %record.position, "input skipped")
            }
            EventKind::InputProcessed { record } => {
                debug!(source, position = %record.position, "input processed")
            }
            EventKind::InputError { record, error } => {
                error!(source, position = %record.position, %error, "input error")
            }
            EventKind::OutputProcessed { input, result } => match &result.outcome {
                Ok(record_id) => {
                    debug!(source, input = %input.position, %record_id, "output processed")
                }
                Err(error) => {
                    warn!(source, input = %input.position, %error, "output failed")
                }
            },
            EventKind::ProcessorTerminatedUserHandlingError { detail } => {
                error!(source, detail = %detail, "terminated-handler error")
            }
        }
    }
}

/// Built-in interceptor forwarding broker-client log lines and errors.
struct ClientLogAdapter;

impl Interceptor for ClientLogAdapter {
    fn intercept(&self, event: &ProcessorEvent) {
        let source = event.source.as_ref();
        match &event.kind {
            EventKind::ConsumerLog { level, message } => match level {
                LogLevel::Debug => debug!(source, "{message}"),
                LogLevel::Info => info!(source, "{message}"),
                LogLevel::Warn => warn!(source, "{message}"),
                LogLevel::Error => error!(source, "{message}"),
            },
            EventKind::ConsumerError { error } => {
                warn!(source, %error, "broker client error")
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn user_interceptors_run_in_declaration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(
            "proc-1",
            vec![
                Arc::new(OrderProbe(seen.clone(), "first")),
                Arc::new(OrderProbe(seen.clone(), "second")),
            ],
        );
        chain.emit(EventKind::ProcessorActivated);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    struct OrderProbe(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl Interceptor for OrderProbe {
        fn intercept(&self, _event: &ProcessorEvent) {
            self.0.lock().expect("lock poisoned").push(self.1);
        }
    }

    #[test]
    fn panicking_interceptor_is_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let panicking: Arc<dyn Interceptor> = Arc::new(|_: &ProcessorEvent| {
            panic!("observer bug");
        });
        let chain = InterceptorChain::new(
            "proc-1",
            vec![panicking, Arc::new(OrderProbe(seen.clone(), "after"))],
        );
        chain.emit(EventKind::ProcessorActivated);
        chain.emit(EventKind::ProcessorTerminating);
        assert_eq!(*seen.lock().unwrap(), vec!["after", "after"]);
    }
}
