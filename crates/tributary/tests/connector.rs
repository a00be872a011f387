//! Source-connector scenarios: dedup, checkpoint advance, rehydration

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::{factory, wait_until};
use tributary::{
    DataSource, Error, ProcessingState, SourceConnector, SourceContext, SourceRecord,
    EVENT_TIME_HEADER,
};
use tributary_test_util::MemoryBroker;

/// Upstream items as `(id, event_time, value)`.
type Items = Vec<(&'static str, i64, &'static str)>;

#[derive(Default)]
struct Outcomes {
    successes: Vec<Vec<ProcessingState>>,
    errors: Vec<String>,
}

struct MeterSource {
    items: Items,
    outcomes: Arc<Mutex<Outcomes>>,
}

impl MeterSource {
    fn new(items: Items) -> (Self, Arc<Mutex<Outcomes>>) {
        let outcomes = Arc::new(Mutex::new(Outcomes::default()));
        (
            Self {
                items,
                outcomes: Arc::clone(&outcomes),
            },
            outcomes,
        )
    }
}

#[async_trait]
impl DataSource for MeterSource {
    async fn parse_records(
        &mut self,
        _ctx: &mut SourceContext,
    ) -> tributary::Result<Vec<SourceRecord>> {
        Ok(self
            .items
            .iter()
            .map(|(id, event_time, value)| {
                SourceRecord::new(*id, *event_time)
                    .key(Bytes::from(id.to_string()))
                    .value(Bytes::from(value.to_string()))
            })
            .collect())
    }

    async fn on_success(&mut self, _ctx: &mut SourceContext, processed: &[SourceRecord]) {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .successes
            .push(processed.iter().map(|r| r.state()).collect());
    }

    async fn on_error(&mut self, _ctx: &mut SourceContext, error: &Error) {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .errors
            .push(error.to_string());
    }
}

fn connector(
    broker: &Arc<MemoryBroker>,
    items: Items,
) -> (SourceConnector<MeterSource>, Arc<Mutex<Outcomes>>) {
    let (source, outcomes) = MeterSource::new(items);
    let connector = SourceConnector::builder(source)
        .name("meter-source")
        .factory(factory(broker))
        .destination_topic("meters")
        .build()
        .expect("build connector");
    (connector, outcomes)
}

async fn tick(connector: &mut SourceConnector<MeterSource>, n: u64) {
    let mut ctx = SourceContext::new(
        connector.name().to_string(),
        CancellationToken::new(),
        n,
    );
    connector.process(&mut ctx).await.expect("process tick");
}

fn stored_event_times(broker: &MemoryBroker) -> Vec<String> {
    broker
        .topic_records("meters")
        .into_iter()
        .map(|record| {
            record
                .headers
                .iter()
                .rev()
                .find(|(name, _)| name == EVENT_TIME_HEADER)
                .map(|(_, value)| String::from_utf8_lossy(value).to_string())
                .expect("event time header")
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_run_produces_in_event_time_order_and_advances_checkpoint() {
    let broker = MemoryBroker::new();
    // deliberately unordered upstream
    let (mut connector, outcomes) =
        connector(&broker, vec![("m2", 200, "b"), ("m1", 100, "a"), ("m3", 300, "c")]);

    tick(&mut connector, 1).await;

    assert_eq!(stored_event_times(&broker), vec!["100", "200", "300"]);
    {
        let outcomes = outcomes.lock().expect("lock poisoned");
        assert_eq!(outcomes.successes.len(), 1);
        assert!(outcomes.successes[0]
            .iter()
            .all(|state| matches!(state, ProcessingState::Acked(_))));
        assert!(outcomes.errors.is_empty());
    }

    // same upstream again on the same connector: everything deduplicated
    tick(&mut connector, 2).await;
    assert_eq!(broker.topic_records("meters").len(), 3);
    {
        let outcomes = outcomes.lock().expect("lock poisoned");
        assert_eq!(outcomes.successes.len(), 2);
        assert_eq!(outcomes.successes[1].len(), 3);
        assert!(outcomes.successes[1]
            .iter()
            .all(|state| matches!(state, ProcessingState::Skipped)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_connector_rehydrates_checkpoint_from_topic() {
    let broker = MemoryBroker::new();
    let (mut first, _) =
        connector(&broker, vec![("m1", 100, "a"), ("m2", 200, "b"), ("m3", 300, "c")]);
    tick(&mut first, 1).await;
    drop(first);

    // a brand-new instance derives its checkpoint from the topic tail
    let (mut second, outcomes) =
        connector(&broker, vec![("m1", 100, "a"), ("m2", 200, "b"), ("m3", 300, "c")]);
    tick(&mut second, 1).await;

    assert_eq!(broker.topic_records("meters").len(), 3);
    let outcomes = outcomes.lock().expect("lock poisoned");
    assert!(outcomes.successes[0]
        .iter()
        .all(|state| matches!(state, ProcessingState::Skipped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_advance_skips_seen_and_produces_unseen() {
    let broker = MemoryBroker::new();
    let (mut first, _) =
        connector(&broker, vec![("m1", 100, "a"), ("m2", 200, "b"), ("m3", 300, "c")]);
    tick(&mut first, 1).await;
    drop(first);

    let (mut second, outcomes) = connector(&broker, vec![("m4", 250, "d"), ("m5", 350, "e")]);
    tick(&mut second, 1).await;

    assert_eq!(stored_event_times(&broker), vec!["100", "200", "300", "350"]);
    {
        let outcomes = outcomes.lock().expect("lock poisoned");
        assert!(matches!(outcomes.successes[0][0], ProcessingState::Skipped));
        assert!(matches!(outcomes.successes[0][1], ProcessingState::Acked(_)));
    }

    // the advanced checkpoint holds: nothing new on a re-run
    tick(&mut second, 2).await;
    assert_eq!(broker.topic_records("meters").len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synchronous_mode_awaits_each_delivery_inline() {
    let broker = MemoryBroker::new();
    let (source, outcomes) = MeterSource::new(vec![("m1", 100, "a")]);
    let mut connector = SourceConnector::builder(source)
        .name("meter-source")
        .synchronous(true)
        .factory(factory(&broker))
        .destination_topic("meters")
        .build()
        .expect("build connector");

    tick(&mut connector, 1).await;

    assert_eq!(broker.topic_records("meters").len(), 1);
    let outcomes = outcomes.lock().expect("lock poisoned");
    assert!(matches!(
        outcomes.successes[0][0],
        ProcessingState::Acked(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn produce_failure_reports_through_on_error() {
    let broker = MemoryBroker::new();
    broker.fail_produces_to("meters");
    let (mut connector, outcomes) = connector(&broker, vec![("m1", 100, "a")]);

    tick(&mut connector, 1).await;

    let outcomes = outcomes.lock().expect("lock poisoned");
    assert!(outcomes.successes.is_empty());
    assert_eq!(outcomes.errors.len(), 1);
    assert!(outcomes.errors[0].contains("injected produce failure"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_without_destination_fail_the_tick_when_no_default_exists() {
    let broker = MemoryBroker::new();
    let (source, outcomes) = MeterSource::new(vec![("m1", 100, "a")]);
    let mut connector = SourceConnector::builder(source)
        .name("meter-source")
        .factory(factory(&broker))
        .build()
        .expect("build connector");

    tick(&mut connector, 1).await;

    let outcomes = outcomes.lock().expect("lock poisoned");
    assert!(outcomes.successes.is_empty());
    assert_eq!(outcomes.errors.len(), 1);
    assert!(outcomes.errors[0].contains("destination topic"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn periodic_run_polls_and_stops_on_cancellation() {
    let broker = MemoryBroker::new();
    let (source, _outcomes) = MeterSource::new(vec![("m1", 100, "a"), ("m2", 200, "b")]);
    let connector = SourceConnector::builder(source)
        .name("meter-source")
        .backoff_seconds(1)
        .factory(factory(&broker))
        .destination_topic("meters")
        .build()
        .expect("build connector");

    let token = CancellationToken::new();
    let run = {
        let token = token.clone();
        tokio::spawn(async move { connector.run(token).await })
    };
    wait_until("first tick produced", || {
        broker.topic_records("meters").len() == 2
    })
    .await;
    token.cancel();
    run.await.expect("join").expect("run");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connector_name_defaults_to_source_type_name() {
    let broker = MemoryBroker::new();
    let (source, _) = MeterSource::new(vec![]);
    let connector = SourceConnector::builder(source)
        .factory(factory(&broker))
        .destination_topic("meters")
        .build()
        .expect("build connector");
    assert_eq!(connector.name(), "MeterSource");
}
