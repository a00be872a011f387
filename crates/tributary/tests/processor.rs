//! End-to-end processor scenarios against the in-memory broker

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::{factory, wait_until, Events};
use tributary::interceptor::EventKind;
use tributary::processor::{RecordContext, Router};
use tributary::{
    Error, Processor, ProcessorStatus, ProducerRequest, Record, TopicRouter, EVENT_TIME_HEADER,
};
use tributary_test_util::MemoryBroker;

fn seed(broker: &MemoryBroker, topic: &str, key: &str, value: &str) {
    broker.seed(
        topic,
        Some(Bytes::from(key.to_string())),
        Some(Bytes::from(value.to_string())),
        vec![],
    );
}

fn copy_request(to: &str, record: &Record) -> ProducerRequest {
    let mut request = ProducerRequest::to(to);
    request.key = record.key.clone();
    request.value = record.value.clone();
    request
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_commits_only_after_all_outputs_deliver() {
    let broker = MemoryBroker::new();
    for (key, value) in [("a", "1"), ("b", "2"), ("a", "3")] {
        seed(&broker, "orders", key, value);
    }

    let events = Events::new();
    let router = TopicRouter::new().route("orders", |record: Arc<Record>| async move {
        Ok(vec![
            copy_request("events", &record),
            copy_request("audit", &record),
        ])
    });
    let processor = Arc::new(
        Processor::builder()
            .client_id("fan-out")
            .group_id("fan-out-g")
            .input_topic("orders")
            .factory(factory(&broker))
            .router(Arc::new(router))
            .interceptor(events.clone())
            .build()
            .expect("build processor"),
    );

    let token = CancellationToken::new();
    let run = {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        tokio::spawn(async move { processor.activate(token, None).await })
    };

    wait_until("all six outputs delivered", || {
        let snapshot = events.snapshot();
        snapshot
            .iter()
            .filter(|e| matches!(e.kind, EventKind::OutputProcessed { .. }))
            .count()
            == 6
    })
    .await;

    token.cancel();
    run.await.expect("join").expect("activate");

    // every input position is committed, and only after its deliveries
    assert_eq!(broker.committed("fan-out-g", "orders", 0), Some(3));
    assert_eq!(broker.topic_records("events").len(), 3);
    assert_eq!(broker.topic_records("audit").len(), 3);

    // order within key `a` preserved on both output topics
    for topic in ["events", "audit"] {
        let key_a: Vec<Bytes> = broker
            .topic_records(topic)
            .into_iter()
            .filter(|r| r.key.as_deref() == Some(b"a"))
            .map(|r| r.value.expect("value"))
            .collect();
        assert_eq!(key_a, vec![Bytes::from("1"), Bytes::from("3")], "{topic}");
    }

    // inputs finish in consumption order
    let processed: Vec<i64> = events
        .snapshot()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::InputProcessed { record } => Some(record.offset()),
            _ => None,
        })
        .collect();
    assert_eq!(processed, vec![0, 1, 2]);
}

struct PoisonRouter {
    calls: AtomicUsize,
}

#[async_trait]
impl Router for PoisonRouter {
    fn can_route(&self, _record: &Record) -> bool {
        true
    }

    async fn process(&self, ctx: &mut RecordContext) -> tributary::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(Error::handler(std::io::Error::other("router boom")));
        }
        ctx.output(copy_request("events", ctx.record()));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poison_record_terminates_and_commits_only_the_first_input() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", "a", "good");
    seed(&broker, "orders", "b", "bad");

    let events = Events::new();
    let terminated: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let processor = Processor::builder()
        .client_id("poison")
        .group_id("poison-g")
        .input_topic("orders")
        .factory(factory(&broker))
        .router(Arc::new(PoisonRouter {
            calls: AtomicUsize::new(0),
        }))
        .interceptor(events.clone())
        .build()
        .expect("build processor");

    let on_terminated: tributary::OnTerminated = {
        let terminated = Arc::clone(&terminated);
        Box::new(move |_gaps: &[tributary::SubscriptionGap], error: Option<&Error>| {
            terminated
                .lock()
                .expect("lock poisoned")
                .push(error.is_some());
        })
    };
    processor
        .activate(CancellationToken::new(), Some(on_terminated))
        .await
        .expect("activate");

    assert_eq!(processor.status(), ProcessorStatus::Terminated);
    // first input committed, poison input not
    assert_eq!(broker.committed("poison-g", "orders", 0), Some(1));
    assert_eq!(broker.topic_records("events").len(), 1);

    let snapshot = events.snapshot();
    let input_errors: Vec<i64> = snapshot
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::InputError { record, .. } => Some(record.offset()),
            _ => None,
        })
        .collect();
    assert_eq!(input_errors, vec![1]);
    assert!(snapshot.iter().any(|e| matches!(
        &e.kind,
        EventKind::ProcessorTerminated { error: Some(_), .. }
    )));
    // the user handler ran exactly once, with the cause
    assert_eq!(*terminated.lock().expect("lock poisoned"), vec![true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebalance_flushes_outputs_before_committing() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", "a", "1");

    let events = Events::new();
    let router = TopicRouter::new().route("orders", |record: Arc<Record>| async move {
        Ok(vec![copy_request("events", &record)])
    });
    let processor = Arc::new(
        Processor::builder()
            .client_id("rebalance")
            .group_id("rebalance-g")
            .input_topic("orders")
            .factory(factory(&broker))
            .router(Arc::new(router))
            .interceptor(events.clone())
            .build()
            .expect("build processor"),
    );

    let token = CancellationToken::new();
    let run = {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        tokio::spawn(async move { processor.activate(token, None).await })
    };

    wait_until("input processed", || {
        events
            .snapshot()
            .iter()
            .any(|e| matches!(e.kind, EventKind::InputProcessed { .. }))
    })
    .await;

    broker.trigger_rebalance();

    // the revocation cycle alone flushes and commits; no stop involved
    wait_until("revocation commit", || {
        broker.committed("rebalance-g", "orders", 0) == Some(1)
    })
    .await;

    token.cancel();
    run.await.expect("join").expect("activate");

    let snapshot = events.snapshot();
    let revoked_at = snapshot
        .iter()
        .position(|e| matches!(e.kind, EventKind::PartitionsRevoked { .. }))
        .expect("revocation event");
    let last_delivery = snapshot
        .iter()
        .rposition(|e| matches!(e.kind, EventKind::OutputProcessed { .. }))
        .expect("delivery event");
    // in-flight deliveries resolved before the revocation completed
    assert!(last_delivery < revoked_at);
    // the subscription was re-assigned after the revoke
    let assigns = snapshot
        .iter()
        .filter(|e| matches!(e.kind, EventKind::PartitionsAssigned { .. }))
        .count();
    assert!(assigns >= 2, "expected re-assignment, saw {assigns}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminate_twice_yields_one_real_termination() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 1);

    let events = Events::new();
    let router = TopicRouter::new().route("orders", |_record: Arc<Record>| async move {
        Ok(Vec::new())
    });
    let processor = Arc::new(
        Processor::builder()
            .client_id("idempotent")
            .group_id("idempotent-g")
            .input_topic("orders")
            .factory(factory(&broker))
            .router(Arc::new(router))
            .interceptor(events.clone())
            .build()
            .expect("build processor"),
    );

    let token = CancellationToken::new();
    let run = {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        tokio::spawn(async move { processor.activate(token, None).await })
    };
    wait_until("activated", || {
        processor.status() == ProcessorStatus::Activated
    })
    .await;

    processor.terminate(None).await;
    processor.terminate(None).await;
    run.await.expect("join").expect("activate");

    assert_eq!(processor.status(), ProcessorStatus::Terminated);
    let snapshot = events.snapshot();
    let real = snapshot
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::ProcessorTerminated { error: None, .. }))
        .count();
    let diagnostic = snapshot
        .iter()
        .filter(|e| {
            matches!(
                &e.kind,
                EventKind::ProcessorTerminated {
                    error: Some(Error::InvalidTransition { .. }),
                    ..
                }
            )
        })
        .count();
    assert_eq!(real, 1, "exactly one real termination");
    assert!(diagnostic >= 1, "later calls are diagnostics");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_reemit_preserves_record_content() {
    let broker = MemoryBroker::new();
    broker.seed(
        "orders",
        Some(Bytes::from_static(b"k1")),
        Some(Bytes::from_static(b"\x00\x01payload")),
        vec![
            ("h1".to_string(), Bytes::from_static(b"v1")),
            (EVENT_TIME_HEADER.to_string(), Bytes::from_static(b"777")),
        ],
    );

    let router = TopicRouter::new().route("orders", |record: Arc<Record>| async move {
        let mut request = copy_request("copies", &record);
        request.headers = record.headers.clone();
        request = request.event_time(record.event_time);
        Ok(vec![request])
    });
    let processor = Arc::new(
        Processor::builder()
            .client_id("identity")
            .group_id("identity-g")
            .input_topic("orders")
            .factory(factory(&broker))
            .router(Arc::new(router))
            .build()
            .expect("build processor"),
    );

    let token = CancellationToken::new();
    let run = {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        tokio::spawn(async move { processor.activate(token, None).await })
    };
    wait_until("copy written", || broker.topic_records("copies").len() == 1).await;
    token.cancel();
    run.await.expect("join").expect("activate");

    let reader = tributary::Reader::builder()
        .client_id("verify")
        .factory(factory(&broker))
        .build()
        .expect("build reader");
    let copies = reader.last_records("copies").await.expect("read copies");
    assert_eq!(copies.len(), 1);
    let copy = &copies[0];
    assert_eq!(copy.key.as_deref(), Some(b"k1".as_slice()));
    assert_eq!(copy.value.as_deref(), Some(b"\x00\x01payload".as_slice()));
    assert_eq!(copy.event_time, 777);
    assert_eq!(copy.headers.get_str("h1"), Some("v1"));
}
