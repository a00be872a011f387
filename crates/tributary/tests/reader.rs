//! Bounded reads over seeded topics

mod common;

use bytes::Bytes;
use tokio_stream::StreamExt;

use common::factory;
use tributary::{Reader, Record, StartPosition};
use tributary_test_util::MemoryBroker;

fn reader(broker: &std::sync::Arc<MemoryBroker>) -> Reader {
    Reader::builder()
        .client_id("reader-test")
        .factory(factory(broker))
        .build()
        .expect("build reader")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_reads_all_partitions_to_their_captured_ends() {
    let broker = MemoryBroker::new();
    broker.create_topic("logs", 2);
    for value in ["0", "1", "2", "3"] {
        // keyless seeds round-robin across both partitions
        broker.seed("logs", None, Some(Bytes::from(value.to_string())), vec![]);
    }

    let stream = reader(&broker).records("logs").await.expect("records");
    let records: Vec<Record> = stream.collect().await;
    assert_eq!(records.len(), 4);
    for partition in [0, 1] {
        let offsets: Vec<i64> = records
            .iter()
            .filter(|r| r.partition() == partition)
            .map(Record::offset)
            .collect();
        assert_eq!(offsets, vec![0, 1], "partition {partition}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_from_starts_at_the_requested_offset() {
    let broker = MemoryBroker::new();
    for value in ["0", "1", "2"] {
        broker.seed(
            "single",
            Some(Bytes::from_static(b"k")),
            Some(Bytes::from(value.to_string())),
            vec![],
        );
    }

    let stream = reader(&broker)
        .records_from(StartPosition::topic("single").partition(0).offset(1))
        .await
        .expect("records_from");
    let records: Vec<Record> = stream.collect().await;
    let offsets: Vec<i64> = records.iter().map(Record::offset).collect();
    assert_eq!(offsets, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn latest_positions_reports_end_offsets_per_partition() {
    let broker = MemoryBroker::new();
    broker.create_topic("logs", 2);
    for value in ["0", "1", "2", "3"] {
        broker.seed("logs", None, Some(Bytes::from(value.to_string())), vec![]);
    }

    let mut positions = reader(&broker)
        .latest_positions("logs")
        .await
        .expect("latest positions");
    positions.sort_by_key(|p| p.partition);
    let ends: Vec<(i32, i64)> = positions.iter().map(|p| (p.partition, p.offset)).collect();
    assert_eq!(ends, vec![(0, 2), (1, 2)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_records_skips_empty_partitions() {
    let broker = MemoryBroker::new();
    broker.create_topic("sparse", 3);
    // keyless seeds round-robin onto partitions 0 and 1; partition 2
    // stays empty
    broker.seed("sparse", None, Some(Bytes::from_static(b"a")), vec![]);
    broker.seed("sparse", None, Some(Bytes::from_static(b"b")), vec![]);

    let mut tails = reader(&broker).last_records("sparse").await.expect("tails");
    tails.sort_by_key(Record::partition);
    assert_eq!(tails.len(), 2);
    assert_eq!(
        tails.iter().map(Record::partition).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!(tails.iter().all(|r| r.offset() == 0));

    let empty = reader(&broker).last_records("missing").await.expect("empty");
    assert!(empty.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reading_an_empty_topic_completes_immediately() {
    let broker = MemoryBroker::new();
    broker.create_topic("empty", 1);
    let stream = reader(&broker).records("empty").await.expect("records");
    let records: Vec<Record> = stream.collect().await;
    assert!(records.is_empty());
}
