//! Seam consumer over the in-memory broker
//!
//! Mirrors the callback discipline of a real client: assignment,
//! revocation and commit notifications are delivered from inside `poll`
//! and `close`, never while the consumer's own state lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tributary::client::{ClientObserver, ConsumerClient, Polled, RawRecord};
use tributary::error::{ClientError, ClientResult};
use tributary::record::{Position, TopicPartition};

use crate::broker::MemoryBroker;

const IDLE_SLEEP: Duration = Duration::from_millis(2);

#[derive(Default)]
struct ConsumerState {
    subscribed: Vec<String>,
    assigned: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    /// End offset at which an EOF was last signalled, per partition;
    /// re-armed whenever the log grows past it
    eof_at: HashMap<TopicPartition, i64>,
    pending_assign: bool,
    seen_epoch: u64,
    scan_from: usize,
    closed: bool,
}

pub(crate) struct MemoryConsumer {
    broker: Arc<MemoryBroker>,
    group: String,
    observer: Arc<dyn ClientObserver>,
    state: Mutex<ConsumerState>,
}

impl MemoryConsumer {
    pub(crate) fn new(
        broker: Arc<MemoryBroker>,
        group: String,
        observer: Arc<dyn ClientObserver>,
    ) -> Self {
        Self {
            broker,
            group,
            observer,
            state: Mutex::new(ConsumerState::default()),
        }
    }

    /// Handle (re)assignment outside the state lock; returns the
    /// callbacks to fire.
    fn rebalance_step(&self) -> ClientResult<RebalanceAction> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(ClientError::Closed);
        }
        if state.subscribed.is_empty() {
            return Ok(RebalanceAction::None);
        }
        let epoch = self.broker.epoch();
        if state.pending_assign {
            state.pending_assign = false;
            state.seen_epoch = epoch;
            let mut assigned = Vec::new();
            for topic in &state.subscribed {
                for partition in self.broker.partition_ids(topic) {
                    assigned.push(TopicPartition::new(topic.clone(), partition));
                }
            }
            let mut positions = HashMap::new();
            for tp in &assigned {
                let offset = self.broker.committed_offset(&self.group, tp).unwrap_or(0);
                positions.insert(tp.clone(), offset);
            }
            state.assigned = assigned.clone();
            state.positions = positions;
            state.eof_at.clear();
            return Ok(RebalanceAction::Assigned(assigned));
        }
        if epoch != state.seen_epoch {
            state.seen_epoch = epoch;
            state.pending_assign = true;
            let revoked = std::mem::take(&mut state.assigned);
            state.positions.clear();
            state.eof_at.clear();
            return Ok(RebalanceAction::Revoked(revoked));
        }
        Ok(RebalanceAction::None)
    }

    fn fetch_step(&self) -> ClientResult<Polled> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(ClientError::Closed);
        }
        if state.assigned.is_empty() {
            return Ok(Polled::Idle);
        }
        let count = state.assigned.len();
        for step in 0..count {
            let tp = state.assigned[(state.scan_from + step) % count].clone();
            let offset = state.positions.get(&tp).copied().unwrap_or(0);
            let (record, end) = self.broker.fetch(&tp, offset);
            if let Some((stored, position)) = record {
                state.positions.insert(tp.clone(), offset + 1);
                state.scan_from = (state.scan_from + step + 1) % count;
                return Ok(Polled::Record(RawRecord {
                    position,
                    key: stored.key,
                    value: stored.value,
                    headers: stored.headers,
                }));
            }
            if offset >= end && state.eof_at.get(&tp) != Some(&end) {
                state.eof_at.insert(tp.clone(), end);
                return Ok(Polled::PartitionEof(Position::new(
                    tp.topic.clone(),
                    tp.partition,
                    end,
                )));
            }
        }
        Ok(Polled::Idle)
    }
}

enum RebalanceAction {
    None,
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

impl ConsumerClient for MemoryConsumer {
    fn subscribe(&self, topics: &[String]) -> ClientResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(ClientError::Closed);
        }
        state.subscribed = topics.to_vec();
        state.pending_assign = true;
        Ok(())
    }

    fn assign(&self, positions: &[Position]) -> ClientResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(ClientError::Closed);
        }
        state.subscribed.clear();
        state.assigned = positions.iter().map(Position::topic_partition).collect();
        state.positions = positions
            .iter()
            .map(|p| (p.topic_partition(), p.offset))
            .collect();
        state.eof_at.clear();
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> ClientResult<Polled> {
        match self.rebalance_step()? {
            RebalanceAction::Assigned(assigned) => {
                self.observer.partitions_assigned(&assigned);
            }
            RebalanceAction::Revoked(revoked) => {
                self.observer.partitions_revoked(&revoked);
                return Ok(Polled::Idle);
            }
            RebalanceAction::None => {}
        }
        let polled = self.fetch_step()?;
        if matches!(polled, Polled::Idle) {
            std::thread::sleep(IDLE_SLEEP.min(timeout));
        }
        Ok(polled)
    }

    fn commit(&self, positions: &[Position]) -> ClientResult<()> {
        self.broker.commit(&self.group, positions);
        self.observer.offsets_committed(positions);
        Ok(())
    }

    fn assignment(&self) -> ClientResult<Vec<TopicPartition>> {
        Ok(self.state.lock().expect("lock poisoned").assigned.clone())
    }

    fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        _timeout: Duration,
    ) -> ClientResult<(i64, i64)> {
        Ok((0, self.broker.end_offset(topic, partition)))
    }

    fn partitions(&self, topic: &str) -> ClientResult<Vec<i32>> {
        Ok(self.broker.partition_ids(topic))
    }

    fn close(&self) {
        let (was_subscribed, assigned) = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            (
                !state.subscribed.is_empty(),
                std::mem::take(&mut state.assigned),
            )
        };
        // manual assignment (readers) leaves the group silently
        if was_subscribed && !assigned.is_empty() {
            self.observer.partitions_revoked(&assigned);
        }
    }
}
