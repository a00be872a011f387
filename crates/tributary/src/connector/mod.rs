//! The source-connector runtime
//!
//! A connector polls an external data origin on a cadence, converts raw
//! items to stream records, deduplicates them against per-destination
//! event-time checkpoints read back from the broker, and produces the
//! unseen ones. Ticks never overlap; a trigger that fires while a tick is
//! running is coalesced.

mod checkpoint;
mod record;

pub use checkpoint::{Checkpoint, SourceCheckpointManager};
pub use record::{ProcessingState, SourceOperation, SourceRecord};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ClientFactory;
use crate::config::{ProducerConfig, ReaderConfig, SourceConnectorOptions};
use crate::error::{Error, Result};
use crate::producer::Producer;
use crate::reader::Reader;
use crate::record::RecordId;

/// Ambient state of one connector tick.
pub struct SourceContext {
    name: Arc<str>,
    token: CancellationToken,
    tick: u64,
}

impl SourceContext {
    /// Push-feed integrations build a context themselves and call
    /// [`SourceConnector::process`] directly instead of running the
    /// periodic loop.
    pub fn new(name: impl Into<Arc<str>>, token: CancellationToken, tick: u64) -> Self {
        Self {
            name: name.into(),
            token,
            tick,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 1-based tick counter over the connector's lifetime.
    pub fn tick(&self) -> u64 {
        self.tick
    }
}

/// An application data source polled by the connector runtime.
///
/// Implementations only have to parse their origin into source records;
/// dedup, ordering, produce and checkpointing belong to the runtime.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch and parse one batch of upstream items.
    async fn parse_records(&mut self, ctx: &mut SourceContext) -> Result<Vec<SourceRecord>>;

    /// Invoked after a completed tick with every record of that tick,
    /// skipped ones included. Failures are isolated.
    async fn on_success(&mut self, _ctx: &mut SourceContext, _processed: &[SourceRecord]) {}

    /// Invoked when a tick fails. Failures are isolated.
    async fn on_error(&mut self, _ctx: &mut SourceContext, _error: &Error) {}
}

struct Initialized {
    producer: Arc<Producer>,
    checkpoints: SourceCheckpointManager,
}

/// Builds a [`SourceConnector`].
pub struct SourceConnectorBuilder<S> {
    source: S,
    options: SourceConnectorOptions,
    factory: Option<Arc<dyn ClientFactory>>,
    producer_config: ProducerConfig,
    reader_config: Option<ReaderConfig>,
}

impl<S: DataSource> SourceConnectorBuilder<S> {
    pub fn options(mut self, options: SourceConnectorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Await every delivery inline instead of batch-flushing.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.options.synchronous = synchronous;
        self
    }

    pub fn backoff_seconds(mut self, seconds: u64) -> Self {
        self.options.backoff_seconds = seconds;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn producer_config(mut self, config: ProducerConfig) -> Self {
        self.producer_config = config;
        self
    }

    pub fn reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader_config = Some(config);
        self
    }

    /// Default destination topic for records that name none.
    pub fn destination_topic(mut self, topic: impl Into<String>) -> Self {
        self.producer_config.topic = Some(topic.into());
        self
    }

    pub fn build(self) -> Result<SourceConnector<S>> {
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("connector requires a client factory".into()))?;
        let name: Arc<str> = if self.options.name.is_empty() {
            Arc::from(short_type_name::<S>())
        } else {
            Arc::from(self.options.name.as_str())
        };
        let mut producer_config = self.producer_config;
        if producer_config.client_id.is_empty() {
            producer_config.client_id = name.to_string();
        }
        let reader_config = self.reader_config.unwrap_or_else(|| ReaderConfig {
            client_id: format!("{name}-checkpoints"),
            group_id: format!("{name}-checkpoints"),
            hosts: producer_config.hosts.clone(),
        });
        Ok(SourceConnector {
            source: self.source,
            name,
            options: self.options,
            factory,
            producer_config,
            reader_config,
            parts: None,
        })
    }
}

fn short_type_name<S>() -> &'static str {
    std::any::type_name::<S>()
        .rsplit("::")
        .next()
        .unwrap_or("source")
}

/// Periodic runtime around a [`DataSource`].
///
/// A record is produced iff its event time exceeds the destination
/// topic's checkpoint at produce time; everything else is marked
/// `Skipped`. After a successful tick the checkpoint of each destination
/// topic equals the greatest event time produced to it, or the prior
/// checkpoint when nothing was.
pub struct SourceConnector<S> {
    source: S,
    name: Arc<str>,
    options: SourceConnectorOptions,
    factory: Arc<dyn ClientFactory>,
    producer_config: ProducerConfig,
    reader_config: ReaderConfig,
    parts: Option<Initialized>,
}

impl<S: DataSource> SourceConnector<S> {
    pub fn builder(source: S) -> SourceConnectorBuilder<S> {
        SourceConnectorBuilder {
            source,
            options: SourceConnectorOptions::default(),
            factory: None,
            producer_config: ProducerConfig::default(),
            reader_config: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll on the configured cadence until cancelled. Initialization
    /// failures end the run; tick failures are reported to the source and
    /// the next poll waits out the back-off.
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut ticker =
            tokio::time::interval(self.options.backoff().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tick += 1;
                    let mut ctx = SourceContext::new(Arc::clone(&self.name), token.clone(), tick);
                    if let Err(init_error) = self.process(&mut ctx).await {
                        error!(%init_error, "connector initialization failed");
                        return Err(init_error);
                    }
                }
            }
        }
        if let Some(parts) = self.parts.take() {
            parts.producer.close().await?;
        }
        Ok(())
    }

    /// Run a single tick: parse, dedup, produce, flush, checkpoint.
    ///
    /// Tick failures are handed to [`DataSource::on_error`] and swallowed;
    /// only initialization failures surface as `Err`.
    pub async fn process(&mut self, ctx: &mut SourceContext) -> Result<()> {
        self.ensure_initialized()?;
        match self.run_tick(ctx).await {
            Ok(records) => {
                let outcome = AssertUnwindSafe(self.source.on_success(ctx, &records))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    warn!(name = %self.name, "on_success handler panicked; isolating");
                }
                Ok(())
            }
            Err(tick_error) => {
                warn!(name = %self.name, error = %tick_error, "tick failed");
                let outcome = AssertUnwindSafe(self.source.on_error(ctx, &tick_error))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    warn!(name = %self.name, "on_error handler panicked; isolating");
                }
                Ok(())
            }
        }
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.parts.is_some() {
            return Ok(());
        }
        let producer = Producer::builder()
            .config(self.producer_config.clone())
            .factory(Arc::clone(&self.factory))
            .build()
            .map_err(|e| {
                Error::Configuration(format!("connector {} producer init failed: {e}", self.name))
            })?;
        let reader = Reader::builder()
            .config(self.reader_config.clone())
            .factory(Arc::clone(&self.factory))
            .build()
            .map_err(|e| {
                Error::Configuration(format!("connector {} reader init failed: {e}", self.name))
            })?;
        self.parts = Some(Initialized {
            producer: Arc::new(producer),
            checkpoints: SourceCheckpointManager::new(Arc::clone(&self.name), reader),
        });
        Ok(())
    }

    async fn run_tick(&mut self, ctx: &mut SourceContext) -> Result<Vec<SourceRecord>> {
        let mut records = self.source.parse_records(ctx).await?;
        // stable sort: ties keep upstream order
        records.sort_by_key(|record| record.event_time);

        for index in 0..records.len() {
            self.process_record(&mut records[index], index, ctx.token())
                .await?;
        }

        let parts = self.parts.as_mut().ok_or_else(|| {
            Error::Configuration("connector used before initialization".into())
        })?;
        if !self.options.synchronous {
            parts.producer.flush(None).await?;
        }
        for record in &records {
            record.ensure_processed().await;
        }

        let mut skipped = 0usize;
        let mut produced: HashMap<String, (RecordId, i64, usize)> = HashMap::new();
        for record in &records {
            match record.state() {
                ProcessingState::Skipped => skipped += 1,
                ProcessingState::Acked(record_id) => {
                    let topic = record
                        .destination_topic
                        .clone()
                        .unwrap_or_else(|| record_id.topic.clone());
                    // records are sorted, so the last ack per topic
                    // carries the greatest event time
                    let entry = produced
                        .entry(topic)
                        .or_insert((record_id.clone(), record.event_time, 0));
                    entry.0 = record_id;
                    entry.1 = record.event_time;
                    entry.2 += 1;
                }
                ProcessingState::Naked(error) => return Err(error),
                ProcessingState::Pending => {
                    return Err(Error::Configuration(
                        "record left pending after flush".into(),
                    ))
                }
            }
        }
        for (topic, (record_id, event_time, count)) in &produced {
            parts
                .checkpoints
                .track(topic, record_id.clone(), *event_time);
            info!(
                name = %self.name,
                topic = %topic,
                produced = count,
                checkpoint = %record_id,
                event_time = *event_time,
                "checkpoint advanced",
            );
        }
        info!(
            name = %self.name,
            tick = ctx.tick(),
            total = records.len(),
            skipped,
            "tick complete",
        );
        Ok(records)
    }

    async fn process_record(
        &mut self,
        record: &mut SourceRecord,
        index: usize,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if record.source.is_none() {
            record.source = Some(self.name.to_string());
        }
        let parts = self.parts.as_mut().ok_or_else(|| {
            Error::Configuration("connector used before initialization".into())
        })?;
        if record.destination_topic.is_none() {
            record.destination_topic = parts.producer.topic().map(String::from);
        }
        let topic = record.destination_topic.clone().ok_or_else(|| {
            Error::Configuration(format!(
                "source record {} names no destination topic and no default is configured",
                record.id,
            ))
        })?;

        let checkpoint = parts.checkpoints.get(&topic).await?;
        if record.event_time <= checkpoint.event_time {
            debug!(id = %record.id, index, event_time = record.event_time, "record seen; skipping");
            record.skip();
            return Ok(());
        }

        let request = record.to_request();
        if self.options.synchronous {
            let result = parts.producer.produce_sync(request).await;
            match result.outcome {
                Ok(record_id) => record.ack(record_id),
                Err(error) => record.nak(error),
            }
        } else {
            let cell = record.state_cell();
            parts.producer.produce(request, move |result| match result.outcome {
                Ok(record_id) => cell.resolve(ProcessingState::Acked(record_id)),
                Err(error) => cell.resolve(ProcessingState::Naked(error)),
            });
        }
        Ok(())
    }
}
