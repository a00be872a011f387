//! Per-record dispatch context

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::producer::ProducerRequest;
use crate::record::Record;

/// Carries one input record through its handler: the record itself, a
/// contextual span, the termination token, and the outputs the handler
/// generated.
pub struct RecordContext {
    record: Arc<Record>,
    token: CancellationToken,
    span: Span,
    outputs: Vec<ProducerRequest>,
}

impl RecordContext {
    pub(crate) fn new(record: Arc<Record>, token: CancellationToken) -> Self {
        let span = tracing::info_span!(
            "record",
            topic = %record.topic(),
            partition = record.partition(),
            offset = record.offset(),
        );
        Self {
            record,
            token,
            span,
            outputs: Vec::new(),
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub(crate) fn shared_record(&self) -> Arc<Record> {
        Arc::clone(&self.record)
    }

    /// Cancelled when the processor is terminating; long handlers should
    /// watch it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A span scoped to this record, for handler-side logging.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Queue an output request to be produced once the handler returns.
    pub fn output(&mut self, request: ProducerRequest) {
        self.outputs.push(request);
    }

    pub fn outputs(&self) -> &[ProducerRequest] {
        &self.outputs
    }

    pub(crate) fn take_outputs(&mut self) -> Vec<ProducerRequest> {
        std::mem::take(&mut self.outputs)
    }
}
