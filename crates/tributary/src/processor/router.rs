//! Record routing
//!
//! A router decides whether it handles a record at all and, when it does,
//! runs the matching handler; outputs accumulate on the context.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::producer::ProducerRequest;
use crate::record::Record;

use super::context::RecordContext;

/// Dispatches records to handlers.
#[async_trait]
pub trait Router: Send + Sync {
    /// Whether any handler wants this record. Declined records are
    /// position-tracked and skipped.
    fn can_route(&self, record: &Record) -> bool;

    /// Run the handler for `ctx.record()`, appending outputs to the
    /// context. Completes when the handler finishes.
    async fn process(&self, ctx: &mut RecordContext) -> Result<()>;
}

/// A handler bound to a route: record in, output requests out.
pub type Handler =
    Arc<dyn Fn(Arc<Record>) -> BoxFuture<'static, Result<Vec<ProducerRequest>>> + Send + Sync>;

/// Routes records to handlers by exact input-topic match; the first
/// matching route wins. Handlers needing the dispatch context implement
/// [`Router`] directly instead.
#[derive(Default)]
pub struct TopicRouter {
    routes: Vec<(String, Handler)>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F, Fut>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<Record>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ProducerRequest>>> + Send + 'static,
    {
        self.routes.push((
            topic.into(),
            Arc::new(move |record| Box::pin(handler(record))),
        ));
        self
    }
}

#[async_trait]
impl Router for TopicRouter {
    fn can_route(&self, record: &Record) -> bool {
        self.routes.iter().any(|(topic, _)| topic == record.topic())
    }

    async fn process(&self, ctx: &mut RecordContext) -> Result<()> {
        let record = ctx.shared_record();
        if let Some((_, handler)) = self
            .routes
            .iter()
            .find(|(topic, _)| topic == record.topic())
        {
            for request in handler(record).await? {
                ctx.output(request);
            }
        }
        Ok(())
    }
}
