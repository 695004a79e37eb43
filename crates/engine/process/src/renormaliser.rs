//! Seam between the result parser and the renormalisation pipeline

use async_trait::async_trait;
use engine_types::{JobId, Quantiles};
use std::sync::Arc;
use tracing::Span;

/// Rescores persisted results when the normalisation baseline changes
#[async_trait]
pub trait Renormaliser: Send + Sync {
    /// Schedule a rescoring pass with new quantiles; may wait for queue space
    async fn renormalise(&self, quantiles: Quantiles);

    /// Wait until no rescoring is queued or running
    async fn wait_until_idle(&self);

    /// Stop accepting work and wait for the current pass to finish
    async fn shutdown(&self);
}

/// Creates the renormaliser that serves one native process
pub trait RenormaliserFactory: Send + Sync {
    fn create(&self, job_id: &JobId, span: &Span) -> Arc<dyn Renormaliser>;
}

/// Renormaliser that ignores every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenormaliser;

#[async_trait]
impl Renormaliser for NoopRenormaliser {
    async fn renormalise(&self, _quantiles: Quantiles) {}

    async fn wait_until_idle(&self) {}

    async fn shutdown(&self) {}
}

impl RenormaliserFactory for NoopRenormaliser {
    fn create(&self, _job_id: &JobId, _span: &Span) -> Arc<dyn Renormaliser> {
        Arc::new(NoopRenormaliser)
    }
}
