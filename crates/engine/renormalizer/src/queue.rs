//! Bounded rescoring queue with a single worker per job
//!
//! New quantiles arrive far more often than a rescoring pass can run. The
//! worker drains everything queued since its last pass and rescores once,
//! using the newest baseline over the window the burst covered.

use crate::normalizer::Normalizer;
use crate::score_updater::{Rescorer, ScoreUpdater};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_process::{NormaliserProcessFactory, Renormaliser, RenormaliserFactory};
use engine_storage::JobProvider;
use engine_types::{JobId, Quantiles};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument, Span};

/// Requests held before `renormalise` starts waiting
pub const QUEUE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Rescore,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
struct QuantileUpdateRequest {
    kind: RequestKind,
    quantiles_state: String,
    end_of_window: DateTime<Utc>,
}

impl QuantileUpdateRequest {
    fn rescore(quantiles: Quantiles) -> Self {
        Self {
            kind: RequestKind::Rescore,
            end_of_window: quantiles.timestamp.unwrap_or_else(Utc::now),
            quantiles_state: quantiles.quantile_state,
        }
    }

    fn shutdown() -> Self {
        Self {
            kind: RequestKind::Shutdown,
            quantiles_state: String::new(),
            end_of_window: Utc::now(),
        }
    }
}

/// What one drained batch asks the worker to do
#[derive(Debug, Default, PartialEq)]
struct Coalesced {
    earliest: Option<QuantileUpdateRequest>,
    latest: Option<QuantileUpdateRequest>,
    superseded: usize,
    shutdown: bool,
    ignored: usize,
}

impl Coalesced {
    /// Newest baseline and how much time the burst covered
    fn work(&self) -> Option<(&QuantileUpdateRequest, i64)> {
        let earliest = self.earliest.as_ref()?;
        let latest = self.latest.as_ref().unwrap_or(earliest);
        let span = (latest.end_of_window - earliest.end_of_window)
            .num_milliseconds()
            .abs();
        Some((latest, span))
    }
}

/// Keep the earliest and latest rescore of a batch; stop at a shutdown.
fn coalesce(job_id: &JobId, batch: Vec<QuantileUpdateRequest>) -> Coalesced {
    let mut result = Coalesced::default();
    for request in batch {
        if result.shutdown {
            result.ignored += 1;
            continue;
        }
        match request.kind {
            RequestKind::Shutdown => result.shutdown = true,
            RequestKind::Rescore if result.earliest.is_none() => {
                result.earliest = Some(request);
            }
            RequestKind::Rescore => {
                if let Some(previous) = result.latest.replace(request) {
                    debug!(
                        job_id = %job_id,
                        end = %previous.end_of_window,
                        "Quantiles update superseded"
                    );
                    result.superseded += 1;
                }
            }
        }
    }
    result
}

struct QueueState {
    /// Requests queued or in the batch being worked on
    pending: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn finish(&self, count: usize) {
        if count == 0 {
            return;
        }
        if self.pending.fetch_sub(count, Ordering::SeqCst) == count {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

/// Renormaliser backed by a bounded queue and one worker task
pub struct BlockingQueueRenormaliser {
    job_id: JobId,
    sender: mpsc::Sender<QuantileUpdateRequest>,
    state: Arc<QueueState>,
    worker: Mutex<Option<JoinHandle<usize>>>,
}

impl BlockingQueueRenormaliser {
    /// Start the worker; it runs inside `span`
    pub fn start(job_id: JobId, rescorer: Arc<dyn Rescorer>, span: Span) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let state = Arc::new(QueueState {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let worker = tokio::spawn(
            run_worker(job_id.clone(), receiver, rescorer, state.clone()).instrument(span),
        );

        Self {
            job_id,
            sender,
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_worker_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn enqueue(&self, request: QuantileUpdateRequest) -> bool {
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(request).await.is_err() {
            self.state.finish(1);
            return false;
        }
        true
    }
}

#[async_trait]
impl Renormaliser for BlockingQueueRenormaliser {
    async fn renormalise(&self, quantiles: Quantiles) {
        if !self.is_worker_running() {
            error!(
                job_id = %self.job_id,
                "Cannot renormalise for system changes - update worker no longer running"
            );
            return;
        }
        if !self.enqueue(QuantileUpdateRequest::rescore(quantiles)).await {
            error!(job_id = %self.job_id, "Renormalisation request dropped; worker stopped");
        }
    }

    async fn wait_until_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.is_idle() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                // A worker that died can never go idle
                _ = self.sender.closed() => return,
            }
        }
    }

    async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        self.enqueue(QuantileUpdateRequest::shutdown()).await;
        match worker.await {
            Ok(discarded) => info!(
                job_id = %self.job_id,
                discarded,
                "After shutting down renormaliser worker {discarded} requests remain unprocessed"
            ),
            Err(e) => error!(job_id = %self.job_id, error = %e, "Renormaliser worker failed"),
        }
    }
}

async fn run_worker(
    job_id: JobId,
    mut receiver: mpsc::Receiver<QuantileUpdateRequest>,
    rescorer: Arc<dyn Rescorer>,
    state: Arc<QueueState>,
) -> usize {
    let mut ignored = 0;
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = receiver.try_recv() {
            batch.push(next);
        }
        let taken = batch.len();
        let coalesced = coalesce(&job_id, batch);
        ignored += coalesced.ignored;

        if let Some((latest, window_span_ms)) = coalesced.work() {
            if let Err(e) = rescorer
                .rescore(&latest.quantiles_state, latest.end_of_window, window_span_ms)
                .await
            {
                error!(job_id = %job_id, error = %e, "Failed to renormalise for system changes");
            }
            if let Err(e) = rescorer.refresh_index().await {
                error!(job_id = %job_id, error = %e, "Failed to refresh index after renormalisation");
            }
        }

        state.finish(taken);
        if coalesced.shutdown {
            break;
        }
    }

    receiver.close();
    let mut remaining = 0;
    while receiver.try_recv().is_ok() {
        remaining += 1;
    }
    state.finish(remaining);
    ignored + remaining
}

/// Creates one queue-backed renormaliser per native process
pub struct QueueRenormaliserFactory {
    provider: Arc<dyn JobProvider>,
    normalisers: Arc<dyn NormaliserProcessFactory>,
}

impl QueueRenormaliserFactory {
    pub fn new(
        provider: Arc<dyn JobProvider>,
        normalisers: Arc<dyn NormaliserProcessFactory>,
    ) -> Self {
        Self {
            provider,
            normalisers,
        }
    }
}

impl RenormaliserFactory for QueueRenormaliserFactory {
    fn create(&self, job_id: &JobId, span: &Span) -> Arc<dyn Renormaliser> {
        let normalizer = Normalizer::new(job_id.clone(), self.normalisers.clone(), span.clone());
        let updater = ScoreUpdater::new(self.provider.clone(), normalizer);
        Arc::new(BlockingQueueRenormaliser::start(
            job_id.clone(),
            Arc::new(updater),
            span.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engine_process::ProcessResult;
    use parking_lot::Mutex as SyncMutex;
    use proptest::prelude::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Pass {
        state: String,
        end_ms: i64,
        window_span_ms: i64,
    }

    /// Records passes; the first pass waits until released
    #[derive(Default)]
    struct RecordingRescorer {
        passes: SyncMutex<Vec<Pass>>,
        refreshes: AtomicUsize,
        gate: Notify,
        gated: std::sync::atomic::AtomicBool,
        fail: bool,
    }

    impl RecordingRescorer {
        fn gated() -> Self {
            Self {
                gated: std::sync::atomic::AtomicBool::new(true),
                ..Default::default()
            }
        }

        fn release(&self) {
            self.gated.store(false, Ordering::SeqCst);
            self.gate.notify_one();
        }
    }

    #[async_trait]
    impl Rescorer for RecordingRescorer {
        async fn rescore(
            &self,
            quantiles_state: &str,
            end: DateTime<Utc>,
            window_span_ms: i64,
        ) -> ProcessResult<()> {
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.passes.lock().push(Pass {
                state: quantiles_state.to_string(),
                end_ms: end.timestamp_millis(),
                window_span_ms,
            });
            if self.fail {
                return Err(engine_process::ProcessError::ClosedJob(JobId::new("foo")));
            }
            Ok(())
        }

        async fn refresh_index(&self) -> ProcessResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quantiles(state: &str, secs: i64) -> Quantiles {
        Quantiles {
            quantile_state: state.to_string(),
            timestamp: Some(Utc.timestamp_opt(secs, 0).unwrap()),
        }
    }

    fn request(kind: RequestKind, secs: i64) -> QuantileUpdateRequest {
        QuantileUpdateRequest {
            kind,
            quantiles_state: format!("q{secs}"),
            end_of_window: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn start(rescorer: Arc<RecordingRescorer>) -> BlockingQueueRenormaliser {
        BlockingQueueRenormaliser::start(JobId::new("foo"), rescorer, Span::none())
    }

    #[tokio::test]
    async fn test_single_request_rescored() {
        let rescorer = Arc::new(RecordingRescorer::default());
        let queue = start(rescorer.clone());

        queue.renormalise(quantiles("a", 100)).await;
        queue.wait_until_idle().await;

        assert_eq!(
            *rescorer.passes.lock(),
            vec![Pass {
                state: "a".to_string(),
                end_ms: 100_000,
                window_span_ms: 0
            }]
        );
        assert_eq!(rescorer.refreshes.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_burst_coalesced_to_latest() {
        let rescorer = Arc::new(RecordingRescorer::gated());
        let queue = start(rescorer.clone());

        queue.renormalise(quantiles("first", 100)).await;
        // Let the worker pick up the first request and block on the gate
        tokio::time::sleep(Duration::from_millis(20)).await;
        for (state, secs) in [("b", 200), ("c", 300), ("d", 400)] {
            queue.renormalise(quantiles(state, secs)).await;
        }
        rescorer.release();
        queue.wait_until_idle().await;

        let passes = rescorer.passes.lock().clone();
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].state, "first");
        assert_eq!(passes[1].state, "d");
        assert_eq!(passes[1].window_span_ms, 200_000);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_worker_running() {
        let rescorer = Arc::new(RecordingRescorer {
            fail: true,
            ..Default::default()
        });
        let queue = start(rescorer.clone());

        queue.renormalise(quantiles("a", 100)).await;
        queue.wait_until_idle().await;
        queue.renormalise(quantiles("b", 200)).await;
        queue.wait_until_idle().await;

        assert_eq!(rescorer.passes.lock().len(), 2);
        assert!(queue.is_worker_running());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_worker() {
        let rescorer = Arc::new(RecordingRescorer::default());
        let queue = start(rescorer.clone());

        queue.shutdown().await;
        queue.shutdown().await;
        assert!(!queue.is_worker_running());

        // Dropped with an error log
        queue.renormalise(quantiles("late", 100)).await;
        queue.wait_until_idle().await;
        assert!(rescorer.passes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_when_nothing_queued() {
        let queue = start(Arc::new(RecordingRescorer::default()));
        tokio::time::timeout(Duration::from_secs(1), queue.wait_until_idle())
            .await
            .unwrap();
        queue.shutdown().await;
    }

    #[test]
    fn test_requests_after_shutdown_ignored() {
        let job_id = JobId::new("foo");
        let batch = vec![
            request(RequestKind::Rescore, 1),
            request(RequestKind::Shutdown, 2),
            request(RequestKind::Rescore, 3),
        ];
        let coalesced = coalesce(&job_id, batch);
        assert!(coalesced.shutdown);
        assert_eq!(coalesced.ignored, 1);
        let (latest, span) = coalesced.work().unwrap();
        assert_eq!(latest.quantiles_state, "q1");
        assert_eq!(span, 0);
    }

    proptest! {
        #[test]
        fn prop_only_earliest_and_latest_survive(ends in prop::collection::vec(0i64..100_000, 1..60)) {
            let job_id = JobId::new("foo");
            let batch: Vec<_> = ends
                .iter()
                .map(|secs| request(RequestKind::Rescore, *secs))
                .collect();
            let coalesced = coalesce(&job_id, batch);

            let first = ends[0];
            let last = ends[ends.len() - 1];
            prop_assert_eq!(coalesced.superseded, ends.len().saturating_sub(2));
            let (latest, span) = coalesced.work().unwrap();
            prop_assert_eq!(latest.quantiles_state.clone(), format!("q{last}"));
            prop_assert_eq!(span, (last - first).abs() * 1000);
            prop_assert!(!coalesced.shutdown);
        }
    }
}
