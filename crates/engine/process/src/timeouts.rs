//! Idle timeouts for running jobs.
//!
//! Every upload restarts the job's timer; when it fires the job is closed.
//! A job that is busy when its timer fires is retried after a fixed backoff
//! until it closes, fails for another reason, or the timer is cancelled.

use crate::error::ProcessResult;
use async_trait::async_trait;
use dashmap::DashMap;
use engine_types::JobId;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Backoff between attempts to close a busy job
pub const CLOSE_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Something that can close jobs.
#[async_trait]
pub trait JobCloser: Send + Sync {
    async fn close_job(&self, job_id: &JobId) -> ProcessResult<()>;

    fn running_jobs(&self) -> Vec<JobId>;
}

/// How a close attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    Cancelled,
}

/// Retries closing a job while it is busy.
#[derive(Debug, Clone, Copy)]
pub struct CloseRetryPolicy {
    pub backoff: Duration,
}

impl Default for CloseRetryPolicy {
    fn default() -> Self {
        Self {
            backoff: CLOSE_RETRY_BACKOFF,
        }
    }
}

impl CloseRetryPolicy {
    /// Close `job_id`, retrying for as long as it is in use.
    ///
    /// Setting `cancel` to true stops the retries.
    pub async fn close_with_retry<C: JobCloser + ?Sized>(
        &self,
        closer: &C,
        job_id: &JobId,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> ProcessResult<CloseOutcome> {
        loop {
            match closer.close_job(job_id).await {
                Ok(()) => return Ok(CloseOutcome::Closed),
                Err(e) if e.is_retryable() => {
                    warn!(
                        job_id = %job_id,
                        error = %e,
                        backoff_secs = self.backoff.as_secs(),
                        "Job busy; retrying close"
                    );
                }
                Err(e) => return Err(e),
            }

            let sleep = tokio::time::sleep(self.backoff);
            match cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        _ = sleep => {}
                        _ = wait_cancelled(cancel) => return Ok(CloseOutcome::Cancelled),
                    }
                }
                None => sleep.await,
            }
        }
    }
}

/// Resolves once cancelled; never resolves if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let cancelled = cancel.wait_for(|cancelled| *cancelled).await.is_ok();
    if !cancelled {
        std::future::pending::<()>().await;
    }
}

struct TimeoutEntry {
    generation: u64,
    cancel: watch::Sender<bool>,
}

/// Per-job idle timers.
pub struct JobTimeouts {
    closer: Arc<dyn JobCloser>,
    entries: Arc<DashMap<JobId, TimeoutEntry>>,
    generation: AtomicU64,
    policy: CloseRetryPolicy,
}

impl JobTimeouts {
    pub fn new(closer: Arc<dyn JobCloser>) -> Self {
        Self::with_policy(closer, CloseRetryPolicy::default())
    }

    pub fn with_policy(closer: Arc<dyn JobCloser>, policy: CloseRetryPolicy) -> Self {
        Self {
            closer,
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            policy,
        }
    }

    /// Close `job_id` after `timeout` unless restarted or stopped first.
    pub fn start_timeout(&self, job_id: &JobId, timeout: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        if let Some(previous) = self.entries.insert(
            job_id.clone(),
            TimeoutEntry {
                generation,
                cancel: cancel_tx,
            },
        ) {
            previous.cancel.send_replace(true);
        }

        debug!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Idle timeout started");

        let closer = self.closer.clone();
        let entries = self.entries.clone();
        let policy = self.policy;
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = wait_cancelled(&mut cancel_rx) => return,
            }

            info!(job_id = %job_id, "Idle timeout reached; closing job");
            match policy
                .close_with_retry(closer.as_ref(), &job_id, Some(cancel_rx))
                .await
            {
                Ok(CloseOutcome::Closed) => {}
                Ok(CloseOutcome::Cancelled) => {
                    debug!(job_id = %job_id, "Idle timeout close cancelled");
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Error closing job on idle timeout"),
            }
            entries.remove_if(&job_id, |_, entry| entry.generation == generation);
        });
    }

    /// Cancel the timer of `job_id`.
    pub fn stop_timeout(&self, job_id: &JobId) {
        match self.entries.remove(job_id) {
            Some((_, entry)) => {
                entry.cancel.send_replace(true);
                debug!(job_id = %job_id, "Idle timeout stopped");
            }
            None => info!(job_id = %job_id, "No idle timeout to stop"),
        }
    }

    pub fn has_timeout(&self, job_id: &JobId) -> bool {
        self.entries.contains_key(job_id)
    }

    /// Cancel every timer, then close every tracked or running job.
    ///
    /// Jobs are closed one at a time with the usual retry policy.
    pub async fn shutdown(&self) {
        let mut jobs: BTreeSet<JobId> = BTreeSet::new();
        let tracked: Vec<JobId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for job_id in tracked {
            if let Some((_, entry)) = self.entries.remove(&job_id) {
                entry.cancel.send_replace(true);
            }
            jobs.insert(job_id);
        }
        jobs.extend(self.closer.running_jobs());

        info!(jobs = jobs.len(), "Closing jobs at shutdown");
        for job_id in jobs {
            if let Err(e) = self
                .policy
                .close_with_retry(self.closer.as_ref(), &job_id, None)
                .await
            {
                error!(job_id = %job_id, error = %e, "Error closing job at shutdown");
            }
        }
    }
}
