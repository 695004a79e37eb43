//! Process manager - one native process per running job.
//!
//! A job becomes running on its first upload and stays running until it is
//! closed, either explicitly or by its idle timeout. The manager owns the map
//! from job id to live process; each operation looks the job up, claims it
//! for a single action and drives the process through its handle.

use crate::alerts::{Alert, AlertTrigger};
use crate::control::ControlMessage;
use crate::error::{ProcessError, ProcessResult};
use crate::factory::{ProcessFactory, RestoreState};
use crate::flush::FlushOutcome;
use crate::handle::{JobAction, JobProcessHandle};
use crate::renormaliser::RenormaliserFactory;
use crate::timeouts::{CloseRetryPolicy, JobCloser};
use crate::writer::UploadLimits;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use engine_storage::{JobProvider, ResultsPersister, Storage};
use engine_types::{DataCounts, DataLoadParams, InterimResultsParams, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span, instrument, warn};

/// Configuration for the process manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessManagerConfig {
    /// How often a flush wait re-checks that the process is alive.
    #[serde(with = "duration_secs")]
    pub flush_poll_interval: Duration,

    /// How long a failed job's result parser may take to finish.
    #[serde(with = "duration_secs")]
    pub parser_join_timeout: Duration,

    /// Acceptable proportions of bad input per upload.
    pub max_bad_timestamp_percent: u64,
    pub max_out_of_order_percent: u64,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        let limits = UploadLimits::default();
        Self {
            flush_poll_interval: Duration::from_secs(1),
            parser_join_timeout: Duration::from_secs(5),
            max_bad_timestamp_percent: limits.max_bad_timestamp_percent,
            max_out_of_order_percent: limits.max_out_of_order_percent,
        }
    }
}

impl ProcessManagerConfig {
    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_bad_timestamp_percent: self.max_bad_timestamp_percent,
            max_out_of_order_percent: self.max_out_of_order_percent,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Owns the native processes of all running jobs.
pub struct ProcessManager {
    jobs: DashMap<JobId, Arc<JobProcessHandle>>,
    provider: Arc<dyn JobProvider>,
    persister: Arc<dyn ResultsPersister>,
    processes: Arc<dyn ProcessFactory>,
    renormalisers: Arc<dyn RenormaliserFactory>,
    config: ProcessManagerConfig,
    create_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl ProcessManager {
    pub fn new<S: Storage + 'static>(
        storage: Arc<S>,
        processes: Arc<dyn ProcessFactory>,
        renormalisers: Arc<dyn RenormaliserFactory>,
        config: ProcessManagerConfig,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            provider: storage.clone(),
            persister: storage,
            processes,
            renormalisers,
            config,
            create_lock: tokio::sync::Mutex::new(()),
            shutdown: watch::channel(false).0,
        }
    }

    /// Send an upload to the job's process, starting it if needed.
    ///
    /// Returns the job's data counts including this upload.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn load_data<R>(
        &self,
        job_id: &JobId,
        input: R,
        params: DataLoadParams,
    ) -> ProcessResult<DataCounts>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let (handle, created) = self.get_or_create(job_id).await?;
        let _guard = handle.try_acquire(JobAction::Writing)?;

        handle.check_alive().await?;

        if let Some(range) = params.reset_buckets {
            if created {
                warn!(parent: handle.span(), range = %range, "Cannot reset buckets of a job with no earlier data");
            } else {
                debug!(parent: handle.span(), range = %range, "Resetting buckets");
                handle
                    .send_control(&ControlMessage::ResetBuckets(range))
                    .await?;
            }
        }

        let result = handle
            .write_data(input, params, self.config.upload_limits(), &*self.persister)
            .await;

        let totals = handle.data_counts().await;
        if let Err(e) = self.persister.persist_data_counts(job_id, &totals).await {
            warn!(parent: handle.span(), error = %e, "Failed to persist data counts");
        }

        let counts = result?;
        handle.check_alive().await?;
        debug!(
            parent: handle.span(),
            processed = counts.processed_record_count,
            "Upload complete"
        );
        Ok(counts)
    }

    /// Make the process analyse everything it has been sent.
    ///
    /// Returns once the process has acknowledged the flush and any
    /// rescoring it triggered is done.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn flush(&self, job_id: &JobId, params: InterimResultsParams) -> ProcessResult<()> {
        let Some(handle) = self.handle(job_id) else {
            info!("No running process to flush");
            return Ok(());
        };
        let _guard = handle.try_acquire(JobAction::Flushing)?;

        handle.check_alive().await?;
        if params.calc_interim {
            handle
                .send_control(&ControlMessage::CalcInterim(params.time_range))
                .await?;
        }
        let flush_id = handle.request_flush().await?;
        if let Err(e) = self.wait_for_flush(&handle, &flush_id).await {
            handle.forget_flush(&flush_id);
            return Err(e);
        }
        handle.renormaliser().wait_until_idle().await;
        handle.check_alive().await?;

        debug!(parent: handle.span(), flush_id = %flush_id, "Flush complete");
        Ok(())
    }

    async fn wait_for_flush(&self, handle: &JobProcessHandle, flush_id: &str) -> ProcessResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                outcome = handle.wait_for_flush(flush_id, self.config.flush_poll_interval) => {
                    match outcome {
                        FlushOutcome::Acknowledged => return Ok(()),
                        FlushOutcome::TimedOut => handle.check_alive().await?,
                        FlushOutcome::Cleared => {
                            handle.check_alive().await?;
                            let stderr = handle.collect_errors().await;
                            return Err(ProcessError::NativeProcess {
                                job_id: handle.job_id().clone(),
                                message: format!(
                                    "Result stream ended before flush {flush_id} was acknowledged"
                                ),
                                stderr,
                            });
                        }
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stopping| *stopping).await; } => {
                    warn!(parent: handle.span(), flush_id, "Flush interrupted by shutdown");
                    return Err(ProcessError::FlushInterrupted(handle.job_id().clone()));
                }
            }
        }
    }

    /// Release every flush waiting on a process; used at shutdown.
    pub fn interrupt_flushes(&self) {
        self.shutdown.send_replace(true);
    }

    /// Pass a configuration change to a running job.
    ///
    /// Does nothing if the job has no live process.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn update_config(&self, job_id: &JobId, config: &str) -> ProcessResult<()> {
        let Some(handle) = self.handle(job_id) else {
            return Ok(());
        };
        if !handle.is_alive() {
            return Ok(());
        }
        let _guard = handle.try_acquire(JobAction::Updating)?;
        handle
            .send_control(&ControlMessage::UpdateConfig(config.to_string()))
            .await?;
        handle.check_alive().await
    }

    /// Tell a running job that time has reached `epoch` seconds.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn advance_time(&self, job_id: &JobId, epoch: i64) -> ProcessResult<()> {
        let handle = self
            .handle(job_id)
            .ok_or_else(|| ProcessError::ClosedJob(job_id.clone()))?;
        let _guard = handle.try_acquire(JobAction::Updating)?;
        handle.check_alive().await?;
        handle
            .send_control(&ControlMessage::AdvanceTime(epoch))
            .await?;
        handle.check_alive().await
    }

    /// Register a one-shot alert on the results of a running job.
    pub fn add_alert_observer(
        &self,
        job_id: &JobId,
        trigger: AlertTrigger,
    ) -> ProcessResult<oneshot::Receiver<Alert>> {
        let handle = self
            .handle(job_id)
            .ok_or_else(|| ProcessError::ClosedJob(job_id.clone()))?;
        Ok(handle.alerts().register(trigger))
    }

    /// Shut down a job's process and mark the job closed.
    ///
    /// A process that has already died marks the job failed instead and
    /// returns the error it died with.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn close(&self, job_id: &JobId) -> ProcessResult<()> {
        let Some(handle) = self.handle(job_id) else {
            warn!("No running process to close");
            return Ok(());
        };
        let guard = handle.try_acquire(JobAction::Closing)?;

        info!(parent: handle.span(), "Closing job");
        self.set_status(job_id, JobStatus::Closing).await;

        let result = if handle.is_alive() {
            self.close_gracefully(&handle).await
        } else {
            self.close_failed(&handle).await
        };

        self.jobs.remove(job_id);
        drop(guard);
        result
    }

    async fn close_gracefully(&self, handle: &JobProcessHandle) -> ProcessResult<()> {
        if let Err(e) = handle.close_input().await {
            warn!(parent: handle.span(), error = %e, "Error closing process input");
        }
        let outcome = handle
            .wait_for_exit()
            .await
            .map_err(|e| ProcessError::NativeProcess {
                job_id: handle.job_id().clone(),
                message: format!("Error waiting for native process: {e}"),
                stderr: String::new(),
            });
        let summary = handle.join_parser(None).await;
        handle.delete_associated_files();
        self.finish(handle.job_id(), JobStatus::Closed).await;

        let outcome = outcome?;
        if !outcome.success() {
            let stderr = handle.collect_errors().await;
            error!(parent: handle.span(), stderr = %stderr, "Native process exited with {outcome}");
            return Err(ProcessError::NativeProcess {
                job_id: handle.job_id().clone(),
                message: format!("Native process exited with {outcome}"),
                stderr,
            });
        }

        info!(
            parent: handle.span(),
            uptime_secs = handle.uptime().as_secs(),
            buckets = summary.map(|s| s.buckets).unwrap_or_default(),
            "Job closed"
        );
        Ok(())
    }

    async fn close_failed(&self, handle: &JobProcessHandle) -> ProcessResult<()> {
        let outcome = match handle.exit_status() {
            Ok(Some(outcome)) => outcome.to_string(),
            Ok(None) => "an unknown status".to_string(),
            Err(e) => e.to_string(),
        };
        let stderr = handle.collect_errors().await;
        error!(parent: handle.span(), stderr = %stderr, "Native process had already exited with {outcome}");

        if handle.join_parser(Some(self.config.parser_join_timeout)).await.is_none() {
            handle.renormaliser().shutdown().await;
        }
        handle.delete_associated_files();
        if let Err(e) = self.provider.delete_persisted_input(handle.job_id()).await {
            warn!(parent: handle.span(), error = %e, "Failed to delete persisted input");
        }
        self.finish(handle.job_id(), JobStatus::Failed).await;

        Err(ProcessError::NativeProcess {
            job_id: handle.job_id().clone(),
            message: format!("Native process had already exited with {outcome}"),
            stderr,
        })
    }

    /// Close every running job, waiting out busy ones.
    pub async fn stop_all_jobs(&self) {
        self.interrupt_flushes();
        let policy = CloseRetryPolicy::default();
        for job_id in self.running_jobs() {
            if let Err(e) = policy.close_with_retry(self, &job_id, None).await {
                error!(job_id = %job_id, error = %e, "Error closing job at shutdown");
            }
        }
    }

    pub fn number_of_running_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn number_of_running_detectors(&self) -> usize {
        self.jobs
            .iter()
            .map(|entry| entry.value().detector_count())
            .sum()
    }

    /// Ids of the running jobs, sorted
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn job_is_running(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Data counts of a running job
    pub async fn data_counts(&self, job_id: &JobId) -> Option<DataCounts> {
        match self.handle(job_id) {
            Some(handle) => Some(handle.data_counts().await),
            None => None,
        }
    }

    pub async fn analytics_version(&self) -> String {
        self.processes.version().await
    }

    fn handle(&self, job_id: &JobId) -> Option<Arc<JobProcessHandle>> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    async fn get_or_create(&self, job_id: &JobId) -> ProcessResult<(Arc<JobProcessHandle>, bool)> {
        if let Some(handle) = self.handle(job_id) {
            return Ok((handle, false));
        }

        let _create = self.create_lock.lock().await;
        if let Some(handle) = self.handle(job_id) {
            return Ok((handle, false));
        }

        let job = self
            .provider
            .job_details(job_id)
            .await?
            .ok_or_else(|| ProcessError::UnknownJob(job_id.clone()))?;
        let restore = RestoreState {
            quantiles: self.provider.latest_quantiles(job_id).await?,
            model_snapshot: self.provider.latest_model_snapshot(job_id).await?,
        };

        let span = info_span!(parent: None, "job", job_id = %job_id);
        let launched = self.processes.create_process(&job, &restore).await?;
        let renormaliser = self.renormalisers.create(job_id, &span);
        let handle = Arc::new(JobProcessHandle::start(
            job,
            launched,
            self.persister.clone(),
            renormaliser,
            span,
        ));

        self.set_status(job_id, JobStatus::Running).await;
        self.jobs.insert(job_id.clone(), handle.clone());
        info!(
            parent: handle.span(),
            restored_quantiles = restore.quantiles.is_some(),
            restored_snapshot = ?restore.model_snapshot.as_ref().map(|s| &s.snapshot_id),
            "Job running"
        );
        Ok((handle, true))
    }

    async fn set_status(&self, job_id: &JobId, status: JobStatus) {
        if let Err(e) = self.provider.set_job_status(job_id, status).await {
            warn!(job_id = %job_id, status = %status, error = %e, "Failed to persist job status");
        }
    }

    async fn finish(&self, job_id: &JobId, status: JobStatus) {
        if let Err(e) = self
            .provider
            .set_job_finished_time_and_status(job_id, Utc::now(), status)
            .await
        {
            warn!(job_id = %job_id, status = %status, error = %e, "Failed to persist job status");
        }
    }
}

#[async_trait]
impl JobCloser for ProcessManager {
    async fn close_job(&self, job_id: &JobId) -> ProcessResult<()> {
        self.close(job_id).await
    }

    fn running_jobs(&self) -> Vec<JobId> {
        ProcessManager::running_jobs(self)
    }
}
