//! Engine facade: process manager plus idle timeouts
//!
//! Every upload stops the job's idle timer and restarts it once the upload is
//! done, so a job closes only after it has gone quiet.

use crate::config::EngineConfig;
use engine_process::{
    Alert, AlertTrigger, JobTimeouts, NativeProcessFactory, NormaliserProcessFactory,
    ProcessFactory, ProcessManager, ProcessResult,
};
use engine_renormalizer::QueueRenormaliserFactory;
use engine_storage::{JobProvider, Storage};
use engine_types::{DataCounts, DataLoadParams, InterimResultsParams, JobId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

pub struct Engine {
    manager: Arc<ProcessManager>,
    timeouts: JobTimeouts,
    provider: Arc<dyn JobProvider>,
    default_idle: Duration,
}

impl Engine {
    pub fn new<S: Storage + 'static>(
        storage: Arc<S>,
        processes: Arc<dyn ProcessFactory>,
        normalisers: Arc<dyn NormaliserProcessFactory>,
        config: &EngineConfig,
    ) -> Self {
        let renormalisers = Arc::new(QueueRenormaliserFactory::new(storage.clone(), normalisers));
        let manager = Arc::new(ProcessManager::new(
            storage.clone(),
            processes,
            renormalisers,
            config.process.manager_config(),
        ));
        let timeouts =
            JobTimeouts::with_policy(manager.clone(), config.process.close_retry_policy());

        Self {
            manager,
            timeouts,
            provider: storage,
            default_idle: Duration::from_secs(config.timeouts.default_idle_secs),
        }
    }

    /// Engine running the native binaries named in `config`
    pub fn native<S: Storage + 'static>(storage: Arc<S>, config: &EngineConfig) -> Self {
        let factory = Arc::new(NativeProcessFactory::new(config.process.binaries()));
        Self::new(storage, factory.clone(), factory, config)
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    pub fn timeouts(&self) -> &JobTimeouts {
        &self.timeouts
    }

    /// Send an upload to a job, restarting its idle timer afterwards.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn submit_data<R>(
        &self,
        job_id: &JobId,
        input: R,
        params: DataLoadParams,
    ) -> ProcessResult<DataCounts>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.timeouts.stop_timeout(job_id);
        let result = self.manager.load_data(job_id, input, params).await;
        if self.manager.job_is_running(job_id) {
            let timeout = self.idle_timeout(job_id).await;
            self.timeouts.start_timeout(job_id, timeout);
        }
        result
    }

    pub async fn flush(&self, job_id: &JobId, params: InterimResultsParams) -> ProcessResult<()> {
        self.manager.flush(job_id, params).await
    }

    pub async fn update_config(&self, job_id: &JobId, config: &str) -> ProcessResult<()> {
        self.manager.update_config(job_id, config).await
    }

    pub async fn advance_time(&self, job_id: &JobId, epoch: i64) -> ProcessResult<()> {
        self.manager.advance_time(job_id, epoch).await
    }

    pub fn add_alert_observer(
        &self,
        job_id: &JobId,
        trigger: AlertTrigger,
    ) -> ProcessResult<oneshot::Receiver<Alert>> {
        self.manager.add_alert_observer(job_id, trigger)
    }

    /// Close a job now instead of waiting for its idle timeout
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn close(&self, job_id: &JobId) -> ProcessResult<()> {
        self.timeouts.stop_timeout(job_id);
        self.manager.close(job_id).await
    }

    /// Stop every timer and close every running job.
    pub async fn shutdown(&self) {
        info!(jobs = self.manager.number_of_running_jobs(), "Shutting down engine");
        self.manager.interrupt_flushes();
        self.timeouts.shutdown().await;
        self.manager.stop_all_jobs().await;
    }

    async fn idle_timeout(&self, job_id: &JobId) -> Duration {
        match self.provider.job_details(job_id).await {
            Ok(Some(job)) if job.timeout > 0 => Duration::from_secs(job.timeout),
            Ok(_) => self.default_idle,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Using default idle timeout");
                self.default_idle
            }
        }
    }
}
