//! A running native process and everything attached to it
//!
//! The handle owns the process, its input pipe, the task parsing its results
//! and the reader draining its error output. Operations on a job take the
//! handle's action slot first, so at most one of them runs at a time.

use crate::alerts::AlertObservers;
use crate::control::{ControlMessage, ControlMsgWriter};
use crate::error::{ProcessError, ProcessResult};
use crate::factory::{remove_files, LaunchedProcess};
use crate::flush::{FlushListener, FlushOutcome};
use crate::framing::FramedRecordWriter;
use crate::native::{ExitOutcome, NativeProcess, ProcessInput};
use crate::renormaliser::Renormaliser;
use crate::results::{ParseSummary, ResultsParser};
use crate::stderr::ErrorStreamReader;
use crate::writer::{upload_header, DataToProcessWriter, UploadLimits};
use engine_storage::ResultsPersister;
use engine_types::{DataCounts, DataLoadParams, JobDetails, JobId};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufWriter};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Span};

type InputWriter = FramedRecordWriter<BufWriter<ProcessInput>>;

/// The operation currently holding a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobAction {
    Writing,
    Flushing,
    Closing,
    Updating,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobAction::Writing => "writing",
            JobAction::Flushing => "flushing",
            JobAction::Closing => "closing",
            JobAction::Updating => "updating",
        };
        f.write_str(s)
    }
}

/// Releases the job's action slot when dropped
#[derive(Debug)]
pub struct ActionGuard<'a> {
    slot: &'a Mutex<Option<JobAction>>,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Live state of one job's native process
pub struct JobProcessHandle {
    job: JobDetails,
    header_width: usize,
    span: Span,
    process: tokio::sync::Mutex<Box<dyn NativeProcess>>,
    input: tokio::sync::Mutex<Option<InputWriter>>,
    errors: ErrorStreamReader,
    parser: tokio::sync::Mutex<Option<JoinHandle<ParseSummary>>>,
    flush_listener: Arc<FlushListener>,
    renormaliser: Arc<dyn Renormaliser>,
    alerts: Arc<AlertObservers>,
    counts: tokio::sync::Mutex<DataCounts>,
    action: Mutex<Option<JobAction>>,
    scratch_files: Vec<PathBuf>,
    started: Instant,
}

impl fmt::Debug for JobProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcessHandle")
            .field("job_id", &self.job.id)
            .field("action", &*self.action.lock())
            .field("scratch_files", &self.scratch_files)
            .finish_non_exhaustive()
    }
}

impl JobProcessHandle {
    /// Wire up a freshly launched process
    ///
    /// Starts the result parser and the error stream reader under `span`.
    pub fn start(
        job: JobDetails,
        launched: LaunchedProcess,
        persister: Arc<dyn ResultsPersister>,
        renormaliser: Arc<dyn Renormaliser>,
        span: Span,
    ) -> Self {
        let LaunchedProcess {
            spawned,
            scratch_files,
        } = launched;

        let flush_listener = Arc::new(FlushListener::new());
        let alerts = Arc::new(AlertObservers::new());
        let parser = ResultsParser::new(
            job.id.clone(),
            persister,
            flush_listener.clone(),
            renormaliser.clone(),
            alerts.clone(),
        )
        .spawn(spawned.stdout, span.clone());
        let errors = ErrorStreamReader::spawn(spawned.stderr, span.clone());

        info!(parent: &span, pid = ?spawned.process.id(), "Native process started");

        Self {
            header_width: upload_header(&job).len(),
            job,
            span,
            process: tokio::sync::Mutex::new(spawned.process),
            input: tokio::sync::Mutex::new(Some(FramedRecordWriter::new(BufWriter::new(
                spawned.stdin,
            )))),
            errors,
            parser: tokio::sync::Mutex::new(Some(parser)),
            flush_listener,
            renormaliser,
            alerts,
            counts: tokio::sync::Mutex::new(DataCounts::default()),
            action: Mutex::new(None),
            scratch_files,
            started: Instant::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn job(&self) -> &JobDetails {
        &self.job
    }

    /// Span carrying the job id; every log line about this job is under it
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn detector_count(&self) -> usize {
        self.job.analysis_config.detectors.len()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn alerts(&self) -> &AlertObservers {
        &self.alerts
    }

    pub fn renormaliser(&self) -> &Arc<dyn Renormaliser> {
        &self.renormaliser
    }

    /// Totals over every upload so far
    pub async fn data_counts(&self) -> DataCounts {
        self.counts.lock().await.clone()
    }

    /// Claim the job for `action`, failing if another action holds it
    pub fn try_acquire(&self, action: JobAction) -> ProcessResult<ActionGuard<'_>> {
        let mut slot = self.action.lock();
        if let Some(current) = *slot {
            return Err(ProcessError::JobInUse {
                job_id: self.job.id.clone(),
                action: current,
            });
        }
        *slot = Some(action);
        Ok(ActionGuard { slot: &self.action })
    }

    pub fn current_action(&self) -> Option<JobAction> {
        *self.action.lock()
    }

    /// Non-blocking probe for process exit
    ///
    /// A process that is being waited on counts as running.
    pub fn exit_status(&self) -> io::Result<Option<ExitOutcome>> {
        match self.process.try_lock() {
            Ok(mut process) => process.try_wait(),
            Err(_) => Ok(None),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.exit_status(), Ok(None))
    }

    /// Fail if the process has exited, with its captured error output
    pub async fn check_alive(&self) -> ProcessResult<()> {
        let message = match self.exit_status() {
            Ok(None) => return Ok(()),
            Ok(Some(outcome)) => format!("Native process has exited with {outcome}"),
            Err(e) => format!("Cannot determine native process state: {e}"),
        };
        let stderr = self.errors.drain_after_exit().await;
        error!(parent: &self.span, stderr = %stderr, "{message}");
        Err(ProcessError::NativeProcess {
            job_id: self.job.id.clone(),
            message,
            stderr,
        })
    }

    /// Write one upload and return the updated totals
    pub async fn write_data<R>(
        &self,
        input: R,
        params: DataLoadParams,
        limits: UploadLimits,
        persister: &dyn ResultsPersister,
    ) -> ProcessResult<DataCounts>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut pipe = self.input.lock().await;
        let Some(writer) = pipe.as_mut() else {
            return Err(self.input_closed());
        };
        let mut counts = self.counts.lock().await;

        let result = DataToProcessWriter::new(&self.job, params, limits, persister, &mut *counts)
            .write(input, writer)
            .await;

        match result {
            Ok(totals) => Ok(totals),
            Err(ProcessError::NativeProcessWrite { job_id, message, .. }) => {
                Err(ProcessError::NativeProcessWrite {
                    job_id,
                    message,
                    stderr: self.errors.drain(),
                })
            }
            Err(e) => Err(ProcessError::DataUpload {
                job_id: self.job.id.clone(),
                counts: Box::new(counts.clone()),
                source: Box::new(e),
            }),
        }
    }

    /// Send a control message to the process
    pub async fn send_control(&self, message: &ControlMessage) -> ProcessResult<()> {
        let mut pipe = self.input.lock().await;
        let Some(writer) = pipe.as_mut() else {
            return Err(self.input_closed());
        };
        ControlMsgWriter::new(writer, self.header_width)
            .write(message)
            .await
            .map_err(|e| self.write_failed(e))
    }

    /// Send a flush request; returns the id the process will echo
    pub async fn request_flush(&self) -> ProcessResult<String> {
        let mut pipe = self.input.lock().await;
        let Some(writer) = pipe.as_mut() else {
            return Err(self.input_closed());
        };
        ControlMsgWriter::new(writer, self.header_width)
            .write_flush()
            .await
            .map_err(|e| self.write_failed(e))
    }

    pub async fn wait_for_flush(&self, flush_id: &str, interval: Duration) -> FlushOutcome {
        self.flush_listener.wait_for_flush(flush_id, interval).await
    }

    /// Give up on a flush; its echo, if it ever comes, is dropped
    pub fn forget_flush(&self, flush_id: &str) {
        self.flush_listener.forget(flush_id);
    }

    /// Close the process's input, which asks it to finish and exit
    pub async fn close_input(&self) -> io::Result<()> {
        match self.input.lock().await.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn wait_for_exit(&self) -> io::Result<ExitOutcome> {
        self.process.lock().await.wait().await
    }

    pub async fn kill(&self) -> io::Result<()> {
        self.process.lock().await.kill().await
    }

    /// Wait for the result parser to reach the end of the stream
    ///
    /// With a timeout the parser is abandoned if it does not finish in time.
    pub async fn join_parser(&self, timeout: Option<Duration>) -> Option<ParseSummary> {
        let task = self.parser.lock().await.take()?;
        let joined = match timeout {
            Some(limit) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(parent: &self.span, "Result parser did not finish; abandoning it");
                        abort.abort();
                        return None;
                    }
                }
            }
            None => task.await,
        };
        match joined {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(parent: &self.span, error = %e, "Result parser task failed");
                None
            }
        }
    }

    /// Error output captured after the process exited
    pub async fn collect_errors(&self) -> String {
        self.errors.drain_after_exit().await
    }

    /// Remove the scratch files handed to the process
    pub fn delete_associated_files(&self) {
        remove_files(&self.scratch_files);
    }

    fn input_closed(&self) -> ProcessError {
        ProcessError::NativeProcessWrite {
            job_id: self.job.id.clone(),
            message: "process input is closed".to_string(),
            stderr: String::new(),
        }
    }

    fn write_failed(&self, e: io::Error) -> ProcessError {
        ProcessError::NativeProcessWrite {
            job_id: self.job.id.clone(),
            message: e.to_string(),
            stderr: self.errors.drain(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renormaliser::NoopRenormaliser;
    use crate::testing::{echo_flushes, ScriptedProcess};
    use engine_storage::InMemoryJobProvider;
    use engine_types::{AnalysisConfig, DataDescription, Detector};

    fn job() -> JobDetails {
        let config = AnalysisConfig {
            bucket_span: Some(3600),
            detectors: vec![Detector::function("count").by("airline")],
            ..Default::default()
        };
        JobDetails::new("foo", config, DataDescription::default())
    }

    fn start(script: ScriptedProcess) -> (JobProcessHandle, crate::testing::CrashHandle) {
        let (spawned, crash) = script.spawn();
        let handle = JobProcessHandle::start(
            job(),
            LaunchedProcess {
                spawned,
                scratch_files: Vec::new(),
            },
            Arc::new(InMemoryJobProvider::new()),
            Arc::new(NoopRenormaliser),
            Span::none(),
        );
        (handle, crash)
    }

    #[tokio::test]
    async fn test_one_action_at_a_time() {
        let (handle, _crash) = start(ScriptedProcess::new(echo_flushes()));

        let guard = handle.try_acquire(JobAction::Writing).unwrap();
        let err = handle.try_acquire(JobAction::Closing).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::JobInUse {
                action: JobAction::Writing,
                ..
            }
        ));
        drop(guard);
        assert!(handle.try_acquire(JobAction::Closing).is_ok());
    }

    #[tokio::test]
    async fn test_flush_round_trip() {
        let (handle, _crash) = start(ScriptedProcess::new(echo_flushes()));
        let storage = InMemoryJobProvider::new();
        handle
            .write_data(
                "time,airline\n1400000000,AAL\n".as_bytes(),
                DataLoadParams::default(),
                UploadLimits::default(),
                &storage,
            )
            .await
            .unwrap();

        let id = handle.request_flush().await.unwrap();
        assert_eq!(
            handle.wait_for_flush(&id, Duration::from_secs(5)).await,
            FlushOutcome::Acknowledged
        );
        assert_eq!(handle.data_counts().await.processed_record_count, 1);
    }

    #[tokio::test]
    async fn test_dead_process_reported_with_stderr() {
        let (handle, crash) = start(ScriptedProcess::new(echo_flushes()).stderr("license expired"));
        handle.check_alive().await.unwrap();

        crash.crash(Some(139));
        assert_eq!(handle.wait_for_exit().await.unwrap(), ExitOutcome::with_code(139));
        let err = handle.check_alive().await.unwrap_err();
        assert_eq!(err.stderr(), Some("license expired"));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_graceful_exit_after_input_closed() {
        let (handle, _crash) = start(ScriptedProcess::new(echo_flushes()));
        handle.close_input().await.unwrap();

        assert!(handle.wait_for_exit().await.unwrap().success());
        assert!(handle.join_parser(None).await.is_some());
        assert!(handle.join_parser(None).await.is_none());
        assert!(matches!(
            handle.send_control(&ControlMessage::AdvanceTime(10)).await,
            Err(ProcessError::NativeProcessWrite { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_partial_counts() {
        let (handle, _crash) = start(ScriptedProcess::new(echo_flushes()));
        let storage = InMemoryJobProvider::new();
        let err = handle
            .write_data(
                "time,airline\nx,AAL\ny,AAL\n1400000000,AAL\n".as_bytes(),
                DataLoadParams::default(),
                UploadLimits::default(),
                &storage,
            )
            .await
            .unwrap_err();

        match err {
            ProcessError::DataUpload { counts, source, .. } => {
                assert_eq!(counts.invalid_date_count, 2);
                assert_eq!(counts.processed_record_count, 1);
                assert!(matches!(
                    *source,
                    ProcessError::HighProportionOfBadTimestamps { .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
