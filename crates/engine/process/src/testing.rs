//! Scripted stand-ins for the native binaries
//!
//! A [`ScriptedProcess`] speaks the framed record protocol over in-memory
//! pipes. Every record it reads is handed to a responder whose output
//! records are written to its result stream. Closing its input makes it
//! write its configured error output and exit with its configured code.

use crate::control::{ControlMessage, CONTROL_FIELD_NAME};
use crate::error::{ProcessError, ProcessResult};
use crate::factory::{LaunchedProcess, NormaliserProcessFactory, ProcessFactory, RestoreState};
use crate::framing::{FramedRecordReader, FramedRecordWriter};
use crate::native::{ExitOutcome, NativeProcess, SpawnedProcess};
use crate::results::FLUSH;
use async_trait::async_trait;
use engine_types::{JobDetails, JobId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Produces the result records for one input record
pub type Responder = Box<dyn FnMut(&[String]) -> Vec<Vec<String>> + Send>;

/// Responder that echoes flush requests and nothing else
pub fn echo_flushes() -> Responder {
    echo_flushes_with(|_| Vec::new())
}

/// Responder that echoes flush requests and passes every other record to
/// `on_record`
pub fn echo_flushes_with<F>(mut on_record: F) -> Responder
where
    F: FnMut(&[String]) -> Vec<Vec<String>> + Send + 'static,
{
    Box::new(move |record: &[String]| {
        let control = record.last().map(String::as_str).unwrap_or("");
        if control == CONTROL_FIELD_NAME {
            return Vec::new();
        }
        match ControlMessage::parse(control) {
            Some(ControlMessage::Flush(id)) => vec![vec![FLUSH.to_string(), id]],
            Some(_) => Vec::new(),
            None => on_record(record),
        }
    })
}

/// Responder for the normalize protocol
///
/// Skips the header and answers each record with the score `score` gives it.
pub fn normalize_with<F>(mut score: F) -> Responder
where
    F: FnMut(&[String]) -> f64 + Send + 'static,
{
    let mut header_seen = false;
    Box::new(move |record: &[String]| {
        if !header_seen {
            header_seen = true;
            return Vec::new();
        }
        vec![vec![score(record).to_string()]]
    })
}

/// Builder for a scripted process
pub struct ScriptedProcess {
    responder: Responder,
    exit_code: i32,
    stderr: String,
}

impl ScriptedProcess {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            exit_code: 0,
            stderr: String::new(),
        }
    }

    /// Exit code reported once input is closed
    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Error output written when the process exits
    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = text.into();
        self
    }

    /// Start the script
    pub fn spawn(self) -> (SpawnedProcess, CrashHandle) {
        let (stdin, process_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (process_stdout, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut process_stderr, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (crash_tx, mut crash_rx) = watch::channel(None::<Option<i32>>);
        let exit_tx = Arc::new(exit_tx);

        let Self {
            mut responder,
            exit_code,
            stderr: error_text,
        } = self;

        let exit = exit_tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRecordReader::new(process_stdin);
            let mut writer = FramedRecordWriter::new(process_stdout);

            let code = loop {
                tokio::select! {
                    record = reader.read_record() => match record {
                        Ok(Some(record)) => {
                            for response in responder(record.as_slice()) {
                                if writer.write_record(&response).await.is_err() {
                                    break;
                                }
                            }
                            let _ = writer.flush().await;
                        }
                        Ok(None) | Err(_) => break Some(exit_code),
                    },
                    changed = crash_rx.changed() => {
                        if changed.is_err() {
                            break Some(exit_code);
                        }
                        let crashed = *crash_rx.borrow();
                        if let Some(code) = crashed {
                            break code;
                        }
                    }
                }
            };

            if !error_text.is_empty() {
                let _ = process_stderr.write_all(error_text.as_bytes()).await;
                let _ = process_stderr.write_all(b"\n").await;
            }
            let _ = writer.shutdown().await;
            drop(writer);
            drop(reader);
            drop(process_stderr);
            exit.send_replace(Some(ExitOutcome { code }));
        });

        let crash = CrashHandle {
            crash: Arc::new(crash_tx),
        };
        let spawned = SpawnedProcess {
            process: Box::new(ScriptedChild {
                exit: exit_rx,
                crash: crash.clone(),
                _exit_tx: exit_tx,
            }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };
        (spawned, crash)
    }
}

/// Makes a scripted process die as if it had crashed
#[derive(Debug, Clone)]
pub struct CrashHandle {
    crash: Arc<watch::Sender<Option<Option<i32>>>>,
}

impl CrashHandle {
    /// Exit with `code`, or as if killed by a signal when `None`
    pub fn crash(&self, code: Option<i32>) {
        self.crash.send_replace(Some(code));
    }
}

struct ScriptedChild {
    exit: watch::Receiver<Option<ExitOutcome>>,
    crash: CrashHandle,
    _exit_tx: Arc<watch::Sender<Option<ExitOutcome>>>,
}

#[async_trait]
impl NativeProcess for ScriptedChild {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(*self.exit.borrow())
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let outcome = *self
            .exit
            .wait_for(Option::is_some)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        outcome.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no exit outcome"))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.crash.crash(None);
        Ok(())
    }
}

/// One autodetect launch seen by [`ScriptedProcessFactory`]
#[derive(Debug, Clone)]
pub struct Launch {
    pub job_id: JobId,
    pub restore: RestoreState,
}

/// One normalize launch seen by [`ScriptedProcessFactory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormaliserLaunch {
    pub job_id: JobId,
    pub quantiles_state: String,
    pub bucket_span: Option<u64>,
}

type AutodetectScript = Box<dyn Fn(&JobDetails) -> ScriptedProcess + Send + Sync>;
type NormalizeScript = Box<dyn Fn() -> ScriptedProcess + Send + Sync>;

/// Process factory handing out scripted processes
pub struct ScriptedProcessFactory {
    autodetect: AutodetectScript,
    normalize: NormalizeScript,
    fail_starts: AtomicBool,
    launches: Mutex<Vec<Launch>>,
    normaliser_launches: Mutex<Vec<NormaliserLaunch>>,
    crash_handles: Mutex<HashMap<JobId, CrashHandle>>,
}

impl Default for ScriptedProcessFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProcessFactory {
    /// Autodetect echoes flushes; normalize scores every record 50
    pub fn new() -> Self {
        Self {
            autodetect: Box::new(|_| ScriptedProcess::new(echo_flushes())),
            normalize: Box::new(|| ScriptedProcess::new(normalize_with(|_| 50.0))),
            fail_starts: AtomicBool::new(false),
            launches: Mutex::new(Vec::new()),
            normaliser_launches: Mutex::new(Vec::new()),
            crash_handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_autodetect<F>(mut self, script: F) -> Self
    where
        F: Fn(&JobDetails) -> ScriptedProcess + Send + Sync + 'static,
    {
        self.autodetect = Box::new(script);
        self
    }

    pub fn with_normalize<F>(mut self, script: F) -> Self
    where
        F: Fn() -> ScriptedProcess + Send + Sync + 'static,
    {
        self.normalize = Box::new(script);
        self
    }

    /// Make every following launch fail
    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().clone()
    }

    pub fn normaliser_launches(&self) -> Vec<NormaliserLaunch> {
        self.normaliser_launches.lock().clone()
    }

    /// Crash the most recent autodetect process of `job_id`
    pub fn crash(&self, job_id: &JobId, code: Option<i32>) {
        if let Some(handle) = self.crash_handles.lock().get(job_id) {
            handle.crash(code);
        }
    }

    fn start_failure(&self, job_id: &JobId) -> Option<ProcessError> {
        self.fail_starts
            .load(Ordering::SeqCst)
            .then(|| ProcessError::NativeProcessStart {
                job_id: job_id.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted start failure"),
            })
    }
}

#[async_trait]
impl ProcessFactory for ScriptedProcessFactory {
    async fn create_process(
        &self,
        job: &JobDetails,
        restore: &RestoreState,
    ) -> ProcessResult<LaunchedProcess> {
        if let Some(e) = self.start_failure(&job.id) {
            return Err(e);
        }
        self.launches.lock().push(Launch {
            job_id: job.id.clone(),
            restore: restore.clone(),
        });
        let (spawned, crash) = (self.autodetect)(job).spawn();
        self.crash_handles.lock().insert(job.id.clone(), crash);
        Ok(LaunchedProcess {
            spawned,
            scratch_files: Vec::new(),
        })
    }

    async fn version(&self) -> String {
        "scripted".to_string()
    }
}

#[async_trait]
impl NormaliserProcessFactory for ScriptedProcessFactory {
    async fn create_normaliser(
        &self,
        job_id: &JobId,
        quantiles_state: &str,
        bucket_span: Option<u64>,
    ) -> ProcessResult<LaunchedProcess> {
        if let Some(e) = self.start_failure(job_id) {
            return Err(e);
        }
        self.normaliser_launches.lock().push(NormaliserLaunch {
            job_id: job_id.clone(),
            quantiles_state: quantiles_state.to_string(),
            bucket_span,
        });
        let (spawned, _crash) = (self.normalize)().spawn();
        Ok(LaunchedProcess {
            spawned,
            scratch_files: Vec::new(),
        })
    }
}
