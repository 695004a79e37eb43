//! Native process abstraction
//!
//! The orchestrator never touches `tokio::process` directly; it drives a
//! [`NativeProcess`] plus the three pipes it was spawned with. Tests swap in
//! scripted processes built on in-memory pipes.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Write half connected to a process's standard input
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half connected to a process's standard output or error
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("termination by signal"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running native process, without its pipes
#[async_trait]
pub trait NativeProcess: Send {
    /// OS process id, when there is one
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit probe; `None` while still running
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> io::Result<ExitOutcome>;

    /// Terminate the process forcibly
    async fn kill(&mut self) -> io::Result<()>;
}

/// A freshly spawned process and its pipes
pub struct SpawnedProcess {
    pub process: Box<dyn NativeProcess>,
    pub stdin: ProcessInput,
    pub stdout: ProcessOutput,
    pub stderr: ProcessOutput,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Command line for a native binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// An OS child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    /// Spawn `spec` with all three standard streams piped
    pub fn spawn(spec: &ProcessSpec) -> io::Result<SpawnedProcess> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        Ok(SpawnedProcess {
            process: Box::new(ChildProcess { child }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("child has no {name} pipe"))
}

#[async_trait]
impl NativeProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        Ok(self.child.wait().await?.into())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::framing::{FramedRecordReader, FramedRecordWriter};

    #[tokio::test]
    async fn test_spawn_cat_echoes_records() {
        let spawned = ChildProcess::spawn(&ProcessSpec::new("cat")).unwrap();
        let SpawnedProcess {
            mut process,
            stdin,
            stdout,
            ..
        } = spawned;
        assert!(process.try_wait().unwrap().is_none());

        let mut writer = FramedRecordWriter::new(stdin);
        writer.write_record(&["flush", "1"]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FramedRecordReader::new(stdout);
        assert_eq!(reader.read_record().await.unwrap().unwrap(), vec!["flush", "1"]);
        assert!(reader.read_record().await.unwrap().is_none());
        assert!(process.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = ChildProcess::spawn(&ProcessSpec::new("/nonexistent/autodetect"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let spec = ProcessSpec::new("sh").arg("-c").arg("exit 3");
        let mut spawned = ChildProcess::spawn(&spec).unwrap();
        let outcome = spawned.process.wait().await.unwrap();
        assert_eq!(outcome, ExitOutcome::with_code(3));
        assert!(!outcome.success());
    }
}
