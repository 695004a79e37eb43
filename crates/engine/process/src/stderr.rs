//! Capture of native process error output
//!
//! The error pipe is drained continuously so a chatty process can never block
//! on it. Only the most recent lines are kept.

use crate::native::ProcessOutput;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, Span};

/// Lines of error output retained per process
pub const MAX_RETAINED_LINES: usize = 200;

/// How long to wait for the pipe to close after the process has exited
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Single drain point for a process's error output
#[derive(Debug)]
pub struct ErrorStreamReader {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ErrorStreamReader {
    /// Start draining `stderr` in the background
    pub fn spawn(stderr: ProcessOutput, span: Span) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::new()));
        let sink = lines.clone();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        debug!(parent: &span, line = %line, "Native process error output");
                        let mut lines = sink.lock();
                        if lines.len() == MAX_RETAINED_LINES {
                            lines.pop_front();
                        }
                        lines.push_back(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(parent: &span, error = %e, "Stopped reading error output");
                        break;
                    }
                }
            }
        });

        Self {
            lines,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Take everything captured so far
    pub fn drain(&self) -> String {
        let mut lines = self.lines.lock();
        let text = lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        lines.clear();
        text
    }

    /// Take the captured output of a process that has exited
    ///
    /// Waits briefly for the pipe to reach end of stream first, so lines
    /// written just before exit are not lost.
    pub async fn drain_after_exit(&self) -> String {
        if let Some(task) = self.task.lock().await.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(EXIT_DRAIN_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }
        self.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_after_exit_collects_all_lines() {
        let (mut process_side, engine_side) = tokio::io::duplex(256);
        let reader = ErrorStreamReader::spawn(Box::new(engine_side), Span::none());

        process_side
            .write_all(b"bad field config\nexiting\n")
            .await
            .unwrap();
        drop(process_side);

        assert_eq!(reader.drain_after_exit().await, "bad field config\nexiting");
        assert_eq!(reader.drain(), "");
    }

    #[tokio::test]
    async fn test_only_recent_lines_retained() {
        let (mut process_side, engine_side) = tokio::io::duplex(64 * 1024);
        let reader = ErrorStreamReader::spawn(Box::new(engine_side), Span::none());

        for i in 0..(MAX_RETAINED_LINES + 5) {
            process_side
                .write_all(format!("line {i}\n").as_bytes())
                .await
                .unwrap();
        }
        drop(process_side);

        let text = reader.drain_after_exit().await;
        assert_eq!(text.lines().count(), MAX_RETAINED_LINES);
        assert!(text.starts_with("line 5\n"));
    }
}
