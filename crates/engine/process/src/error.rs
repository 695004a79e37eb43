//! Process orchestration errors

use crate::handle::JobAction;
use engine_storage::StorageError;
use engine_types::{DataCounts, JobId};
use thiserror::Error;

/// Errors raised while driving a native process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The native process could not be launched
    #[error("Failed to start native process for job '{job_id}': {source}")]
    NativeProcessStart {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the process's input failed, usually because it died
    #[error("Error writing to native process for job '{job_id}': {message}")]
    NativeProcessWrite {
        job_id: JobId,
        message: String,
        /// Captured error output of the process
        stderr: String,
    },

    /// The process exited unexpectedly or broke the protocol
    #[error("Native process error for job '{job_id}': {message}")]
    NativeProcess {
        job_id: JobId,
        message: String,
        /// Captured error output of the process
        stderr: String,
    },

    /// A flush wait was interrupted by shutdown
    #[error("Flush of job '{0}' was interrupted")]
    FlushInterrupted(JobId),

    /// Another action holds the job
    #[error("Job '{job_id}' is in use: {action} in progress")]
    JobInUse { job_id: JobId, action: JobAction },

    /// The upload failed part way; counts cover what was processed
    #[error("Data upload to job '{job_id}' failed: {source}")]
    DataUpload {
        job_id: JobId,
        counts: Box<DataCounts>,
        #[source]
        source: Box<ProcessError>,
    },

    /// The operation needs a running job
    #[error("Job '{0}' is not running")]
    ClosedJob(JobId),

    /// No job with this id exists
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// Too many records had timestamps that could not be parsed
    #[error("{invalid} of {total} records had unparseable timestamps")]
    HighProportionOfBadTimestamps { invalid: u64, total: u64 },

    /// Too many records arrived out of time order
    #[error("{out_of_order} of {total} records were out of time order")]
    OutOfOrderRecords { out_of_order: u64, total: u64 },

    /// A required field is absent from the input header
    #[error("Missing field '{0}' in input")]
    MissingField(String),

    /// An input line is not a JSON object
    #[error("Malformed JSON input: {0}")]
    MalformedJson(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Stable numeric codes reported to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    UnknownJob = 20101,
    JobInUse = 20103,
    ClosedJob = 20104,
    MissingField = 30101,
    MalformedInput = 30102,
    TooManyBadDates = 30103,
    TooManyOutOfOrderRecords = 30104,
    DataUpload = 30199,
    NativeProcessStart = 40101,
    NativeProcessWrite = 40102,
    NativeProcess = 40103,
    FlushInterrupted = 40104,
    Storage = 50101,
    Io = 50102,
}

impl ProcessError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProcessError::NativeProcessStart { .. } => ErrorCode::NativeProcessStart,
            ProcessError::NativeProcessWrite { .. } => ErrorCode::NativeProcessWrite,
            ProcessError::NativeProcess { .. } => ErrorCode::NativeProcess,
            ProcessError::FlushInterrupted(_) => ErrorCode::FlushInterrupted,
            ProcessError::JobInUse { .. } => ErrorCode::JobInUse,
            ProcessError::DataUpload { .. } => ErrorCode::DataUpload,
            ProcessError::ClosedJob(_) => ErrorCode::ClosedJob,
            ProcessError::UnknownJob(_) => ErrorCode::UnknownJob,
            ProcessError::HighProportionOfBadTimestamps { .. } => ErrorCode::TooManyBadDates,
            ProcessError::OutOfOrderRecords { .. } => ErrorCode::TooManyOutOfOrderRecords,
            ProcessError::MissingField(_) => ErrorCode::MissingField,
            ProcessError::MalformedJson(_) => ErrorCode::MalformedInput,
            ProcessError::Storage(_) => ErrorCode::Storage,
            ProcessError::Io(_) => ErrorCode::Io,
        }
    }

    /// Only a busy job is worth trying again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::JobInUse { .. })
    }

    /// Error output captured from the native process, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::NativeProcessWrite { stderr, .. }
            | ProcessError::NativeProcess { stderr, .. } => Some(stderr),
            ProcessError::DataUpload { source, .. } => source.stderr(),
            _ => None,
        }
    }
}
