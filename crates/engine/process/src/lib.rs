//! # Engine Process - Native Analytics Process Orchestration
//!
//! Every running anomaly detection job is backed by one native `autodetect`
//! process. This crate starts those processes, feeds them data and control
//! messages, parses their results and shuts them down.
//!
//! ## Overview
//!
//! - **Framing**: Length-prefixed records in both directions
//! - **Control messages**: Flush, interim results, bucket reset, time
//!   advance and configuration updates, interleaved with data
//! - **Job handles**: A live process with its input pipe, result parser,
//!   error stream reader and per-job action slot
//! - **Process manager**: Job id to process map and the job lifecycle
//! - **Idle timeouts**: Closing jobs that stop receiving data
//!
//! ## Key Components
//!
//! - [`ProcessManager`]: Main facade for all job process operations
//! - [`JobProcessHandle`]: One running native process
//! - [`JobTimeouts`]: Idle timers with retrying close
//! - [`ProcessFactory`]: Seam for launching native processes
//! - [`Renormaliser`]: Seam to the rescoring pipeline
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use engine_process::{
//!     NativeBinaries, NativeProcessFactory, NoopRenormaliser, ProcessManager,
//!     ProcessManagerConfig,
//! };
//! use engine_storage::InMemoryJobProvider;
//! use engine_types::{DataLoadParams, InterimResultsParams, JobId};
//!
//! # async fn example() -> engine_process::ProcessResult<()> {
//! let factory = Arc::new(NativeProcessFactory::new(NativeBinaries {
//!     autodetect: PathBuf::from("/opt/engine/bin/autodetect"),
//!     normalize: PathBuf::from("/opt/engine/bin/normalize"),
//!     scratch_dir: std::env::temp_dir(),
//! }));
//! let manager = ProcessManager::new(
//!     Arc::new(InMemoryJobProvider::new()),
//!     factory,
//!     Arc::new(NoopRenormaliser),
//!     ProcessManagerConfig::default(),
//! );
//!
//! let job_id = JobId::new("farequote");
//! let data = "time,airline,responsetime\n1400000000,AAL,132.2\n";
//! let counts = manager
//!     .load_data(&job_id, data.as_bytes(), DataLoadParams::default())
//!     .await?;
//! println!("Processed {} records", counts.processed_record_count);
//!
//! manager.flush(&job_id, InterimResultsParams::default()).await?;
//! manager.close(&job_id).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod alerts;
pub mod control;
pub mod error;
pub mod factory;
pub mod flush;
pub mod framing;
pub mod handle;
pub mod manager;
pub mod native;
pub mod renormaliser;
pub mod results;
pub mod stderr;
pub mod timeouts;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use alerts::{Alert, AlertObservers, AlertTrigger};
pub use control::{ControlMessage, ControlMsgWriter, CONTROL_FIELD_NAME};
pub use error::{ErrorCode, ProcessError, ProcessResult};
pub use factory::{
    LaunchedProcess, NativeBinaries, NativeProcessFactory, NormaliserProcessFactory,
    ProcessFactory, RestoreState,
};
pub use flush::{FlushListener, FlushOutcome};
pub use framing::{FramedRecordReader, FramedRecordWriter};
pub use handle::{ActionGuard, JobAction, JobProcessHandle};
pub use manager::{ProcessManager, ProcessManagerConfig};
pub use native::{ChildProcess, ExitOutcome, NativeProcess, ProcessSpec, SpawnedProcess};
pub use renormaliser::{NoopRenormaliser, Renormaliser, RenormaliserFactory};
pub use results::{ParseSummary, ResultsParser};
pub use stderr::ErrorStreamReader;
pub use timeouts::{CloseOutcome, CloseRetryPolicy, JobCloser, JobTimeouts};
pub use writer::{DataToProcessWriter, UploadLimits};
