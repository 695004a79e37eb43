//! # Engine Renormalizer - Rescoring Persisted Results
//!
//! When a native process publishes new quantiles, results written earlier
//! were scored against an outdated baseline. This crate rescores them.
//!
//! ## Key Components
//!
//! - [`BlockingQueueRenormaliser`]: Bounded queue with one worker per job,
//!   coalescing bursts of quantiles updates
//! - [`ScoreUpdater`]: One rescoring pass over buckets, records and
//!   influencers
//! - [`Normalizer`]: Drives the native `normalize` process and merges its
//!   scores into the result tree
//! - [`Normalisable`]: Result entities viewed as rescorable nodes
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use engine_process::{NativeBinaries, NativeProcessFactory, ProcessManager, ProcessManagerConfig};
//! use engine_renormalizer::QueueRenormaliserFactory;
//! use engine_storage::InMemoryJobProvider;
//!
//! let storage = Arc::new(InMemoryJobProvider::new());
//! let factory = Arc::new(NativeProcessFactory::new(NativeBinaries {
//!     autodetect: PathBuf::from("/opt/engine/bin/autodetect"),
//!     normalize: PathBuf::from("/opt/engine/bin/normalize"),
//!     scratch_dir: std::env::temp_dir(),
//! }));
//! let renormalisers = Arc::new(QueueRenormaliserFactory::new(storage.clone(), factory.clone()));
//! let manager = ProcessManager::new(storage, factory, renormalisers, ProcessManagerConfig::default());
//! ```

#![deny(unsafe_code)]

pub mod normalisable;
pub mod normalizer;
pub mod queue;
pub mod score_updater;

pub use normalisable::{ChildType, Normalisable};
pub use normalizer::{is_big_update, Normalizer};
pub use queue::{BlockingQueueRenormaliser, QueueRenormaliserFactory, QUEUE_CAPACITY};
pub use score_updater::{PageLimits, Rescorer, ScoreUpdater};
