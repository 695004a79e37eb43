//! Engine Storage - Persistence interfaces for jobs and results
//!
//! The process orchestrator and the renormaliser never talk to a concrete
//! document store. They go through [`JobProvider`] for job state and
//! existing results, and through [`ResultsPersister`] for new results.
//! [`InMemoryJobProvider`] implements both for the daemon and for tests.

#![deny(unsafe_code)]

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryJobProvider, ProviderStats};
pub use traits::{JobProvider, ResultsPersister, Storage};
