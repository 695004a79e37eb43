//! Engine Daemon library
//!
//! Hosts anomaly detection jobs in native processes:
//! - Layered configuration (defaults, file, environment)
//! - Engine facade tying the process manager to idle timeouts
//! - Daemon error types

pub mod config;
pub mod engine;
pub mod error;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{DaemonError, DaemonResult};
