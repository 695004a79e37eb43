//! Engine Daemon - Runs anomaly detection jobs in native processes
//!
//! `engined run` feeds one upload to a job defined in a JSON file, flushes
//! and closes it, and prints the resulting data counts.

use clap::{Parser, Subcommand};
use engine_daemon::{DaemonError, DaemonResult, Engine, EngineConfig};
use engine_process::{NativeProcessFactory, ProcessFactory};
use engine_storage::InMemoryJobProvider;
use engine_types::{DataLoadParams, InterimResultsParams, JobDetails};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Engine Daemon CLI
#[derive(Parser)]
#[command(name = "engined")]
#[command(about = "Engine Daemon - Anomaly detection job host", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ENGINE_CONFIG")]
    config: Option<String>,

    /// Log level; overrides the configuration file
    #[arg(long, env = "ENGINE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "ENGINE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one upload through a job, then flush and close it
    Run {
        /// JSON job definition
        #[arg(long)]
        job: PathBuf,

        /// Input data; standard input when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Calculate interim results when flushing
        #[arg(long)]
        interim: bool,

        /// Keep the raw input
        #[arg(long)]
        persist: bool,
    },

    /// Print the version of the native analytics
    Version,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match cli.command {
        Command::Run {
            job,
            input,
            interim,
            persist,
        } => run(&config, job, input, interim, persist).await,
        Command::Version => {
            let factory = NativeProcessFactory::new(config.process.binaries());
            println!("{}", factory.version().await);
            Ok(())
        }
    }
}

async fn run(
    config: &EngineConfig,
    job: PathBuf,
    input: Option<PathBuf>,
    interim: bool,
    persist: bool,
) -> DaemonResult<()> {
    let definition = tokio::fs::read_to_string(&job).await?;
    let job: JobDetails = serde_json::from_str(&definition)
        .map_err(|e| DaemonError::JobDefinition(format!("{}: {e}", job.display())))?;
    let job_id = job.id.clone();

    let storage = Arc::new(InMemoryJobProvider::new());
    storage.put_job(job).await;
    let engine = Engine::native(storage, config);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let params = DataLoadParams {
        persist,
        ..Default::default()
    };
    let flush = InterimResultsParams {
        calc_interim: interim,
        ..Default::default()
    };

    let work = async {
        let counts = engine.submit_data(&job_id, reader, params).await?;
        engine.flush(&job_id, flush).await?;
        engine.close(&job_id).await?;
        Ok::<_, DaemonError>(counts)
    };

    tokio::select! {
        result = work => {
            let counts = result?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        _ = shutdown_signal() => {
            engine.shutdown().await;
            Ok(())
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
