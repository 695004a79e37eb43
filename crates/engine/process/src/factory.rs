//! Launching native processes
//!
//! A job's configuration reaches the `autodetect` binary as command line
//! arguments plus scratch files: detector field config, memory limits and
//! restored quantiles. The `normalize` binary gets the quantiles to rescore
//! against. Scratch files are kept on disk until the job closes.

use crate::error::{ProcessError, ProcessResult};
use crate::native::{ChildProcess, ProcessSpec, SpawnedProcess};
use async_trait::async_trait;
use engine_types::{AnalysisConfig, JobDetails, JobId, ModelSnapshot, Quantiles};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

pub const JOB_ID_ARG: &str = "--jobid=";
pub const BUCKET_SPAN_ARG: &str = "--bucketspan=";
pub const BATCH_SPAN_ARG: &str = "--batchspan=";
pub const LATENCY_ARG: &str = "--latency=";
pub const PERIOD_ARG: &str = "--period=";
pub const SUMMARY_COUNT_FIELD_ARG: &str = "--summarycountfield=";
pub const TIME_FIELD_ARG: &str = "--timefield=";
pub const LENGTH_ENCODED_INPUT_ARG: &str = "--lengthEncodedInput";
pub const FIELD_CONFIG_ARG: &str = "--fieldconfig=";
pub const LIMIT_CONFIG_ARG: &str = "--limitconfig=";
pub const QUANTILES_STATE_ARG: &str = "--quantilesState=";
pub const DELETE_STATE_FILES_ARG: &str = "--deleteStateFiles";
pub const RESTORE_SNAPSHOT_ARG: &str = "--restoreSnapshotId=";
pub const VERSION_ARG: &str = "--version";

/// Reported when the analytics binary cannot tell its version
pub const UNKNOWN_VERSION: &str = "Unknown version of the analytics";

/// Persisted state a new process resumes from
#[derive(Debug, Clone, Default)]
pub struct RestoreState {
    pub quantiles: Option<Quantiles>,
    pub model_snapshot: Option<ModelSnapshot>,
}

/// A started process and the scratch files it was handed
#[derive(Debug)]
pub struct LaunchedProcess {
    pub spawned: SpawnedProcess,
    pub scratch_files: Vec<PathBuf>,
}

/// Starts the analysis process of a job
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn create_process(
        &self,
        job: &JobDetails,
        restore: &RestoreState,
    ) -> ProcessResult<LaunchedProcess>;

    /// Version string of the analytics
    async fn version(&self) -> String;
}

/// Starts one-shot rescoring processes
#[async_trait]
pub trait NormaliserProcessFactory: Send + Sync {
    async fn create_normaliser(
        &self,
        job_id: &JobId,
        quantiles_state: &str,
        bucket_span: Option<u64>,
    ) -> ProcessResult<LaunchedProcess>;
}

/// Locations of the native binaries and their scratch space
#[derive(Debug, Clone)]
pub struct NativeBinaries {
    pub autodetect: PathBuf,
    pub normalize: PathBuf,
    pub scratch_dir: PathBuf,
}

/// Launches the real `autodetect` and `normalize` binaries
#[derive(Debug, Clone)]
pub struct NativeProcessFactory {
    binaries: NativeBinaries,
}

impl NativeProcessFactory {
    pub fn new(binaries: NativeBinaries) -> Self {
        Self { binaries }
    }

    fn spawn(&self, job_id: &JobId, spec: &ProcessSpec) -> ProcessResult<SpawnedProcess> {
        debug!(program = %spec.program.display(), args = ?spec.args, "Starting native process");
        ChildProcess::spawn(spec).map_err(|source| ProcessError::NativeProcessStart {
            job_id: job_id.clone(),
            source,
        })
    }

    fn scratch(
        &self,
        job_id: &JobId,
        prefix: &str,
        suffix: &str,
        contents: &str,
    ) -> ProcessResult<PathBuf> {
        write_scratch_file(&self.binaries.scratch_dir, prefix, suffix, contents).map_err(
            |source| ProcessError::NativeProcessStart {
                job_id: job_id.clone(),
                source,
            },
        )
    }

    /// Files written so far are recorded in `files` even on failure
    fn launch_autodetect(
        &self,
        job: &JobDetails,
        restore: &RestoreState,
        files: &mut ScratchFiles,
    ) -> ProcessResult<SpawnedProcess> {
        let fields = field_config(&job.analysis_config);
        files.field_config = Some(self.scratch(&job.id, "fieldconfig", ".conf", &fields)?);

        let limit = job
            .analysis_limits
            .as_ref()
            .map(|l| l.model_memory_limit)
            .filter(|limit| *limit > 0);
        if let Some(limit) = limit {
            let contents = limit_config(limit);
            files.limit_config = Some(self.scratch(&job.id, "limitconfig", ".conf", &contents)?);
        }

        if let Some(quantiles) = &restore.quantiles {
            files.quantiles =
                Some(self.scratch(&job.id, "quantiles", ".json", &quantiles.quantile_state)?);
        }

        let spec = autodetect_spec(&self.binaries.autodetect, job, restore, files);
        self.spawn(&job.id, &spec)
    }
}

#[async_trait]
impl ProcessFactory for NativeProcessFactory {
    async fn create_process(
        &self,
        job: &JobDetails,
        restore: &RestoreState,
    ) -> ProcessResult<LaunchedProcess> {
        let mut files = ScratchFiles::default();
        match self.launch_autodetect(job, restore, &mut files) {
            Ok(spawned) => Ok(LaunchedProcess {
                spawned,
                scratch_files: files.into_paths(),
            }),
            Err(e) => {
                remove_files(&files.into_paths());
                Err(e)
            }
        }
    }

    async fn version(&self) -> String {
        let output = Command::new(&self.binaries.autodetect)
            .arg(VERSION_ARG)
            .output()
            .await;
        match output {
            Ok(output) => {
                // The binary prints its version to the error stream
                let text = if output.stderr.is_empty() {
                    output.stdout
                } else {
                    output.stderr
                };
                let text = String::from_utf8_lossy(&text).trim().to_string();
                if text.is_empty() {
                    UNKNOWN_VERSION.to_string()
                } else {
                    text
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to run autodetect for its version");
                UNKNOWN_VERSION.to_string()
            }
        }
    }
}

#[async_trait]
impl NormaliserProcessFactory for NativeProcessFactory {
    async fn create_normaliser(
        &self,
        job_id: &JobId,
        quantiles_state: &str,
        bucket_span: Option<u64>,
    ) -> ProcessResult<LaunchedProcess> {
        let quantiles = self.scratch(job_id, "normalizerstate", ".json", quantiles_state)?;
        let spec = normalize_spec(&self.binaries.normalize, job_id, &quantiles, bucket_span);
        match self.spawn(job_id, &spec) {
            Ok(spawned) => Ok(LaunchedProcess {
                spawned,
                scratch_files: vec![quantiles],
            }),
            Err(e) => {
                remove_files(&[quantiles]);
                Err(e)
            }
        }
    }
}

/// Scratch files written for one autodetect launch
#[derive(Debug, Default)]
pub struct ScratchFiles {
    pub field_config: Option<PathBuf>,
    pub limit_config: Option<PathBuf>,
    pub quantiles: Option<PathBuf>,
}

impl ScratchFiles {
    pub fn into_paths(self) -> Vec<PathBuf> {
        [self.field_config, self.limit_config, self.quantiles]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Command line for the autodetect binary
pub fn autodetect_spec(
    program: &Path,
    job: &JobDetails,
    restore: &RestoreState,
    files: &ScratchFiles,
) -> ProcessSpec {
    let config = &job.analysis_config;
    let mut spec = ProcessSpec::new(program).arg(format!("{JOB_ID_ARG}{}", job.id));

    if let Some(span) = config.bucket_span {
        spec = spec.arg(format!("{BUCKET_SPAN_ARG}{span}"));
    }
    if let Some(span) = config.batch_span {
        spec = spec.arg(format!("{BATCH_SPAN_ARG}{span}"));
    }
    if let Some(latency) = config.latency {
        spec = spec.arg(format!("{LATENCY_ARG}{latency}"));
    }
    if let Some(period) = config.period {
        spec = spec.arg(format!("{PERIOD_ARG}{period}"));
    }
    if let Some(field) = config.summary_count_field_name.as_deref().filter(|f| !f.is_empty()) {
        spec = spec.arg(format!("{SUMMARY_COUNT_FIELD_ARG}{field}"));
    }
    if let Some(path) = &files.limit_config {
        spec = spec.arg(format!("{LIMIT_CONFIG_ARG}{}", path.display()));
    }

    spec = spec
        .arg(format!("{TIME_FIELD_ARG}{}", job.data_description.time_field_name))
        .arg(LENGTH_ENCODED_INPUT_ARG);

    if let Some(path) = &files.quantiles {
        spec = spec
            .arg(format!("{QUANTILES_STATE_ARG}{}", path.display()))
            .arg(DELETE_STATE_FILES_ARG);
    }
    if let Some(snapshot) = &restore.model_snapshot {
        spec = spec.arg(format!("{RESTORE_SNAPSHOT_ARG}{}", snapshot.snapshot_id));
    }
    if let Some(path) = &files.field_config {
        spec = spec.arg(format!("{FIELD_CONFIG_ARG}{}", path.display()));
    }
    spec
}

/// Command line for the normalize binary
pub fn normalize_spec(
    program: &Path,
    job_id: &JobId,
    quantiles: &Path,
    bucket_span: Option<u64>,
) -> ProcessSpec {
    let mut spec = ProcessSpec::new(program)
        .arg(format!("{QUANTILES_STATE_ARG}{}", quantiles.display()))
        .arg(DELETE_STATE_FILES_ARG);
    if let Some(span) = bucket_span {
        spec = spec.arg(format!("{BUCKET_SPAN_ARG}{span}"));
    }
    spec.arg(format!("{JOB_ID_ARG}{job_id}"))
        .arg(LENGTH_ENCODED_INPUT_ARG)
}

/// Detector settings in the native field config format
///
/// Each detector contributes `key.setting = value` lines under its config
/// key. A detector whose key repeats an earlier one is skipped.
pub fn field_config(config: &AnalysisConfig) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();

    for detector in &config.detectors {
        let key = detector.config_key();
        if !seen.insert(key.clone()) {
            warn!(key = %key, "Duplicate detector key; skipping detector");
            continue;
        }

        let splits = [
            ("by", &detector.by_field_name),
            ("over", &detector.over_field_name),
            ("partition", &detector.partition_field_name),
        ];
        let has_splits = splits
            .iter()
            .any(|(_, field)| field.as_deref().is_some_and(|f| !f.is_empty()));

        if detector.use_null.is_none() && !has_splits {
            let _ = writeln!(out, "{key}.isEnabled = true");
        }
        if let Some(use_null) = detector.use_null {
            let _ = writeln!(out, "{key}.useNull = {use_null}");
        }
        if let Some(exclude) = detector.exclude_frequent.as_deref().filter(|e| !e.is_empty()) {
            let _ = writeln!(out, "{key}.excludefrequent = {exclude}");
        }
        for (setting, field) in splits {
            if let Some(field) = field.as_deref().filter(|f| !f.is_empty()) {
                let _ = writeln!(out, "{key}.{setting} = {field}");
            }
        }
    }
    out
}

/// Memory limit settings in the native limit config format
pub fn limit_config(model_memory_limit: u64) -> String {
    format!("[memory]\nmodelmemorylimit = {model_memory_limit}\n")
}

fn write_scratch_file(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    contents: &str,
) -> io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path().keep()?)
}

/// Best-effort removal; a file that is already gone is not an error
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete scratch file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_types::{AnalysisLimits, DataDescription, Detector};

    fn job() -> JobDetails {
        let config = AnalysisConfig {
            bucket_span: Some(3600),
            latency: Some(0),
            summary_count_field_name: Some("count".to_string()),
            detectors: vec![
                Detector::function("mean").with_field("responsetime").by("airline"),
                Detector::function("count"),
            ],
            ..Default::default()
        };
        JobDetails::new("farequote", config, DataDescription::default())
    }

    #[test]
    fn test_autodetect_args() {
        let files = ScratchFiles {
            field_config: Some(PathBuf::from("/tmp/fieldconfig1.conf")),
            limit_config: None,
            quantiles: Some(PathBuf::from("/tmp/quantiles1.json")),
        };
        let restore = RestoreState {
            quantiles: None,
            model_snapshot: Some(ModelSnapshot {
                snapshot_id: "1400000000".to_string(),
                timestamp: None,
                description: None,
                restore_priority: 0,
                snapshot_doc_count: 1,
            }),
        };

        let spec = autodetect_spec(Path::new("/opt/bin/autodetect"), &job(), &restore, &files);
        assert_eq!(
            spec.args,
            vec![
                "--jobid=farequote",
                "--bucketspan=3600",
                "--latency=0",
                "--summarycountfield=count",
                "--timefield=time",
                "--lengthEncodedInput",
                "--quantilesState=/tmp/quantiles1.json",
                "--deleteStateFiles",
                "--restoreSnapshotId=1400000000",
                "--fieldconfig=/tmp/fieldconfig1.conf",
            ]
        );
    }

    #[test]
    fn test_normalize_args() {
        let spec = normalize_spec(
            Path::new("normalize"),
            &JobId::new("foo"),
            Path::new("/tmp/q.json"),
            None,
        );
        assert_eq!(
            spec.args,
            vec![
                "--quantilesState=/tmp/q.json",
                "--deleteStateFiles",
                "--jobid=foo",
                "--lengthEncodedInput",
            ]
        );

        let spec = normalize_spec(
            Path::new("normalize"),
            &JobId::new("foo"),
            Path::new("/tmp/q.json"),
            Some(300),
        );
        assert!(spec.args.contains(&"--bucketspan=300".to_string()));
    }

    #[test]
    fn test_field_config_lines() {
        let config = AnalysisConfig {
            detectors: vec![
                Detector::function("count"),
                Detector {
                    use_null: Some(true),
                    exclude_frequent: Some("by".to_string()),
                    ..Detector::function("rare").by("status").partition("host")
                },
                Detector::function("count"),
            ],
            ..Default::default()
        };

        assert_eq!(
            field_config(&config),
            "count.isEnabled = true\n\
             rare-status-host.useNull = true\n\
             rare-status-host.excludefrequent = by\n\
             rare-status-host.by = status\n\
             rare-status-host.partition = host\n"
        );
    }

    #[test]
    fn test_limit_config() {
        assert_eq!(limit_config(512), "[memory]\nmodelmemorylimit = 512\n");
    }

    #[tokio::test]
    async fn test_scratch_files_written_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let factory = NativeProcessFactory::new(NativeBinaries {
            autodetect: PathBuf::from("/nonexistent/autodetect"),
            normalize: PathBuf::from("/nonexistent/normalize"),
            scratch_dir: dir.path().to_path_buf(),
        });
        let path = factory
            .scratch(&JobId::new("foo"), "fieldconfig", ".conf", "count.isEnabled = true\n")
            .unwrap();

        assert!(path.starts_with(dir.path()));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "count.isEnabled = true\n"
        );
        remove_files(&[path.clone(), path.clone()]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_start_removes_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let factory = NativeProcessFactory::new(NativeBinaries {
            autodetect: PathBuf::from("/nonexistent/autodetect"),
            normalize: PathBuf::from("/nonexistent/normalize"),
            scratch_dir: dir.path().to_path_buf(),
        });
        let mut job = job();
        job.analysis_limits = Some(AnalysisLimits {
            model_memory_limit: 100,
        });

        let err = factory
            .create_process(&job, &RestoreState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NativeProcessStart { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(factory.version().await, UNKNOWN_VERSION);
    }
}
