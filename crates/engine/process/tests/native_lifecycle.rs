//! Job lifecycle against real child processes

#![cfg(unix)]

use engine_process::{
    NativeBinaries, NativeProcessFactory, NoopRenormaliser, ProcessError, ProcessFactory,
    ProcessManager, ProcessManagerConfig,
};
use engine_storage::{InMemoryJobProvider, JobProvider};
use engine_types::{
    AnalysisConfig, DataDescription, DataLoadParams, Detector, JobDetails, JobId, JobStatus,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Stand-in autodetect: reports a version, otherwise copies input to output
const AUTODETECT_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "autodetect 6.1.0 (test)" >&2
    exit 0
fi
exec cat
"#;

fn job() -> JobDetails {
    let config = AnalysisConfig {
        bucket_span: Some(3600),
        detectors: vec![Detector::function("mean")
            .with_field("responsetime")
            .by("airline")],
        ..Default::default()
    };
    JobDetails::new("foo", config, DataDescription::default())
}

fn write_script(dir: &Path) -> PathBuf {
    let path = dir.join("autodetect");
    std::fs::write(&path, AUTODETECT_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    manager: ProcessManager,
    storage: InMemoryJobProvider,
    factory: Arc<NativeProcessFactory>,
    scratch: TempDir,
    _bin: TempDir,
}

async fn fixture(autodetect: Option<&str>) -> Fixture {
    let bin = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let autodetect = match autodetect {
        Some(name) => bin.path().join(name),
        None => write_script(bin.path()),
    };

    let storage = InMemoryJobProvider::new();
    storage.put_job(job()).await;
    let factory = Arc::new(NativeProcessFactory::new(NativeBinaries {
        autodetect,
        normalize: bin.path().join("normalize"),
        scratch_dir: scratch.path().to_path_buf(),
    }));
    let manager = ProcessManager::new(
        Arc::new(storage.clone()),
        factory.clone(),
        Arc::new(NoopRenormaliser),
        ProcessManagerConfig::default(),
    );
    Fixture {
        manager,
        storage,
        factory,
        scratch,
        _bin: bin,
    }
}

fn scratch_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_upload_and_close_with_child_process() {
    let fixture = fixture(None).await;
    let foo = JobId::new("foo");

    let data = "time,airline,responsetime\n1400000000,AAL,132.2\n1400000060,JZA,990.4\n";
    let counts = fixture
        .manager
        .load_data(&foo, data.as_bytes(), DataLoadParams::default())
        .await
        .unwrap();
    assert_eq!(counts.processed_record_count, 2);
    assert!(fixture.manager.job_is_running(&foo));
    assert!(scratch_files(fixture.scratch.path()) > 0);

    fixture.manager.close(&foo).await.unwrap();

    assert!(!fixture.manager.job_is_running(&foo));
    assert_eq!(scratch_files(fixture.scratch.path()), 0);
    let details = fixture.storage.job_details(&foo).await.unwrap().unwrap();
    assert_eq!(details.status, JobStatus::Closed);
    assert!(details.finished_time.is_some());
}

#[tokio::test]
async fn test_missing_binary_fails_start_and_cleans_up() {
    let fixture = fixture(Some("not-installed")).await;
    let foo = JobId::new("foo");

    let data = "time,airline,responsetime\n1400000000,AAL,132.2\n";
    let err = fixture
        .manager
        .load_data(&foo, data.as_bytes(), DataLoadParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::NativeProcessStart { .. }));
    assert!(!fixture.manager.job_is_running(&foo));
    assert_eq!(scratch_files(fixture.scratch.path()), 0);
}

#[tokio::test]
async fn test_version_read_from_error_stream() {
    let fixture = fixture(None).await;
    assert_eq!(fixture.factory.version().await, "autodetect 6.1.0 (test)");
    assert_eq!(
        fixture.manager.analytics_version().await,
        "autodetect 6.1.0 (test)"
    );
}
