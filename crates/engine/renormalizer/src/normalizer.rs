//! Rescoring through the native `normalize` process
//!
//! The process is seeded with a quantiles state, reads one record per
//! rescorable node and answers each with a single score, in order.

use crate::normalisable::Normalisable;
use engine_process::factory::remove_files;
use engine_process::native::{ProcessInput, ProcessOutput};
use engine_process::{
    ErrorStreamReader, FramedRecordReader, FramedRecordWriter, LaunchedProcess,
    NormaliserProcessFactory, ProcessError, ProcessResult, SpawnedProcess,
};
use engine_types::JobId;
use std::io;
use std::sync::Arc;
use tokio::io::BufWriter;
use tracing::{debug, Span};

/// Field names of the records sent to the normalize process
pub const HEADER: [&str; 7] = [
    "level",
    "partitionFieldName",
    "partitionFieldValue",
    "personFieldName",
    "functionName",
    "valueFieldName",
    "probability",
];

/// Whether replacing `old` with `new` is worth persisting.
///
/// A change of at least one point counts, as does either score dropping
/// below half of the other.
pub fn is_big_update(old: f64, new: f64) -> bool {
    (new - old).abs() >= 1.0 || new < old * 0.5 || old < new * 0.5
}

/// Rescores result trees for one job
pub struct Normalizer {
    job_id: JobId,
    factory: Arc<dyn NormaliserProcessFactory>,
    span: Span,
}

impl Normalizer {
    pub fn new(job_id: JobId, factory: Arc<dyn NormaliserProcessFactory>, span: Span) -> Self {
        Self {
            job_id,
            factory,
            span,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Rescore `roots` against `quantiles_state`.
    ///
    /// New scores and big-change flags are written into the entities behind
    /// the nodes.
    pub async fn normalise(
        &self,
        bucket_span: Option<u64>,
        roots: &mut [Normalisable<'_>],
        quantiles_state: &str,
    ) -> ProcessResult<()> {
        let mut rows = Vec::new();
        for root in roots.iter_mut() {
            collect_rows(root, &mut rows);
        }
        if rows.is_empty() {
            return Ok(());
        }

        let LaunchedProcess {
            spawned,
            scratch_files,
        } = self
            .factory
            .create_normaliser(&self.job_id, quantiles_state, bucket_span)
            .await?;
        let scores = self.run(spawned, &rows).await;
        remove_files(&scratch_files);
        let scores = scores?;

        if scores.len() != rows.len() {
            return Err(self.desync(format!(
                "normalize process returned {} scores for {} records",
                scores.len(),
                rows.len()
            )));
        }

        let mut cursor = scores.into_iter();
        merge_group(roots, None, &mut cursor).map_err(|message| self.desync(message))?;
        debug!(job_id = %self.job_id, nodes = rows.len(), "Merged normalised scores");
        Ok(())
    }

    async fn run(&self, spawned: SpawnedProcess, rows: &[Vec<String>]) -> ProcessResult<Vec<f64>> {
        let SpawnedProcess {
            mut process,
            stdin,
            stdout,
            stderr,
        } = spawned;
        let errors = ErrorStreamReader::spawn(stderr, self.span.clone());
        let parser = tokio::spawn(read_scores(stdout));

        let mut writer = FramedRecordWriter::new(BufWriter::new(stdin));
        let written = write_rows(&mut writer, rows).await;
        drop(writer);

        if let Err(e) = written {
            // The process has most likely died; reap it so its error output is complete
            let _ = process.wait().await;
            parser.abort();
            return Err(ProcessError::NativeProcessWrite {
                job_id: self.job_id.clone(),
                message: e.to_string(),
                stderr: errors.drain_after_exit().await,
            });
        }

        let parsed = parser.await;
        let status = process.wait().await?;
        if !status.success() {
            return Err(ProcessError::NativeProcess {
                job_id: self.job_id.clone(),
                message: format!("normalize process exited with {status}"),
                stderr: errors.drain_after_exit().await,
            });
        }

        match parsed {
            Ok(Ok(scores)) => Ok(scores),
            Ok(Err(e)) => Err(ProcessError::NativeProcess {
                job_id: self.job_id.clone(),
                message: format!("unreadable normalize output: {e}"),
                stderr: errors.drain_after_exit().await,
            }),
            Err(e) => Err(self.desync(format!("normalize output reader failed: {e}"))),
        }
    }

    fn desync(&self, message: String) -> ProcessError {
        ProcessError::NativeProcess {
            job_id: self.job_id.clone(),
            message,
            stderr: String::new(),
        }
    }
}

/// Depth-first rows for every node the process scores
fn collect_rows(node: &mut Normalisable<'_>, rows: &mut Vec<Vec<String>>) {
    if !node.is_container_only() {
        let field = |value: Option<&str>| value.unwrap_or("").to_string();
        rows.push(vec![
            node.level().to_string(),
            field(node.partition_field_name()),
            field(node.partition_field_value()),
            field(node.person_field_name()),
            field(node.function_name()),
            field(node.value_field_name()),
            node.probability().to_string(),
        ]);
    }
    for &child_type in node.child_types() {
        for mut child in node.children(child_type) {
            collect_rows(&mut child, rows);
        }
    }
}

async fn write_rows(
    writer: &mut FramedRecordWriter<BufWriter<ProcessInput>>,
    rows: &[Vec<String>],
) -> io::Result<()> {
    writer.write_record(&HEADER).await?;
    for row in rows {
        writer.write_record(row).await?;
    }
    writer.shutdown().await
}

async fn read_scores(stdout: ProcessOutput) -> io::Result<Vec<f64>> {
    let mut reader = FramedRecordReader::new(stdout);
    let mut scores = Vec::new();
    while let Some(record) = reader.read_record().await? {
        let field = record.first().map(String::as_str).unwrap_or("");
        let score = field.trim().parse::<f64>().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad score '{field}': {e}"))
        })?;
        scores.push(score);
    }
    Ok(scores)
}

/// Merge scores into one sibling group, in the order rows were written.
///
/// Returns whether any node of the group took a new score, which marks the
/// group's parent as changed.
fn merge_group<I>(
    nodes: &mut [Normalisable<'_>],
    parent_score: Option<f64>,
    scores: &mut I,
) -> Result<bool, String>
where
    I: Iterator<Item = f64>,
{
    let mut raise_parent = false;
    for node in nodes.iter_mut() {
        node.reset_big_update();
        if let Some(score) = parent_score {
            node.set_parent_score(score);
            node.raise_big_update();
        }

        if !node.is_container_only() {
            let new = scores
                .next()
                .ok_or_else(|| "normalize process returned too few scores".to_string())?;
            if is_big_update(node.normalized_score(), new) {
                node.set_normalized_score(new);
                node.raise_big_update();
                raise_parent = true;
            }
        }

        for &child_type in node.child_types() {
            let changed_score = node.had_big_update().then(|| node.normalized_score());
            let mut children = node.children(child_type);
            if children.is_empty() {
                continue;
            }
            let child_changed = merge_group(&mut children, changed_score, scores)?;
            let max = children
                .iter()
                .map(Normalisable::normalized_score)
                .fold(0.0, f64::max);
            drop(children);

            if child_changed {
                node.raise_big_update();
            }
            if node.set_max_children_score(child_type, max) {
                node.raise_big_update();
            }
        }
    }
    Ok(raise_parent)
}
