//! Conversion of uploaded data into framed records
//!
//! Input is either delimited text with a header line or one JSON object per
//! line. Every upload is written as a header record followed by one record
//! per accepted input record: the epoch time, the analysis field values in
//! header order and an empty control field.

use crate::control::CONTROL_FIELD_NAME;
use crate::error::{ProcessError, ProcessResult};
use crate::framing::FramedRecordWriter;
use chrono::{TimeZone, Utc};
use engine_storage::ResultsPersister;
use engine_types::{DataCounts, DataFormat, DataLoadParams, JobDetails, TransformConfig};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, warn};

/// Bucket span assumed when the job does not set one
pub const DEFAULT_BUCKET_SPAN_SECS: u64 = 300;

/// Acceptable proportions of bad input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Maximum percentage of records with unparseable timestamps
    pub max_bad_timestamp_percent: u64,
    /// Maximum percentage of records out of time order
    pub max_out_of_order_percent: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bad_timestamp_percent: 25,
            max_out_of_order_percent: 25,
        }
    }
}

/// Header record sent ahead of data: time field, analysis fields, control field
pub fn upload_header(job: &JobDetails) -> Vec<String> {
    let mut header = Vec::with_capacity(job.analysis_fields().len() + 2);
    header.push(job.data_description.time_field_name.clone());
    header.extend(job.analysis_fields());
    header.push(CONTROL_FIELD_NAME.to_string());
    header
}

/// Where an output field takes its value from
#[derive(Debug, Clone, Copy)]
enum Source {
    Input(usize),
    Derived(usize),
    Missing,
}

/// Writes one upload to a native process
pub struct DataToProcessWriter<'a> {
    job: &'a JobDetails,
    params: DataLoadParams,
    limits: UploadLimits,
    persister: &'a dyn ResultsPersister,
    counts: &'a mut DataCounts,
}

impl<'a> DataToProcessWriter<'a> {
    pub fn new(
        job: &'a JobDetails,
        params: DataLoadParams,
        limits: UploadLimits,
        persister: &'a dyn ResultsPersister,
        counts: &'a mut DataCounts,
    ) -> Self {
        Self {
            job,
            params,
            limits,
            persister,
            counts,
        }
    }

    /// Convert `input` and write it to `out`
    ///
    /// Failures writing to `out` surface as [`ProcessError::NativeProcessWrite`]
    /// without captured error output; the caller attaches it.
    pub async fn write<R, W>(
        mut self,
        mut input: R,
        out: &mut FramedRecordWriter<W>,
    ) -> ProcessResult<DataCounts>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header = upload_header(self.job);
        out.write_record(&header)
            .await
            .map_err(|e| self.write_failed(e))?;

        match self.job.data_description.format {
            DataFormat::Delimited => self.write_delimited(&mut input, out, &header).await?,
            DataFormat::Json => self.write_json(&mut input, out, &header).await?,
        }

        out.flush().await.map_err(|e| self.write_failed(e))?;
        self.check_proportions()?;
        debug!(
            processed = self.counts.processed_record_count,
            discarded = self.counts.discarded_record_count(),
            "Upload written to native process"
        );
        Ok(self.counts.clone())
    }

    async fn write_delimited<R, W>(
        &mut self,
        input: &mut R,
        out: &mut FramedRecordWriter<W>,
        header: &[String],
    ) -> ProcessResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let delimiter = self.job.data_description.field_delimiter;
        let quote = self.job.data_description.quote_character;
        let mut line = String::new();

        let read = input.read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        self.counts.input_bytes += read as u64;
        let input_header = split_delimited(trim_line_end(&line), delimiter, quote);
        let plan = FieldPlan::new(self.job, &input_header)?;

        loop {
            line.clear();
            let read = input.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            self.counts.input_bytes += read as u64;
            let trimmed = trim_line_end(&line);
            if trimmed.is_empty() {
                continue;
            }
            let values = split_delimited(trimmed, delimiter, quote);
            self.counts.input_field_count += values.len() as u64;
            let values = values.into_iter().map(Some).collect();
            self.write_record(&plan, values, out, header.len()).await?;
        }
        Ok(())
    }

    async fn write_json<R, W>(
        &mut self,
        input: &mut R,
        out: &mut FramedRecordWriter<W>,
        header: &[String],
    ) -> ProcessResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let columns = json_columns(self.job);
        let plan = FieldPlan::new(self.job, &columns)?;
        let mut line = String::new();

        loop {
            line.clear();
            let read = input.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            self.counts.input_bytes += read as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let object: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(trimmed)
                    .map_err(|e| ProcessError::MalformedJson(e.to_string()))?;

            self.counts.input_field_count += object.len() as u64;
            let values = columns
                .iter()
                .map(|column| object.get(column).map(json_to_field))
                .collect();
            self.write_record(&plan, values, out, header.len()).await?;
        }
        Ok(())
    }

    async fn write_record<W: AsyncWrite + Unpin>(
        &mut self,
        plan: &FieldPlan<'_>,
        values: Vec<Option<String>>,
        out: &mut FramedRecordWriter<W>,
        width: usize,
    ) -> ProcessResult<()> {
        self.counts.input_record_count += 1;

        let raw_time = values
            .get(plan.time_index)
            .and_then(|v| v.as_deref())
            .unwrap_or("");
        let epoch = match self.job.data_description.parse_time(raw_time) {
            Ok(epoch) => epoch,
            Err(e) => {
                debug!(error = %e, "Discarding record with unparseable time");
                self.counts.invalid_date_count += 1;
                return Ok(());
            }
        };

        let latency = self.job.analysis_config.latency.unwrap_or(0) as i64;
        if let Some(latest) = self.counts.latest_record_timestamp {
            if epoch < latest.timestamp() - latency {
                self.counts.out_of_order_timestamp_count += 1;
                return Ok(());
            }
        }

        let derived = self.apply_transforms(plan, &values);
        let mut record = Vec::with_capacity(width);
        record.push(epoch.to_string());
        let mut missing = 0u64;
        for source in &plan.sources {
            let value = match source {
                Source::Input(i) => values.get(*i).cloned().flatten(),
                Source::Derived(i) => derived.get(*i).cloned().flatten(),
                Source::Missing => None,
            };
            if value.is_none() {
                missing += 1;
            }
            record.push(value.unwrap_or_default());
        }
        record.push(String::new());

        out.write_record(&record)
            .await
            .map_err(|e| self.write_failed(e))?;

        self.counts.processed_record_count += 1;
        self.counts.processed_field_count += (plan.sources.len() as u64 + 1) - missing;
        self.counts.missing_field_count += missing;
        self.track_time(epoch);

        if self.params.persist {
            let fields = plan
                .input_columns
                .iter()
                .cloned()
                .zip(values)
                .filter_map(|(name, value)| value.map(|v| (name, v)))
                .collect();
            if let Err(e) = self
                .persister
                .persist_input(&self.job.id, epoch, fields)
                .await
            {
                warn!(error = %e, "Failed to persist input record");
            }
        }
        Ok(())
    }

    /// Values of every transform output, in plan order; `None` on failure
    fn apply_transforms(
        &mut self,
        plan: &FieldPlan<'_>,
        values: &[Option<String>],
    ) -> Vec<Option<String>> {
        let mut derived: Vec<Option<String>> = Vec::with_capacity(plan.derived_names.len());
        for step in &plan.transforms {
            let inputs: Option<Vec<&str>> = step
                .inputs
                .iter()
                .map(|source| match source {
                    Source::Input(i) => values.get(*i).and_then(|v| v.as_deref()),
                    Source::Derived(i) => derived.get(*i).and_then(|v| v.as_deref()),
                    Source::Missing => None,
                })
                .collect();
            let output = inputs.and_then(|inputs| {
                step.config
                    .transform
                    .apply(&step.config.arguments, &inputs)
            });
            if output.is_none() {
                self.counts.failed_transform_count += 1;
            }
            for _ in 0..step.outputs {
                derived.push(output.clone());
            }
        }
        derived
    }

    fn track_time(&mut self, epoch: i64) {
        let span = self
            .job
            .analysis_config
            .bucket_span
            .unwrap_or(DEFAULT_BUCKET_SPAN_SECS)
            .max(1) as i64;
        let previous = self.counts.latest_record_timestamp.map(|t| t.timestamp());
        match previous {
            Some(prev) if prev.div_euclid(span) >= epoch.div_euclid(span) => {}
            _ => self.counts.bucket_count += 1,
        }
        if previous.map_or(true, |prev| epoch > prev) {
            self.counts.latest_record_timestamp = Utc.timestamp_opt(epoch, 0).single();
        }
    }

    fn check_proportions(&self) -> ProcessResult<()> {
        if self.counts.invalid_date_percent() > self.limits.max_bad_timestamp_percent {
            return Err(ProcessError::HighProportionOfBadTimestamps {
                invalid: self.counts.invalid_date_count,
                total: self.counts.input_record_count,
            });
        }
        if self.counts.out_of_order_percent() > self.limits.max_out_of_order_percent {
            return Err(ProcessError::OutOfOrderRecords {
                out_of_order: self.counts.out_of_order_timestamp_count,
                total: self.counts.input_record_count,
            });
        }
        Ok(())
    }

    fn write_failed(&self, e: io::Error) -> ProcessError {
        ProcessError::NativeProcessWrite {
            job_id: self.job.id.clone(),
            message: e.to_string(),
            stderr: String::new(),
        }
    }
}

/// A transform with its inputs resolved
#[derive(Debug)]
struct TransformStep<'a> {
    config: &'a TransformConfig,
    inputs: Vec<Source>,
    outputs: usize,
}

/// How each header field is produced from an input record
#[derive(Debug)]
struct FieldPlan<'a> {
    time_index: usize,
    input_columns: Vec<String>,
    sources: Vec<Source>,
    transforms: Vec<TransformStep<'a>>,
    derived_names: Vec<String>,
}

impl<'a> FieldPlan<'a> {
    fn new(job: &'a JobDetails, input_columns: &[String]) -> ProcessResult<Self> {
        let column_index: HashMap<&str, usize> = input_columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let time_field = &job.data_description.time_field_name;
        let time_index = *column_index
            .get(time_field.as_str())
            .ok_or_else(|| ProcessError::MissingField(time_field.clone()))?;

        let mut derived_names: Vec<String> = Vec::new();
        let mut transforms = Vec::with_capacity(job.transforms.len());
        for config in &job.transforms {
            let inputs = config
                .inputs
                .iter()
                .map(|name| resolve(name, &column_index, &derived_names))
                .collect();
            let outputs = config.output_names();
            transforms.push(TransformStep {
                config,
                inputs,
                outputs: outputs.len(),
            });
            derived_names.extend(outputs);
        }

        let sources: Vec<Source> = job
            .analysis_fields()
            .iter()
            .map(|name| resolve(name, &column_index, &derived_names))
            .collect();
        for (name, source) in job.analysis_fields().iter().zip(&sources) {
            if matches!(source, Source::Missing) {
                warn!(field = %name, "Analysis field not present in input");
            }
        }

        Ok(Self {
            time_index,
            input_columns: input_columns.to_vec(),
            sources,
            transforms,
            derived_names,
        })
    }
}

/// Transform outputs shadow input columns of the same name
fn resolve(name: &str, columns: &HashMap<&str, usize>, derived: &[String]) -> Source {
    if let Some(i) = derived.iter().rposition(|d| d == name) {
        Source::Derived(i)
    } else if let Some(i) = columns.get(name) {
        Source::Input(*i)
    } else {
        Source::Missing
    }
}

fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Split one delimited line, honouring quoted fields and doubled quotes
pub fn split_delimited(line: &str, delimiter: char, quote: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == quote {
                if chars.peek() == Some(&quote) {
                    field.push(quote);
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == quote {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut field));
        } else {
            field.push(c);
        }
    }
    fields.push(field);
    fields
}

/// Keys looked up in every JSON object: the time field, the analysis fields
/// and any transform input not produced by an earlier transform
fn json_columns(job: &JobDetails) -> Vec<String> {
    let mut columns = vec![job.data_description.time_field_name.clone()];
    let mut derived: Vec<String> = Vec::new();
    for config in &job.transforms {
        for input in &config.inputs {
            if !derived.contains(input) && !columns.contains(input) {
                columns.push(input.clone());
            }
        }
        derived.extend(config.output_names());
    }
    for field in job.analysis_fields() {
        if !derived.contains(&field) && !columns.contains(&field) {
            columns.push(field);
        }
    }
    columns
}

fn json_to_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
