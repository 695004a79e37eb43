//! Job configuration types
//!
//! A [`JobDetails`] is the persisted description of an analysis job. The
//! process orchestrator only ever reads a snapshot of it when a native
//! process is started.

use crate::JobId;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Idle timeout applied to jobs that do not configure one
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Persisted description of an analysis job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub id: JobId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub analysis_config: AnalysisConfig,

    #[serde(default)]
    pub analysis_limits: Option<AnalysisLimits>,

    #[serde(default)]
    pub data_description: DataDescription,

    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// Scheduler configuration, carried through opaquely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_config: Option<serde_json::Value>,

    /// Idle timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<DateTime<Utc>>,
}

fn default_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl JobDetails {
    pub fn new(
        id: impl Into<JobId>,
        analysis_config: AnalysisConfig,
        data_description: DataDescription,
    ) -> Self {
        Self {
            id: id.into(),
            description: None,
            analysis_config,
            analysis_limits: None,
            data_description,
            transforms: Vec::new(),
            scheduler_config: None,
            timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            status: JobStatus::Closed,
            create_time: Some(Utc::now()),
            finished_time: None,
        }
    }

    /// How long the job may sit without uploads before it is closed
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Fields the native process analyses, sorted and without the time field
    ///
    /// Together with the time field these make up the upload header.
    pub fn analysis_fields(&self) -> Vec<String> {
        let time_field = &self.data_description.time_field_name;
        self.analysis_config
            .analysis_fields()
            .into_iter()
            .filter(|f| f != time_field)
            .collect()
    }
}

/// Job lifecycle status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Closed,
    Running,
    Closing,
    Failed,
    Paused,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Closed => "CLOSED",
            JobStatus::Running => "RUNNING",
            JobStatus::Closing => "CLOSING",
            JobStatus::Failed => "FAILED",
            JobStatus::Paused => "PAUSED",
        };
        f.write_str(s)
    }
}

/// Analysis settings handed to the native process
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Bucket span in seconds; the native default applies when unset
    #[serde(default)]
    pub bucket_span: Option<u64>,

    #[serde(default)]
    pub batch_span: Option<u64>,

    #[serde(default)]
    pub latency: Option<u64>,

    #[serde(default)]
    pub period: Option<u64>,

    #[serde(default)]
    pub summary_count_field_name: Option<String>,

    pub detectors: Vec<Detector>,

    #[serde(default)]
    pub influencers: Vec<String>,
}

impl AnalysisConfig {
    /// Every field referenced by the configuration, sorted and de-duplicated
    pub fn analysis_fields(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        for detector in &self.detectors {
            fields.extend(detector.referenced_fields().map(str::to_string));
        }
        fields.extend(self.influencers.iter().cloned());
        if let Some(summary) = &self.summary_count_field_name {
            fields.insert(summary.clone());
        }
        fields.retain(|f| !f.is_empty());
        fields.into_iter().collect()
    }
}

/// Memory limits for the native process
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisLimits {
    /// Model memory limit in MB; zero means the native default
    #[serde(default)]
    pub model_memory_limit: u64,
}

/// A single detector clause
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detector {
    #[serde(default)]
    pub function: Option<String>,

    #[serde(default)]
    pub field_name: Option<String>,

    #[serde(default)]
    pub by_field_name: Option<String>,

    #[serde(default)]
    pub over_field_name: Option<String>,

    #[serde(default)]
    pub partition_field_name: Option<String>,

    #[serde(default)]
    pub exclude_frequent: Option<String>,

    #[serde(default)]
    pub use_null: Option<bool>,
}

impl Detector {
    /// Detector that applies `function` to every record
    pub fn function(function: impl Into<String>) -> Self {
        Self {
            function: Some(function.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field_name = Some(field.into());
        self
    }

    pub fn by(mut self, field: impl Into<String>) -> Self {
        self.by_field_name = Some(field.into());
        self
    }

    pub fn over(mut self, field: impl Into<String>) -> Self {
        self.over_field_name = Some(field.into());
        self
    }

    pub fn partition(mut self, field: impl Into<String>) -> Self {
        self.partition_field_name = Some(field.into());
        self
    }

    /// Key identifying this detector in the native field config file,
    /// e.g. `mean(responsetime)-airline`
    pub fn config_key(&self) -> String {
        let mut key = match (non_empty(&self.function), non_empty(&self.field_name)) {
            (Some(function), Some(field)) => format!("{function}({field})"),
            (Some(function), None) => function.to_string(),
            (None, Some(field)) => field.to_string(),
            (None, None) => String::new(),
        };
        for split in [
            &self.by_field_name,
            &self.over_field_name,
            &self.partition_field_name,
        ] {
            if let Some(split) = non_empty(split) {
                key.push('-');
                key.push_str(split);
            }
        }
        key
    }

    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        [
            &self.field_name,
            &self.by_field_name,
            &self.over_field_name,
            &self.partition_field_name,
        ]
        .into_iter()
        .filter_map(non_empty)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Input format of uploaded data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    #[default]
    Delimited,
    Json,
}

/// Description of the uploaded data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDescription {
    #[serde(default)]
    pub format: DataFormat,

    #[serde(default = "default_delimiter")]
    pub field_delimiter: char,

    #[serde(default = "default_quote")]
    pub quote_character: char,

    #[serde(default = "default_time_field")]
    pub time_field_name: String,

    /// `epoch`, `epoch_ms` or a chrono format string
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

fn default_delimiter() -> char {
    ','
}

fn default_quote() -> char {
    '"'
}

fn default_time_field() -> String {
    "time".to_string()
}

fn default_time_format() -> String {
    "epoch".to_string()
}

impl Default for DataDescription {
    fn default() -> Self {
        Self {
            format: DataFormat::default(),
            field_delimiter: default_delimiter(),
            quote_character: default_quote(),
            time_field_name: default_time_field(),
            time_format: default_time_format(),
        }
    }
}

/// A timestamp could not be parsed with the configured format
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse '{value}' with time format '{format}'")]
pub struct TimeParseError {
    pub value: String,
    pub format: String,
}

impl DataDescription {
    /// Parses a raw timestamp into epoch seconds
    pub fn parse_time(&self, value: &str) -> Result<i64, TimeParseError> {
        let value = value.trim();
        let err = || TimeParseError {
            value: value.to_string(),
            format: self.time_format.clone(),
        };

        match self.time_format.as_str() {
            "epoch" => value
                .parse::<i64>()
                .ok()
                .or_else(|| value.parse::<f64>().ok().map(|v| v.floor() as i64))
                .ok_or_else(err),
            "epoch_ms" => value
                .parse::<i64>()
                .map(|ms| ms.div_euclid(1000))
                .map_err(|_| err()),
            format => DateTime::parse_from_str(value, format)
                .map(|dt| dt.timestamp())
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(value, format)
                        .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
                })
                .map_err(|_| err()),
        }
    }
}

/// Transform applied to input fields before they reach the native process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub transform: TransformType,

    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub arguments: Vec<String>,
}

impl TransformConfig {
    /// Output field names, defaulting to the transform's own name
    pub fn output_names(&self) -> Vec<String> {
        if self.outputs.is_empty() {
            vec![self.transform.default_output().to_string()]
        } else {
            self.outputs.clone()
        }
    }
}

/// Supported transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    Concat,
    Lowercase,
    Uppercase,
    Trim,
}

impl TransformType {
    pub fn default_output(&self) -> &'static str {
        match self {
            TransformType::Concat => "concat",
            TransformType::Lowercase => "lowercase",
            TransformType::Uppercase => "uppercase",
            TransformType::Trim => "trim",
        }
    }

    /// Applies the transform; `None` when the inputs do not fit it
    pub fn apply(&self, arguments: &[String], inputs: &[&str]) -> Option<String> {
        match self {
            TransformType::Concat => {
                let delimiter = arguments.first().map(String::as_str).unwrap_or("");
                Some(inputs.join(delimiter))
            }
            TransformType::Lowercase => single(inputs).map(str::to_lowercase),
            TransformType::Uppercase => single(inputs).map(str::to_uppercase),
            TransformType::Trim => single(inputs).map(|v| v.trim().to_string()),
        }
    }
}

fn single<'a>(inputs: &[&'a str]) -> Option<&'a str> {
    match inputs {
        [only] => Some(only),
        _ => None,
    }
}
