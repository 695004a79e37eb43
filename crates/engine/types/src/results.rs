//! Result entities written by the native analytics process
//!
//! Field names follow the camelCase JSON emitted by the native process.
//! Timestamps travel as epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field name of the bucket influencer that represents the whole bucket
pub const BUCKET_TIME_INFLUENCER: &str = "bucket_time";

/// Fixed time-window aggregate of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Storage id; assigned by the persister when empty
    #[serde(default)]
    pub id: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub bucket_span: u64,

    #[serde(default)]
    pub anomaly_score: f64,

    #[serde(default)]
    pub max_normalized_probability: f64,

    /// Score before any normalisation
    #[serde(default)]
    pub raw_anomaly_score: f64,

    #[serde(default)]
    pub initial_anomaly_score: f64,

    #[serde(default)]
    pub record_count: u32,

    #[serde(default)]
    pub event_count: u64,

    #[serde(default)]
    pub is_interim: bool,

    #[serde(default)]
    pub records: Vec<AnomalyRecord>,

    #[serde(default)]
    pub bucket_influencers: Vec<BucketInfluencer>,

    #[serde(default)]
    pub partition_scores: Vec<PartitionScore>,

    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

impl Bucket {
    pub fn new(timestamp: DateTime<Utc>, bucket_span: u64) -> Self {
        Self {
            id: String::new(),
            timestamp,
            bucket_span,
            anomaly_score: 0.0,
            max_normalized_probability: 0.0,
            raw_anomaly_score: 0.0,
            initial_anomaly_score: 0.0,
            record_count: 0,
            event_count: 0,
            is_interim: false,
            records: Vec::new(),
            bucket_influencers: Vec::new(),
            partition_scores: Vec::new(),
            had_big_normalized_update: false,
        }
    }

    /// Whether rescoring could change anything in this bucket
    pub fn is_normalisable(&self) -> bool {
        self.raw_anomaly_score > 0.0 || self.record_count > 0
    }
}

/// A single anomalous record inside a bucket
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub detector_index: u32,

    #[serde(default)]
    pub probability: f64,

    #[serde(default)]
    pub by_field_name: Option<String>,

    #[serde(default)]
    pub by_field_value: Option<String>,

    #[serde(default)]
    pub over_field_name: Option<String>,

    #[serde(default)]
    pub over_field_value: Option<String>,

    #[serde(default)]
    pub partition_field_name: Option<String>,

    #[serde(default)]
    pub partition_field_value: Option<String>,

    #[serde(default)]
    pub function: Option<String>,

    #[serde(default)]
    pub field_name: Option<String>,

    #[serde(default)]
    pub typical: Option<Vec<f64>>,

    #[serde(default)]
    pub actual: Option<Vec<f64>>,

    #[serde(default)]
    pub is_interim: bool,

    #[serde(default)]
    pub anomaly_score: f64,

    #[serde(default)]
    pub normalized_probability: f64,

    #[serde(default)]
    pub initial_normalized_probability: f64,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub bucket_span: u64,

    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

impl AnomalyRecord {
    /// The field identifying the entity: over field when present, else by field
    pub fn person_field_name(&self) -> Option<&str> {
        self.over_field_name
            .as_deref()
            .or(self.by_field_name.as_deref())
    }
}

/// Per-influencer-field score of a whole bucket
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfluencer {
    pub influencer_field_name: String,

    #[serde(default)]
    pub initial_anomaly_score: f64,

    #[serde(default)]
    pub anomaly_score: f64,

    #[serde(default)]
    pub raw_anomaly_score: f64,

    #[serde(default)]
    pub probability: f64,

    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// Score of a single influencer value over a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Influencer {
    #[serde(default)]
    pub id: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub influencer_field_name: String,

    pub influencer_field_value: String,

    #[serde(default)]
    pub probability: f64,

    #[serde(default)]
    pub initial_anomaly_score: f64,

    #[serde(default)]
    pub anomaly_score: f64,

    #[serde(default)]
    pub is_interim: bool,

    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// Partition-level score inside a bucket
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionScore {
    pub partition_field_name: String,

    pub partition_field_value: String,

    #[serde(default)]
    pub probability: f64,

    #[serde(default)]
    pub anomaly_score: f64,

    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// Serialized normalisation baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantiles {
    pub quantile_state: String,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Persisted model state the native process can be restored from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub snapshot_id: String,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub restore_priority: i64,

    #[serde(default)]
    pub snapshot_doc_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_from_native_json() {
        let json = r#"{
            "timestamp": 1400000000000,
            "bucketSpan": 3600,
            "anomalyScore": 12.5,
            "rawAnomalyScore": 0.3,
            "recordCount": 1,
            "records": [ { "probability": 0.001, "byFieldName": "airline", "byFieldValue": "AAL" } ],
            "bucketInfluencers": [ { "influencerFieldName": "bucket_time", "anomalyScore": 12.5 } ]
        }"#;
        let bucket: Bucket = serde_json::from_str(json).unwrap();
        assert_eq!(bucket.timestamp.timestamp(), 1_400_000_000);
        assert_eq!(bucket.records.len(), 1);
        assert!(bucket.is_normalisable());
        assert!(!bucket.had_big_normalized_update);
    }

    #[test]
    fn test_empty_bucket_is_not_normalisable() {
        let bucket = Bucket::new(Utc::now(), 3600);
        assert!(!bucket.is_normalisable());
    }

    #[test]
    fn test_person_field_prefers_over() {
        let mut record = AnomalyRecord {
            by_field_name: Some("airline".to_string()),
            ..Default::default()
        };
        assert_eq!(record.person_field_name(), Some("airline"));

        record.over_field_name = Some("user".to_string());
        assert_eq!(record.person_field_name(), Some("user"));
    }
}
