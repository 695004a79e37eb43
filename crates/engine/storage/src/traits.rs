//! Storage trait definitions

use crate::error::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_types::{
    AnomalyRecord, Bucket, BucketQuery, DataCounts, Influencer, InfluencerQuery, JobDetails,
    JobId, JobStatus, ModelSnapshot, QueryPage, Quantiles,
};

/// Combined storage trait
pub trait Storage: JobProvider + ResultsPersister + Send + Sync {}

impl<T: JobProvider + ResultsPersister + Send + Sync> Storage for T {}

/// Read and update access to jobs and their persisted results
#[async_trait]
pub trait JobProvider: Send + Sync {
    /// Get a job by id
    async fn job_details(&self, job_id: &JobId) -> StorageResult<Option<JobDetails>>;

    /// Get a single field of a job by dotted camelCase path,
    /// e.g. `analysisConfig.bucketSpan`
    async fn get_field(&self, job_id: &JobId, path: &str)
        -> StorageResult<Option<serde_json::Value>>;

    async fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> StorageResult<()>;

    async fn set_job_finished_time_and_status(
        &self,
        job_id: &JobId,
        finished_time: DateTime<Utc>,
        status: JobStatus,
    ) -> StorageResult<()>;

    async fn latest_quantiles(&self, job_id: &JobId) -> StorageResult<Option<Quantiles>>;

    async fn latest_model_snapshot(&self, job_id: &JobId)
        -> StorageResult<Option<ModelSnapshot>>;

    /// Page of buckets ordered by timestamp
    async fn buckets(&self, job_id: &JobId, query: &BucketQuery)
        -> StorageResult<QueryPage<Bucket>>;

    /// Load the records of `bucket` into it, returning how many were loaded
    async fn expand_bucket(&self, job_id: &JobId, bucket: &mut Bucket) -> StorageResult<usize>;

    /// Page of influencers ordered by timestamp
    async fn influencers(
        &self,
        job_id: &JobId,
        query: &InfluencerQuery,
    ) -> StorageResult<QueryPage<Influencer>>;

    async fn update_bucket(
        &self,
        job_id: &JobId,
        bucket_id: &str,
        anomaly_score: f64,
        max_normalized_probability: f64,
    ) -> StorageResult<()>;

    /// Rewrite the scores of the given records of one bucket
    async fn update_records(
        &self,
        job_id: &JobId,
        bucket_id: &str,
        records: &[AnomalyRecord],
    ) -> StorageResult<()>;

    async fn update_influencer(&self, job_id: &JobId, influencer: &Influencer)
        -> StorageResult<()>;

    /// Make recent updates visible to searches
    async fn refresh_index(&self, job_id: &JobId) -> StorageResult<()>;

    /// Remove any raw input kept for the job
    async fn delete_persisted_input(&self, job_id: &JobId) -> StorageResult<()>;
}

/// Sink for results produced by a native process
#[async_trait]
pub trait ResultsPersister: Send + Sync {
    async fn persist_bucket(&self, job_id: &JobId, bucket: Bucket) -> StorageResult<()>;

    async fn persist_influencer(&self, job_id: &JobId, influencer: Influencer)
        -> StorageResult<()>;

    async fn persist_quantiles(&self, job_id: &JobId, quantiles: &Quantiles) -> StorageResult<()>;

    async fn persist_model_snapshot(
        &self,
        job_id: &JobId,
        snapshot: &ModelSnapshot,
    ) -> StorageResult<()>;

    async fn persist_data_counts(&self, job_id: &JobId, counts: &DataCounts) -> StorageResult<()>;

    /// Keep one raw input record, as field name/value pairs
    async fn persist_input(
        &self,
        job_id: &JobId,
        epoch: i64,
        fields: Vec<(String, String)>,
    ) -> StorageResult<()>;
}
