//! In-memory storage implementation

use super::traits::*;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_types::{
    AnomalyRecord, Bucket, BucketQuery, DataCounts, Influencer, InfluencerQuery, JobDetails,
    JobId, JobStatus, ModelSnapshot, QueryPage, Quantiles,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Everything stored for a single job
#[derive(Debug, Default)]
struct JobStore {
    details: Option<JobDetails>,
    /// Buckets keyed by (timestamp, id); records are kept apart
    buckets: BTreeMap<(DateTime<Utc>, String), Bucket>,
    records: HashMap<String, Vec<AnomalyRecord>>,
    influencers: BTreeMap<(DateTime<Utc>, String), Influencer>,
    quantiles: Option<Quantiles>,
    snapshots: Vec<ModelSnapshot>,
    data_counts: DataCounts,
    input: Vec<(i64, Vec<(String, String)>)>,
}

/// Call counters, used to assert on storage traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderStats {
    pub field_requests: u64,
    pub bucket_updates: u64,
    pub record_updates: u64,
    pub influencer_updates: u64,
    pub index_refreshes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    field_requests: AtomicU64,
    bucket_updates: AtomicU64,
    record_updates: AtomicU64,
    influencer_updates: AtomicU64,
    index_refreshes: AtomicU64,
}

/// In-memory storage for development and testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobProvider {
    jobs: Arc<RwLock<HashMap<JobId, JobStore>>>,
    counters: Arc<Counters>,
}

impl InMemoryJobProvider {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a job
    pub async fn put_job(&self, job: JobDetails) {
        let id = job.id.clone();
        let mut jobs = self.jobs.write().await;
        jobs.entry(id).or_default().details = Some(job);
    }

    pub async fn data_counts(&self, job_id: &JobId) -> Option<DataCounts> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|s| s.data_counts.clone())
    }

    /// A stored bucket with its records embedded
    pub async fn bucket(&self, job_id: &JobId, bucket_id: &str) -> Option<Bucket> {
        let jobs = self.jobs.read().await;
        let store = jobs.get(job_id)?;
        let mut bucket = store.buckets.values().find(|b| b.id == bucket_id)?.clone();
        bucket.records = store.records.get(bucket_id).cloned().unwrap_or_default();
        Some(bucket)
    }

    pub async fn influencer(&self, job_id: &JobId, influencer_id: &str) -> Option<Influencer> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)?
            .influencers
            .values()
            .find(|i| i.id == influencer_id)
            .cloned()
    }

    pub async fn persisted_input_count(&self, job_id: &JobId) -> usize {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map_or(0, |s| s.input.len())
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            field_requests: self.counters.field_requests.load(Ordering::Relaxed),
            bucket_updates: self.counters.bucket_updates.load(Ordering::Relaxed),
            record_updates: self.counters.record_updates.load(Ordering::Relaxed),
            influencer_updates: self.counters.influencer_updates.load(Ordering::Relaxed),
            index_refreshes: self.counters.index_refreshes.load(Ordering::Relaxed),
        }
    }

    async fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut JobDetails) -> T,
    ) -> StorageResult<T> {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(job_id)
            .and_then(|s| s.details.as_mut())
            .map(f)
            .ok_or_else(|| StorageError::UnknownJob(job_id.clone()))
    }
}

fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
        .filter(|v| !v.is_null())
}

#[async_trait]
impl JobProvider for InMemoryJobProvider {
    async fn job_details(&self, job_id: &JobId) -> StorageResult<Option<JobDetails>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(job_id).and_then(|s| s.details.clone()))
    }

    async fn get_field(
        &self,
        job_id: &JobId,
        path: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        self.counters.field_requests.fetch_add(1, Ordering::Relaxed);
        let details = self
            .job_details(job_id)
            .await?
            .ok_or_else(|| StorageError::UnknownJob(job_id.clone()))?;
        let value = serde_json::to_value(&details)?;
        Ok(lookup_path(&value, path).cloned())
    }

    async fn set_job_status(&self, job_id: &JobId, status: JobStatus) -> StorageResult<()> {
        debug!(job_id = %job_id, status = %status, "Setting job status");
        self.with_job(job_id, |job| job.status = status).await
    }

    async fn set_job_finished_time_and_status(
        &self,
        job_id: &JobId,
        finished_time: DateTime<Utc>,
        status: JobStatus,
    ) -> StorageResult<()> {
        self.with_job(job_id, |job| {
            job.status = status;
            job.finished_time = Some(finished_time);
        })
        .await
    }

    async fn latest_quantiles(&self, job_id: &JobId) -> StorageResult<Option<Quantiles>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(job_id).and_then(|s| s.quantiles.clone()))
    }

    async fn latest_model_snapshot(
        &self,
        job_id: &JobId,
    ) -> StorageResult<Option<ModelSnapshot>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(job_id).and_then(|s| {
            s.snapshots
                .iter()
                .max_by_key(|snap| (snap.restore_priority, snap.timestamp))
                .cloned()
        }))
    }

    async fn buckets(
        &self,
        job_id: &JobId,
        query: &BucketQuery,
    ) -> StorageResult<QueryPage<Bucket>> {
        let jobs = self.jobs.read().await;
        let Some(store) = jobs.get(job_id) else {
            return Ok(QueryPage::empty());
        };

        let matching: Vec<&Bucket> = store
            .buckets
            .values()
            .filter(|b| b.timestamp < query.end)
            .filter(|b| query.include_interim || !b.is_interim)
            .collect();
        let hit_count = matching.len() as u64;
        let documents = matching
            .into_iter()
            .skip(query.skip)
            .take(query.take)
            .map(|b| {
                let mut bucket = b.clone();
                if query.expand {
                    bucket.records = store.records.get(&b.id).cloned().unwrap_or_default();
                }
                bucket
            })
            .collect();
        Ok(QueryPage::new(documents, hit_count))
    }

    async fn expand_bucket(&self, job_id: &JobId, bucket: &mut Bucket) -> StorageResult<usize> {
        let jobs = self.jobs.read().await;
        bucket.records = jobs
            .get(job_id)
            .and_then(|s| s.records.get(&bucket.id))
            .cloned()
            .unwrap_or_default();
        Ok(bucket.records.len())
    }

    async fn influencers(
        &self,
        job_id: &JobId,
        query: &InfluencerQuery,
    ) -> StorageResult<QueryPage<Influencer>> {
        let jobs = self.jobs.read().await;
        let Some(store) = jobs.get(job_id) else {
            return Ok(QueryPage::empty());
        };

        let matching: Vec<&Influencer> = store
            .influencers
            .values()
            .filter(|i| i.timestamp < query.end)
            .filter(|i| query.include_interim || !i.is_interim)
            .collect();
        let hit_count = matching.len() as u64;
        let documents = matching
            .into_iter()
            .skip(query.skip)
            .take(query.take)
            .cloned()
            .collect();
        Ok(QueryPage::new(documents, hit_count))
    }

    async fn update_bucket(
        &self,
        job_id: &JobId,
        bucket_id: &str,
        anomaly_score: f64,
        max_normalized_probability: f64,
    ) -> StorageResult<()> {
        self.counters.bucket_updates.fetch_add(1, Ordering::Relaxed);
        let mut jobs = self.jobs.write().await;
        let bucket = jobs
            .get_mut(job_id)
            .and_then(|s| s.buckets.values_mut().find(|b| b.id == bucket_id))
            .ok_or_else(|| StorageError::NotFound(format!("bucket {bucket_id}")))?;
        bucket.anomaly_score = anomaly_score;
        bucket.max_normalized_probability = max_normalized_probability;
        Ok(())
    }

    async fn update_records(
        &self,
        job_id: &JobId,
        bucket_id: &str,
        records: &[AnomalyRecord],
    ) -> StorageResult<()> {
        self.counters
            .record_updates
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs
            .get_mut(job_id)
            .and_then(|s| s.records.get_mut(bucket_id))
        else {
            return Err(StorageError::NotFound(format!("records of bucket {bucket_id}")));
        };

        for update in records {
            match stored.iter_mut().find(|r| r.id.is_some() && r.id == update.id) {
                Some(record) => {
                    record.anomaly_score = update.anomaly_score;
                    record.normalized_probability = update.normalized_probability;
                }
                None => warn!(job_id = %job_id, bucket_id, "Cannot update unknown record"),
            }
        }
        Ok(())
    }

    async fn update_influencer(
        &self,
        job_id: &JobId,
        influencer: &Influencer,
    ) -> StorageResult<()> {
        self.counters
            .influencer_updates
            .fetch_add(1, Ordering::Relaxed);
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(job_id)
            .and_then(|s| s.influencers.values_mut().find(|i| i.id == influencer.id))
            .ok_or_else(|| StorageError::NotFound(format!("influencer {}", influencer.id)))?;
        stored.anomaly_score = influencer.anomaly_score;
        Ok(())
    }

    async fn refresh_index(&self, _job_id: &JobId) -> StorageResult<()> {
        self.counters.index_refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_persisted_input(&self, job_id: &JobId) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(store) = jobs.get_mut(job_id) {
            store.input.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl ResultsPersister for InMemoryJobProvider {
    async fn persist_bucket(&self, job_id: &JobId, mut bucket: Bucket) -> StorageResult<()> {
        if bucket.id.is_empty() {
            bucket.id = bucket.timestamp.timestamp_millis().to_string();
        }
        let mut records = std::mem::take(&mut bucket.records);
        for (index, record) in records.iter_mut().enumerate() {
            if record.id.is_none() {
                record.id = Some(format!("{}_{}", bucket.id, index));
            }
        }

        let mut jobs = self.jobs.write().await;
        let store = jobs.entry(job_id.clone()).or_default();
        // A final bucket replaces the interim one for the same time
        store
            .buckets
            .retain(|(ts, _), existing| !(*ts == bucket.timestamp && existing.is_interim));
        store.records.insert(bucket.id.clone(), records);
        store
            .buckets
            .insert((bucket.timestamp, bucket.id.clone()), bucket);
        Ok(())
    }

    async fn persist_influencer(
        &self,
        job_id: &JobId,
        mut influencer: Influencer,
    ) -> StorageResult<()> {
        if influencer.id.is_empty() {
            influencer.id = format!(
                "{}_{}_{}",
                influencer.timestamp.timestamp_millis(),
                influencer.influencer_field_name,
                influencer.influencer_field_value
            );
        }
        let mut jobs = self.jobs.write().await;
        let store = jobs.entry(job_id.clone()).or_default();
        store
            .influencers
            .insert((influencer.timestamp, influencer.id.clone()), influencer);
        Ok(())
    }

    async fn persist_quantiles(&self, job_id: &JobId, quantiles: &Quantiles) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.clone()).or_default().quantiles = Some(quantiles.clone());
        Ok(())
    }

    async fn persist_model_snapshot(
        &self,
        job_id: &JobId,
        snapshot: &ModelSnapshot,
    ) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        let store = jobs.entry(job_id.clone()).or_default();
        store.snapshots.retain(|s| s.snapshot_id != snapshot.snapshot_id);
        store.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn persist_data_counts(&self, job_id: &JobId, counts: &DataCounts) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.clone()).or_default().data_counts = counts.clone();
        Ok(())
    }

    async fn persist_input(
        &self,
        job_id: &JobId,
        epoch: i64,
        fields: Vec<(String, String)>,
    ) -> StorageResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.clone())
            .or_default()
            .input
            .push((epoch, fields));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engine_types::{AnalysisConfig, DataDescription, Detector};

    fn job() -> JobDetails {
        let config = AnalysisConfig {
            bucket_span: Some(3600),
            detectors: vec![Detector::function("count")],
            ..Default::default()
        };
        JobDetails::new("foo", config, DataDescription::default())
    }

    fn bucket_at(secs: i64, raw: f64) -> Bucket {
        let mut bucket = Bucket::new(Utc.timestamp_opt(secs, 0).unwrap(), 3600);
        bucket.raw_anomaly_score = raw;
        bucket
    }

    #[tokio::test]
    async fn test_get_field_walks_path() {
        let storage = InMemoryJobProvider::new();
        storage.put_job(job()).await;
        let id = JobId::new("foo");

        let span = storage.get_field(&id, "analysisConfig.bucketSpan").await.unwrap();
        assert_eq!(span, Some(serde_json::json!(3600)));
        assert!(storage
            .get_field(&id, "analysisConfig.latency")
            .await
            .unwrap()
            .is_none());
        assert_eq!(storage.stats().field_requests, 2);
    }

    #[tokio::test]
    async fn test_get_field_unknown_job() {
        let storage = InMemoryJobProvider::new();
        let result = storage.get_field(&JobId::new("nope"), "timeout").await;
        assert!(matches!(result, Err(StorageError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_status_updates() {
        let storage = InMemoryJobProvider::new();
        storage.put_job(job()).await;
        let id = JobId::new("foo");

        storage.set_job_status(&id, JobStatus::Running).await.unwrap();
        let now = Utc::now();
        storage
            .set_job_finished_time_and_status(&id, now, JobStatus::Closed)
            .await
            .unwrap();

        let details = storage.job_details(&id).await.unwrap().unwrap();
        assert_eq!(details.status, JobStatus::Closed);
        assert_eq!(details.finished_time, Some(now));
    }

    #[tokio::test]
    async fn test_bucket_paging_is_time_ordered_and_bounded() {
        let storage = InMemoryJobProvider::new();
        let id = JobId::new("foo");
        for secs in [7200, 0, 3600, 10800] {
            storage.persist_bucket(&id, bucket_at(secs, 1.0)).await.unwrap();
        }

        let end = Utc.timestamp_opt(10800, 0).unwrap();
        let page = storage
            .buckets(&id, &BucketQuery::page(1, 10, end))
            .await
            .unwrap();
        assert_eq!(page.hit_count, 3);
        let times: Vec<i64> = page.documents.iter().map(|b| b.timestamp.timestamp()).collect();
        assert_eq!(times, vec![3600, 7200]);
    }

    #[tokio::test]
    async fn test_records_stored_apart_and_updated() {
        let storage = InMemoryJobProvider::new();
        let id = JobId::new("foo");
        let mut bucket = bucket_at(0, 1.0);
        bucket.records.push(AnomalyRecord {
            probability: 0.01,
            normalized_probability: 10.0,
            ..Default::default()
        });
        storage.persist_bucket(&id, bucket).await.unwrap();

        let mut stored = storage
            .buckets(&id, &BucketQuery::page(0, 10, Utc::now()))
            .await
            .unwrap()
            .documents
            .remove(0);
        assert!(stored.records.is_empty());
        assert_eq!(storage.expand_bucket(&id, &mut stored).await.unwrap(), 1);

        let mut record = stored.records[0].clone();
        record.normalized_probability = 55.0;
        storage
            .update_records(&id, &stored.id, &[record])
            .await
            .unwrap();
        let reloaded = storage.bucket(&id, &stored.id).await.unwrap();
        assert_eq!(reloaded.records[0].normalized_probability, 55.0);
        assert_eq!(storage.stats().record_updates, 1);
    }

    #[tokio::test]
    async fn test_final_bucket_replaces_interim() {
        let storage = InMemoryJobProvider::new();
        let id = JobId::new("foo");
        let mut interim = bucket_at(0, 1.0);
        interim.id = "interim".to_string();
        interim.is_interim = true;
        storage.persist_bucket(&id, interim).await.unwrap();
        storage.persist_bucket(&id, bucket_at(0, 2.0)).await.unwrap();

        let mut query = BucketQuery::page(0, 10, Utc::now());
        query.include_interim = true;
        let page = storage.buckets(&id, &query).await.unwrap();
        assert_eq!(page.hit_count, 1);
        assert!(!page.documents[0].is_interim);
    }

    #[tokio::test]
    async fn test_latest_model_snapshot_by_priority() {
        let storage = InMemoryJobProvider::new();
        let id = JobId::new("foo");
        for (snapshot_id, priority) in [("a", 1), ("b", 3), ("c", 2)] {
            let snapshot = ModelSnapshot {
                snapshot_id: snapshot_id.to_string(),
                timestamp: None,
                description: None,
                restore_priority: priority,
                snapshot_doc_count: 1,
            };
            storage.persist_model_snapshot(&id, &snapshot).await.unwrap();
        }
        let latest = storage.latest_model_snapshot(&id).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, "b");
    }
}
