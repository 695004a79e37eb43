//! Rescoring pass over a job's persisted results
//!
//! Buckets are read page by page up to the end of the window, rescored in
//! batches and written back only where the score moved enough to matter.
//! Influencers follow the same path afterwards.

use crate::normalisable::Normalisable;
use crate::normalizer::Normalizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_process::{ProcessError, ProcessResult};
use engine_storage::JobProvider;
use engine_types::{Bucket, BucketQuery, InfluencerQuery, JobId};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Job field holding the bucket span in seconds
pub const BUCKET_SPAN_FIELD: &str = "analysisConfig.bucketSpan";

/// Buckets requested per page
pub const MAX_BUCKETS_PER_PAGE: usize = 10_000;

/// Influencers requested per page
pub const MAX_INFLUENCERS_PER_PAGE: usize = 1_000_000;

/// Records after which a bucket batch is cut short
pub const MAX_RECORDS_PER_BATCH: usize = 100_000;

/// One rescoring pass with a new normalisation baseline.
#[async_trait]
pub trait Rescorer: Send + Sync {
    /// Rescore everything before `end` against `quantiles_state`.
    ///
    /// `window_span_ms` is how far apart the coalesced requests were.
    async fn rescore(
        &self,
        quantiles_state: &str,
        end: DateTime<Utc>,
        window_span_ms: i64,
    ) -> ProcessResult<()>;

    /// Make the rewritten results visible to searches
    async fn refresh_index(&self) -> ProcessResult<()>;
}

/// Page sizes used by a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub buckets_per_page: usize,
    pub influencers_per_page: usize,
    /// Expanded records after which the rest of a bucket page is deferred
    pub records_per_batch: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            buckets_per_page: MAX_BUCKETS_PER_PAGE,
            influencers_per_page: MAX_INFLUENCERS_PER_PAGE,
            records_per_batch: MAX_RECORDS_PER_BATCH,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct UpdateCounts {
    updates: usize,
    no_ops: usize,
}

/// Rescoring pass backed by the job provider and the normalize process
pub struct ScoreUpdater {
    job_id: JobId,
    provider: Arc<dyn JobProvider>,
    normalizer: Normalizer,
    limits: PageLimits,
    bucket_span: OnceCell<Option<u64>>,
}

impl ScoreUpdater {
    pub fn new(provider: Arc<dyn JobProvider>, normalizer: Normalizer) -> Self {
        Self {
            job_id: normalizer.job_id().clone(),
            provider,
            normalizer,
            limits: PageLimits::default(),
            bucket_span: OnceCell::new(),
        }
    }

    pub fn with_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Bucket span of the job, looked up once
    async fn bucket_span(&self) -> ProcessResult<Option<u64>> {
        self.bucket_span
            .get_or_try_init(|| async {
                let span = self
                    .provider
                    .get_field(&self.job_id, BUCKET_SPAN_FIELD)
                    .await?
                    .and_then(|value| value.as_u64());
                if let Some(span) = span {
                    info!(job_id = %self.job_id, bucket_span = span, "Caching bucket span");
                }
                Ok::<_, ProcessError>(span)
            })
            .await
            .copied()
    }

    async fn update_buckets(
        &self,
        quantiles_state: &str,
        end: DateTime<Utc>,
        counts: &mut UpdateCounts,
    ) -> ProcessResult<()> {
        let mut skip = 0;
        loop {
            let query = BucketQuery::page(skip, self.limits.buckets_per_page, end);
            let page = self.provider.buckets(&self.job_id, &query).await?;
            if page.documents.is_empty() {
                break;
            }

            let mut batch = Vec::new();
            let mut records = 0;
            let mut taken = 0;
            for mut bucket in page.documents {
                // The rest of the page goes to the next batch
                if records >= self.limits.records_per_batch {
                    break;
                }
                taken += 1;
                if !bucket.is_normalisable() {
                    continue;
                }
                records += self.provider.expand_bucket(&self.job_id, &mut bucket).await?;
                batch.push(bucket);
            }
            skip += taken;

            if !batch.is_empty() {
                debug!(
                    job_id = %self.job_id,
                    buckets = batch.len(),
                    records,
                    "Normalising bucket batch"
                );
                self.normalise_buckets(quantiles_state, &mut batch).await?;
                for bucket in &batch {
                    self.persist_bucket(bucket, counts).await?;
                }
            }

            if skip as u64 >= page.hit_count {
                break;
            }
        }
        Ok(())
    }

    async fn normalise_buckets(
        &self,
        quantiles_state: &str,
        batch: &mut [Bucket],
    ) -> ProcessResult<()> {
        let bucket_span = self.bucket_span().await?;
        let mut roots: Vec<Normalisable<'_>> =
            batch.iter_mut().map(Normalisable::Bucket).collect();
        self.normalizer
            .normalise(bucket_span, &mut roots, quantiles_state)
            .await
    }

    async fn persist_bucket(
        &self,
        bucket: &Bucket,
        counts: &mut UpdateCounts,
    ) -> ProcessResult<()> {
        if bucket.id.is_empty() {
            warn!(job_id = %self.job_id, "Failed to renormalise bucket - no id");
            counts.no_ops += 1;
        } else if bucket.had_big_normalized_update {
            self.provider
                .update_bucket(
                    &self.job_id,
                    &bucket.id,
                    bucket.anomaly_score,
                    bucket.max_normalized_probability,
                )
                .await?;
            counts.updates += 1;
        } else {
            counts.no_ops += 1;
        }

        let mut to_update = Vec::new();
        for record in &bucket.records {
            if record.id.is_none() {
                warn!(
                    job_id = %self.job_id,
                    bucket_id = %bucket.id,
                    "Failed to renormalise record - no id"
                );
                counts.no_ops += 1;
            } else if record.had_big_normalized_update {
                to_update.push(record.clone());
                counts.updates += 1;
            } else {
                counts.no_ops += 1;
            }
        }
        if !to_update.is_empty() {
            self.provider
                .update_records(&self.job_id, &bucket.id, &to_update)
                .await?;
        }
        Ok(())
    }

    async fn update_influencers(
        &self,
        quantiles_state: &str,
        end: DateTime<Utc>,
        counts: &mut UpdateCounts,
    ) -> ProcessResult<()> {
        let mut skip = 0;
        loop {
            let query = InfluencerQuery::page(skip, self.limits.influencers_per_page, end);
            let page = self.provider.influencers(&self.job_id, &query).await?;
            if page.documents.is_empty() {
                break;
            }
            skip += page.documents.len();

            let mut influencers = page.documents;
            let bucket_span = self.bucket_span().await?;
            {
                let mut roots: Vec<Normalisable<'_>> =
                    influencers.iter_mut().map(Normalisable::Influencer).collect();
                self.normalizer
                    .normalise(bucket_span, &mut roots, quantiles_state)
                    .await?;
            }

            for influencer in &influencers {
                if influencer.id.is_empty() {
                    warn!(job_id = %self.job_id, "Failed to renormalise influencer - no id");
                    counts.no_ops += 1;
                } else if influencer.had_big_normalized_update {
                    self.provider
                        .update_influencer(&self.job_id, influencer)
                        .await?;
                    counts.updates += 1;
                } else {
                    counts.no_ops += 1;
                }
            }

            if skip as u64 >= page.hit_count {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Rescorer for ScoreUpdater {
    async fn rescore(
        &self,
        quantiles_state: &str,
        end: DateTime<Utc>,
        window_span_ms: i64,
    ) -> ProcessResult<()> {
        debug!(
            job_id = %self.job_id,
            end = %end,
            window_span_ms,
            "Renormalising results"
        );
        let mut counts = UpdateCounts::default();
        self.update_buckets(quantiles_state, end, &mut counts).await?;
        self.update_influencers(quantiles_state, end, &mut counts)
            .await?;
        info!(
            job_id = %self.job_id,
            updates = counts.updates,
            no_ops = counts.no_ops,
            "Normalisation pass complete"
        );
        Ok(())
    }

    async fn refresh_index(&self) -> ProcessResult<()> {
        self.provider.refresh_index(&self.job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engine_process::testing::{normalize_with, ScriptedProcess, ScriptedProcessFactory};
    use engine_storage::{InMemoryJobProvider, ResultsPersister};
    use engine_types::{
        AnalysisConfig, AnomalyRecord, BucketInfluencer, DataDescription, Detector, Influencer,
        JobDetails, BUCKET_TIME_INFLUENCER,
    };
    use tracing::Span;

    const HOUR: i64 = 3600;

    async fn provider() -> Arc<InMemoryJobProvider> {
        let provider = Arc::new(InMemoryJobProvider::new());
        let config = AnalysisConfig {
            bucket_span: Some(3600),
            detectors: vec![Detector::function("count")],
            ..Default::default()
        };
        provider
            .put_job(JobDetails::new("foo", config, DataDescription::default()))
            .await;
        provider
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bucket(secs: i64, score: f64, records: usize) -> Bucket {
        let mut bucket = Bucket::new(at(secs), 3600);
        bucket.anomaly_score = score;
        bucket.raw_anomaly_score = if score > 0.0 { 0.1 } else { 0.0 };
        bucket.record_count = records as u32;
        bucket.bucket_influencers = vec![BucketInfluencer {
            influencer_field_name: BUCKET_TIME_INFLUENCER.to_string(),
            anomaly_score: score,
            ..Default::default()
        }];
        bucket.records = (0..records)
            .map(|_| AnomalyRecord {
                normalized_probability: score,
                ..Default::default()
            })
            .collect();
        bucket.max_normalized_probability = if records > 0 { score } else { 0.0 };
        bucket
    }

    fn updater(
        provider: Arc<InMemoryJobProvider>,
        factory: Arc<ScriptedProcessFactory>,
    ) -> ScoreUpdater {
        let normalizer = Normalizer::new(JobId::new("foo"), factory, Span::none());
        ScoreUpdater::new(provider, normalizer)
    }

    fn scoring(score: f64) -> Arc<ScriptedProcessFactory> {
        Arc::new(
            ScriptedProcessFactory::new()
                .with_normalize(move || ScriptedProcess::new(normalize_with(move |_| score))),
        )
    }

    #[tokio::test]
    async fn test_nothing_selected_never_asks_for_bucket_span() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        provider.persist_bucket(&job_id, bucket(0, 0.0, 0)).await.unwrap();

        let factory = scoring(50.0);
        let updater = updater(provider.clone(), factory.clone());
        updater.rescore("state", at(HOUR), 0).await.unwrap();

        assert_eq!(provider.stats().field_requests, 0);
        assert!(factory.normaliser_launches().is_empty());
        assert_eq!(provider.stats().bucket_updates, 0);
    }

    #[tokio::test]
    async fn test_unchanged_scores_are_not_written() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        provider.persist_bucket(&job_id, bucket(0, 50.0, 2)).await.unwrap();

        let factory = scoring(50.0);
        let updater = updater(provider.clone(), factory.clone());
        updater.rescore("state", at(HOUR), 0).await.unwrap();

        let stats = provider.stats();
        assert_eq!(stats.bucket_updates, 0);
        assert_eq!(stats.record_updates, 0);
        assert_eq!(stats.field_requests, 1);
        assert_eq!(factory.normaliser_launches()[0].bucket_span, Some(3600));
    }

    #[tokio::test]
    async fn test_big_changes_are_written() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        provider.persist_bucket(&job_id, bucket(0, 10.0, 2)).await.unwrap();

        let updater = updater(provider.clone(), scoring(80.0));
        updater.rescore("state", at(HOUR), 0).await.unwrap();

        let stats = provider.stats();
        assert_eq!(stats.bucket_updates, 1);
        assert_eq!(stats.record_updates, 2);

        let stored = provider.bucket(&job_id, "0").await.unwrap();
        assert_eq!(stored.anomaly_score, 80.0);
        assert_eq!(stored.max_normalized_probability, 80.0);
        assert!(stored.records.iter().all(|r| r.normalized_probability == 80.0));
        assert!(stored.records.iter().all(|r| r.anomaly_score == 80.0));
    }

    #[tokio::test]
    async fn test_window_end_bounds_the_pass() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        provider.persist_bucket(&job_id, bucket(0, 10.0, 0)).await.unwrap();
        provider
            .persist_bucket(&job_id, bucket(2 * HOUR, 10.0, 0))
            .await
            .unwrap();

        let updater = updater(provider.clone(), scoring(80.0));
        updater.rescore("state", at(HOUR), 0).await.unwrap();

        assert_eq!(provider.stats().bucket_updates, 1);
        let later = provider
            .bucket(&job_id, &(2 * HOUR * 1000).to_string())
            .await
            .unwrap();
        assert_eq!(later.anomaly_score, 10.0);
    }

    #[tokio::test]
    async fn test_bucket_span_requested_once() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        for hour in 0..3 {
            provider
                .persist_bucket(&job_id, bucket(hour * HOUR, 10.0, 1))
                .await
                .unwrap();
        }
        let influencer = Influencer {
            id: String::new(),
            timestamp: at(0),
            influencer_field_name: "airline".to_string(),
            influencer_field_value: "AAL".to_string(),
            probability: 0.01,
            initial_anomaly_score: 10.0,
            anomaly_score: 10.0,
            is_interim: false,
            had_big_normalized_update: false,
        };
        provider.persist_influencer(&job_id, influencer).await.unwrap();

        let factory = scoring(80.0);
        let updater = updater(provider.clone(), factory.clone());
        updater.rescore("state", at(10 * HOUR), 0).await.unwrap();
        updater.rescore("state", at(10 * HOUR), 0).await.unwrap();

        let stats = provider.stats();
        assert_eq!(stats.field_requests, 1);
        assert_eq!(stats.influencer_updates, 1);
        assert_eq!(factory.normaliser_launches().len(), 4);

        let stored = provider.influencer(&job_id, "0_airline_AAL").await.unwrap();
        assert_eq!(stored.anomaly_score, 80.0);
    }

    #[tokio::test]
    async fn test_record_cap_defers_rest_of_page() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        for hour in 0..5 {
            provider
                .persist_bucket(&job_id, bucket(hour * HOUR, 10.0, 2))
                .await
                .unwrap();
        }

        let factory = scoring(80.0);
        let updater = updater(provider.clone(), factory.clone()).with_limits(PageLimits {
            buckets_per_page: 10,
            records_per_batch: 3,
            ..Default::default()
        });
        updater.rescore("state", at(10 * HOUR), 0).await.unwrap();

        // Two buckets reach the cap, so five buckets take three batches
        assert_eq!(factory.normaliser_launches().len(), 3);
        let stats = provider.stats();
        assert_eq!(stats.bucket_updates, 5);
        assert_eq!(stats.record_updates, 10);
        for hour in 0..5 {
            let stored = provider
                .bucket(&job_id, &(hour * HOUR * 1000).to_string())
                .await
                .unwrap();
            assert_eq!(stored.anomaly_score, 80.0);
        }
    }

    #[tokio::test]
    async fn test_normalise_failure_propagates() {
        let provider = provider().await;
        let job_id = JobId::new("foo");
        provider.persist_bucket(&job_id, bucket(0, 10.0, 0)).await.unwrap();

        let factory = Arc::new(ScriptedProcessFactory::new());
        factory.fail_starts(true);
        let updater = updater(provider.clone(), factory);

        assert!(updater.rescore("state", at(HOUR), 0).await.is_err());
        assert_eq!(provider.stats().bucket_updates, 0);
    }
}
