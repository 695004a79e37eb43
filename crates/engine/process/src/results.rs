//! Parser for the native process result stream
//!
//! Each result is a framed record `[kind, payload]`. Buckets, influencers,
//! quantiles and model snapshots carry JSON; flush acknowledgements carry the
//! echoed flush id.

use crate::alerts::AlertObservers;
use crate::flush::FlushListener;
use crate::framing::FramedRecordReader;
use crate::native::ProcessOutput;
use crate::renormaliser::Renormaliser;
use engine_storage::ResultsPersister;
use engine_types::{Bucket, Influencer, JobId, ModelSnapshot, Quantiles};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

pub const BUCKET: &str = "bucket";
pub const INFLUENCER: &str = "influencer";
pub const QUANTILES: &str = "quantiles";
pub const MODEL_SNAPSHOT: &str = "modelSnapshot";
pub const FLUSH: &str = "flush";

/// What one parser saw over the life of its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseSummary {
    pub buckets: u64,
    pub influencers: u64,
    pub quantiles: u64,
    pub model_snapshots: u64,
    pub flushes: u64,
    pub skipped: u64,
}

/// Consumes the result stream of one native process
pub struct ResultsParser {
    job_id: JobId,
    persister: Arc<dyn ResultsPersister>,
    flush_listener: Arc<FlushListener>,
    renormaliser: Arc<dyn Renormaliser>,
    alerts: Arc<AlertObservers>,
}

impl ResultsParser {
    pub fn new(
        job_id: JobId,
        persister: Arc<dyn ResultsPersister>,
        flush_listener: Arc<FlushListener>,
        renormaliser: Arc<dyn Renormaliser>,
        alerts: Arc<AlertObservers>,
    ) -> Self {
        Self {
            job_id,
            persister,
            flush_listener,
            renormaliser,
            alerts,
        }
    }

    /// Run until the stream ends
    ///
    /// On exit, flush waiters are released, alert observers dropped and the
    /// renormaliser shut down.
    pub fn spawn(self, output: ProcessOutput, span: Span) -> JoinHandle<ParseSummary> {
        tokio::spawn(self.run(output).instrument(span))
    }

    async fn run(self, output: ProcessOutput) -> ParseSummary {
        let mut reader = FramedRecordReader::new(output);
        let mut summary = ParseSummary::default();

        loop {
            match reader.read_record().await {
                Ok(Some(record)) => self.handle_record(record, &mut summary).await,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Error reading results from native process");
                    break;
                }
            }
        }

        info!(
            buckets = summary.buckets,
            influencers = summary.influencers,
            flushes = summary.flushes,
            "Result stream ended"
        );
        self.flush_listener.clear();
        self.alerts.clear();
        self.renormaliser.shutdown().await;
        summary
    }

    async fn handle_record(&self, record: Vec<String>, summary: &mut ParseSummary) {
        let [kind, payload] = match <[String; 2]>::try_from(record) {
            Ok(pair) => pair,
            Err(record) => {
                warn!(fields = record.len(), "Ignoring result record of unexpected width");
                summary.skipped += 1;
                return;
            }
        };

        match kind.as_str() {
            BUCKET => {
                let Some(bucket) = self.decode::<Bucket>(&kind, &payload, summary) else {
                    return;
                };
                self.alerts.fire(&self.job_id, &bucket);
                if let Err(e) = self.persister.persist_bucket(&self.job_id, bucket).await {
                    error!(error = %e, "Failed to persist bucket");
                }
                summary.buckets += 1;
            }
            INFLUENCER => {
                let Some(influencer) = self.decode::<Influencer>(&kind, &payload, summary) else {
                    return;
                };
                if let Err(e) = self
                    .persister
                    .persist_influencer(&self.job_id, influencer)
                    .await
                {
                    error!(error = %e, "Failed to persist influencer");
                }
                summary.influencers += 1;
            }
            QUANTILES => {
                let Some(quantiles) = self.decode::<Quantiles>(&kind, &payload, summary) else {
                    return;
                };
                if let Err(e) = self
                    .persister
                    .persist_quantiles(&self.job_id, &quantiles)
                    .await
                {
                    error!(error = %e, "Failed to persist quantiles");
                }
                summary.quantiles += 1;
                self.renormaliser.renormalise(quantiles).await;
            }
            MODEL_SNAPSHOT => {
                let Some(snapshot) = self.decode::<ModelSnapshot>(&kind, &payload, summary) else {
                    return;
                };
                if let Err(e) = self
                    .persister
                    .persist_model_snapshot(&self.job_id, &snapshot)
                    .await
                {
                    error!(error = %e, "Failed to persist model snapshot");
                }
                summary.model_snapshots += 1;
            }
            FLUSH => {
                debug!(flush_id = %payload, "Flush acknowledged");
                self.flush_listener.acknowledge(&payload);
                summary.flushes += 1;
            }
            other => {
                warn!(kind = other, "Ignoring unknown result kind");
                summary.skipped += 1;
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        kind: &str,
        payload: &str,
        summary: &mut ParseSummary,
    ) -> Option<T> {
        match serde_json::from_str(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(kind, error = %e, "Ignoring malformed result");
                summary.skipped += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertTrigger;
    use crate::flush::FlushOutcome;
    use crate::framing::FramedRecordWriter;
    use async_trait::async_trait;
    use engine_storage::{InMemoryJobProvider, JobProvider};
    use engine_types::{BucketQuery, JobId};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRenormaliser {
        quantiles: Mutex<Vec<String>>,
        shut_down: Mutex<bool>,
    }

    #[async_trait]
    impl Renormaliser for RecordingRenormaliser {
        async fn renormalise(&self, quantiles: Quantiles) {
            self.quantiles.lock().push(quantiles.quantile_state);
        }

        async fn wait_until_idle(&self) {}

        async fn shutdown(&self) {
            *self.shut_down.lock() = true;
        }
    }

    #[tokio::test]
    async fn test_results_dispatched_by_kind() {
        let job_id = JobId::new("foo");
        let storage = Arc::new(InMemoryJobProvider::new());
        let flush_listener = Arc::new(FlushListener::new());
        let renormaliser = Arc::new(RecordingRenormaliser::default());
        let alerts = Arc::new(AlertObservers::new());
        let mut alert = alerts.register(AlertTrigger {
            anomaly_score: Some(10.0),
            normalized_probability: None,
        });

        let parser = ResultsParser::new(
            job_id.clone(),
            storage.clone(),
            flush_listener.clone(),
            renormaliser.clone(),
            alerts.clone(),
        );
        let (process_side, engine_side) = tokio::io::duplex(4096);
        let task = parser.spawn(Box::new(engine_side), Span::none());

        let mut out = FramedRecordWriter::new(process_side);
        let bucket = r#"{"timestamp": 3600000, "anomalyScore": 42.0, "rawAnomalyScore": 1.5}"#;
        out.write_record(&[BUCKET, bucket]).await.unwrap();
        out.write_record(&[QUANTILES, r#"{"quantileState": "q1", "timestamp": 3600000}"#])
            .await
            .unwrap();
        out.write_record(&[BUCKET, "{not json"]).await.unwrap();
        out.write_record(&["mystery", "{}"]).await.unwrap();
        out.write_record(&[FLUSH, "5"]).await.unwrap();
        out.shutdown().await.unwrap();
        drop(out);

        let summary = task.await.unwrap();
        assert_eq!(summary.buckets, 1);
        assert_eq!(summary.quantiles, 1);
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.skipped, 2);

        assert_eq!(*renormaliser.quantiles.lock(), vec!["q1".to_string()]);
        assert!(*renormaliser.shut_down.lock());
        assert_eq!(alert.try_recv().unwrap().anomaly_score, 42.0);
        assert_eq!(
            flush_listener
                .wait_for_flush("5", Duration::from_millis(10))
                .await,
            FlushOutcome::Acknowledged
        );

        let page = storage
            .buckets(&job_id, &BucketQuery::page(0, 10, chrono::Utc::now()))
            .await
            .unwrap();
        assert_eq!(page.hit_count, 1);
        assert_eq!(
            storage.latest_quantiles(&job_id).await.unwrap().unwrap().quantile_state,
            "q1"
        );
    }

    #[tokio::test]
    async fn test_truncated_stream_clears_flush_waiters() {
        let parser = ResultsParser::new(
            JobId::new("foo"),
            Arc::new(InMemoryJobProvider::new()),
            Arc::new(FlushListener::new()),
            Arc::new(RecordingRenormaliser::default()),
            Arc::new(AlertObservers::new()),
        );
        let listener = parser.flush_listener.clone();
        let bytes: &'static [u8] = &[0, 0, 0, 2, 0, 0];
        let summary = parser.spawn(Box::new(bytes), Span::none()).await.unwrap();

        assert_eq!(summary, ParseSummary::default());
        assert_eq!(
            listener.wait_for_flush("1", Duration::from_secs(1)).await,
            FlushOutcome::Cleared
        );
    }
}
