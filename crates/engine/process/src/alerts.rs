//! One-shot alerts on anomalous buckets
//!
//! A caller registers a trigger and gets a receiver. The first bucket parsed
//! from the native process that meets the trigger fires it.

use chrono::{DateTime, Utc};
use engine_types::{Bucket, JobId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

/// Thresholds a bucket must reach to fire an alert
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlertTrigger {
    pub anomaly_score: Option<f64>,
    pub normalized_probability: Option<f64>,
}

impl AlertTrigger {
    pub fn is_triggered_by(&self, bucket: &Bucket) -> bool {
        self.anomaly_score
            .is_some_and(|threshold| bucket.anomaly_score >= threshold)
            || self
                .normalized_probability
                .is_some_and(|threshold| bucket.max_normalized_probability >= threshold)
    }
}

/// A fired alert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub anomaly_score: f64,
    pub max_normalized_probability: f64,
    pub is_interim: bool,
}

/// Registered triggers of one job
#[derive(Debug, Default)]
pub struct AlertObservers {
    observers: Mutex<Vec<(AlertTrigger, oneshot::Sender<Alert>)>>,
}

impl AlertObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, trigger: AlertTrigger) -> oneshot::Receiver<Alert> {
        let (tx, rx) = oneshot::channel();
        self.observers.lock().push((trigger, tx));
        rx
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every trigger met by `bucket`, forgetting abandoned ones
    pub fn fire(&self, job_id: &JobId, bucket: &Bucket) {
        let mut observers = self.observers.lock();
        if observers.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut *observers);
        for (trigger, tx) in pending {
            if tx.is_closed() {
                continue;
            }
            if trigger.is_triggered_by(bucket) {
                let _ = tx.send(Alert {
                    job_id: job_id.clone(),
                    timestamp: bucket.timestamp,
                    anomaly_score: bucket.anomaly_score,
                    max_normalized_probability: bucket.max_normalized_probability,
                    is_interim: bucket.is_interim,
                });
            } else {
                observers.push((trigger, tx));
            }
        }
    }

    /// Drop every trigger; receivers see the channel close
    pub fn clear(&self) {
        self.observers.lock().clear();
    }
}
