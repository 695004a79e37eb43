//! Upload counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters describing the data sent to a native process
///
/// Counts accumulate over the lifetime of a job; every upload returns the
/// totals so far.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCounts {
    pub bucket_count: u64,
    pub processed_record_count: u64,
    pub processed_field_count: u64,
    pub input_bytes: u64,
    pub input_record_count: u64,
    pub input_field_count: u64,
    pub invalid_date_count: u64,
    pub missing_field_count: u64,
    pub out_of_order_timestamp_count: u64,
    pub failed_transform_count: u64,
    pub excluded_record_count: u64,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub latest_record_timestamp: Option<DateTime<Utc>>,
}

impl DataCounts {
    /// Records that were read but never reached the process
    pub fn discarded_record_count(&self) -> u64 {
        self.invalid_date_count + self.out_of_order_timestamp_count + self.excluded_record_count
    }

    /// Percentage of input records with an unparseable timestamp
    pub fn invalid_date_percent(&self) -> u64 {
        percent(self.invalid_date_count, self.input_record_count)
    }

    /// Percentage of input records whose timestamp went backwards
    pub fn out_of_order_percent(&self) -> u64 {
        percent(self.out_of_order_timestamp_count, self.input_record_count)
    }
}

fn percent(part: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        part * 100 / total
    }
}
