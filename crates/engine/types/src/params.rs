//! Parameters for uploads and flushes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed epoch-second range used by reset and interim requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.start, self.end)
    }
}

/// Options for a single data upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLoadParams {
    /// Keep the raw input after it has been analysed
    #[serde(default)]
    pub persist: bool,

    /// Buckets to discard and recompute before this upload
    #[serde(default)]
    pub reset_buckets: Option<TimeRange>,
}

impl DataLoadParams {
    pub fn with_reset(range: TimeRange) -> Self {
        Self {
            persist: false,
            reset_buckets: Some(range),
        }
    }

    pub fn is_resettable_buckets(&self) -> bool {
        self.reset_buckets.is_some()
    }
}

/// Options for the interim results computed on flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterimResultsParams {
    #[serde(default)]
    pub calc_interim: bool,

    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl InterimResultsParams {
    pub fn calc_interim() -> Self {
        Self {
            calc_interim: true,
            time_range: None,
        }
    }

    pub fn for_range(range: TimeRange) -> Self {
        Self {
            calc_interim: true,
            time_range: Some(range),
        }
    }
}
