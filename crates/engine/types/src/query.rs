//! Paged storage queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a larger result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage<T> {
    pub documents: Vec<T>,

    /// Total matches across all pages
    pub hit_count: u64,
}

impl<T> QueryPage<T> {
    pub fn new(documents: Vec<T>, hit_count: u64) -> Self {
        Self {
            documents,
            hit_count,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }
}

/// Bucket page request ordered by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct BucketQuery {
    pub skip: usize,
    pub take: usize,

    /// Exclusive upper bound
    pub end: DateTime<Utc>,

    /// Embed records in the returned buckets
    pub expand: bool,

    pub include_interim: bool,
}

impl BucketQuery {
    pub fn page(skip: usize, take: usize, end: DateTime<Utc>) -> Self {
        Self {
            skip,
            take,
            end,
            expand: false,
            include_interim: false,
        }
    }
}

/// Influencer page request ordered by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct InfluencerQuery {
    pub skip: usize,
    pub take: usize,

    /// Exclusive upper bound
    pub end: DateTime<Utc>,

    pub include_interim: bool,
}

impl InfluencerQuery {
    pub fn page(skip: usize, take: usize, end: DateTime<Utc>) -> Self {
        Self {
            skip,
            take,
            end,
            include_interim: false,
        }
    }
}
