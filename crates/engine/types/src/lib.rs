//! Engine Types - Core types for native job process orchestration
//!
//! These types are shared between the process orchestrator, the
//! renormalisation pipeline and the persistence layer.
//!
//! ## Key Concepts
//!
//! - **JobDetails**: Analysis configuration, data description and transforms
//!   for a single anomaly detection job
//! - **Bucket**: Fixed time-window aggregate of results, with its records,
//!   bucket influencers and partition scores
//! - **Quantiles**: Serialized baseline state used to seed rescoring
//! - **DataCounts**: Counters describing an upload to a native process

#![deny(unsafe_code)]

pub mod counts;
pub mod ids;
pub mod job;
pub mod params;
pub mod query;
pub mod results;

pub use counts::DataCounts;
pub use ids::JobId;
pub use job::{
    AnalysisConfig, AnalysisLimits, DataDescription, DataFormat, Detector, JobDetails,
    JobStatus, TimeParseError, TransformConfig, TransformType, DEFAULT_IDLE_TIMEOUT_SECS,
};
pub use params::{DataLoadParams, InterimResultsParams, TimeRange};
pub use query::{BucketQuery, InfluencerQuery, QueryPage};
pub use results::{
    AnomalyRecord, Bucket, BucketInfluencer, Influencer, ModelSnapshot, PartitionScore,
    Quantiles, BUCKET_TIME_INFLUENCER,
};
