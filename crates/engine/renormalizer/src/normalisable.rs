//! Result entities viewed as a tree of rescorable nodes
//!
//! A [`Normalisable`] borrows one result entity mutably. Scores written
//! through it land directly in the entity, so no copy has to be merged back
//! after rescoring.

use engine_types::{
    AnomalyRecord, Bucket, BucketInfluencer, Influencer, PartitionScore, BUCKET_TIME_INFLUENCER,
};
use crate::normalizer::is_big_update;
use std::fmt;

/// Level names understood by the normalize process
pub mod level {
    pub const ROOT: &str = "root";
    pub const LEAF: &str = "leaf";
    pub const BUCKET_INFLUENCER: &str = "inflb";
    pub const INFLUENCER: &str = "infl";
    pub const PARTITION: &str = "part";
}

/// Kind of child group below a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    BucketInfluencer,
    Record,
    Partition,
}

impl fmt::Display for ChildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildType::BucketInfluencer => write!(f, "bucket_influencer"),
            ChildType::Record => write!(f, "record"),
            ChildType::Partition => write!(f, "partition"),
        }
    }
}

const BUCKET_CHILDREN: &[ChildType] = &[
    ChildType::BucketInfluencer,
    ChildType::Record,
    ChildType::Partition,
];

/// One rescorable result entity
#[derive(Debug)]
pub enum Normalisable<'a> {
    Bucket(&'a mut Bucket),
    Record(&'a mut AnomalyRecord),
    BucketInfluencer(&'a mut BucketInfluencer),
    Influencer(&'a mut Influencer),
    PartitionScore(&'a mut PartitionScore),
}

impl<'a> Normalisable<'a> {
    pub fn level(&self) -> &'static str {
        match self {
            Normalisable::Bucket(_) => level::ROOT,
            Normalisable::Record(_) => level::LEAF,
            Normalisable::BucketInfluencer(bi) => {
                if bi.influencer_field_name == BUCKET_TIME_INFLUENCER {
                    level::ROOT
                } else {
                    level::BUCKET_INFLUENCER
                }
            }
            Normalisable::Influencer(_) => level::INFLUENCER,
            Normalisable::PartitionScore(_) => level::PARTITION,
        }
    }

    pub fn partition_field_name(&self) -> Option<&str> {
        match self {
            Normalisable::Record(r) => r.partition_field_name.as_deref(),
            Normalisable::PartitionScore(p) => Some(&p.partition_field_name),
            _ => None,
        }
    }

    pub fn partition_field_value(&self) -> Option<&str> {
        match self {
            Normalisable::Record(r) => r.partition_field_value.as_deref(),
            Normalisable::PartitionScore(p) => Some(&p.partition_field_value),
            _ => None,
        }
    }

    pub fn person_field_name(&self) -> Option<&str> {
        match self {
            Normalisable::Record(r) => r.person_field_name(),
            Normalisable::BucketInfluencer(bi) => Some(&bi.influencer_field_name),
            Normalisable::Influencer(i) => Some(&i.influencer_field_name),
            _ => None,
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        match self {
            Normalisable::Record(r) => r.function.as_deref(),
            _ => None,
        }
    }

    pub fn value_field_name(&self) -> Option<&str> {
        match self {
            Normalisable::Record(r) => r.field_name.as_deref(),
            _ => None,
        }
    }

    pub fn probability(&self) -> f64 {
        match self {
            Normalisable::Bucket(_) => 0.0,
            Normalisable::Record(r) => r.probability,
            Normalisable::BucketInfluencer(bi) => bi.probability,
            Normalisable::Influencer(i) => i.probability,
            Normalisable::PartitionScore(p) => p.probability,
        }
    }

    /// The score the normalize process rewrites
    pub fn normalized_score(&self) -> f64 {
        match self {
            Normalisable::Bucket(b) => b.anomaly_score,
            Normalisable::Record(r) => r.normalized_probability,
            Normalisable::BucketInfluencer(bi) => bi.anomaly_score,
            Normalisable::Influencer(i) => i.anomaly_score,
            Normalisable::PartitionScore(p) => p.anomaly_score,
        }
    }

    pub fn set_normalized_score(&mut self, score: f64) {
        match self {
            Normalisable::Bucket(b) => b.anomaly_score = score,
            Normalisable::Record(r) => r.normalized_probability = score,
            Normalisable::BucketInfluencer(bi) => bi.anomaly_score = score,
            Normalisable::Influencer(i) => i.anomaly_score = score,
            Normalisable::PartitionScore(p) => p.anomaly_score = score,
        }
    }

    /// Copy the score of a parent that changed; only records keep it.
    pub fn set_parent_score(&mut self, score: f64) {
        if let Normalisable::Record(r) = self {
            r.anomaly_score = score;
        }
    }

    /// Container nodes are never sent to the normalize process.
    pub fn is_container_only(&self) -> bool {
        matches!(self, Normalisable::Bucket(_))
    }

    pub fn child_types(&self) -> &'static [ChildType] {
        match self {
            Normalisable::Bucket(_) => BUCKET_CHILDREN,
            _ => &[],
        }
    }

    /// Nodes of one child group, in stored order
    pub fn children(&mut self, child_type: ChildType) -> Vec<Normalisable<'_>> {
        let Normalisable::Bucket(bucket) = self else {
            return Vec::new();
        };
        match child_type {
            ChildType::BucketInfluencer => bucket
                .bucket_influencers
                .iter_mut()
                .map(Normalisable::BucketInfluencer)
                .collect(),
            ChildType::Record => bucket.records.iter_mut().map(Normalisable::Record).collect(),
            ChildType::Partition => bucket
                .partition_scores
                .iter_mut()
                .map(Normalisable::PartitionScore)
                .collect(),
        }
    }

    /// Fold the maximum score of a child group into this node.
    ///
    /// Returns whether the aggregate moved enough to count as a big update.
    pub fn set_max_children_score(&mut self, child_type: ChildType, max: f64) -> bool {
        let Normalisable::Bucket(bucket) = self else {
            return false;
        };
        let target = match child_type {
            ChildType::BucketInfluencer => &mut bucket.anomaly_score,
            ChildType::Record => &mut bucket.max_normalized_probability,
            ChildType::Partition => return false,
        };
        let changed = is_big_update(*target, max);
        *target = max;
        changed
    }

    pub fn had_big_update(&self) -> bool {
        *self.flag()
    }

    pub fn raise_big_update(&mut self) {
        *self.flag_mut() = true;
    }

    pub fn reset_big_update(&mut self) {
        *self.flag_mut() = false;
    }

    fn flag(&self) -> &bool {
        match self {
            Normalisable::Bucket(b) => &b.had_big_normalized_update,
            Normalisable::Record(r) => &r.had_big_normalized_update,
            Normalisable::BucketInfluencer(bi) => &bi.had_big_normalized_update,
            Normalisable::Influencer(i) => &i.had_big_normalized_update,
            Normalisable::PartitionScore(p) => &p.had_big_normalized_update,
        }
    }

    fn flag_mut(&mut self) -> &mut bool {
        match self {
            Normalisable::Bucket(b) => &mut b.had_big_normalized_update,
            Normalisable::Record(r) => &mut r.had_big_normalized_update,
            Normalisable::BucketInfluencer(bi) => &mut bi.had_big_normalized_update,
            Normalisable::Influencer(i) => &mut i.had_big_normalized_update,
            Normalisable::PartitionScore(p) => &mut p.had_big_normalized_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bucket() -> Bucket {
        let mut bucket = Bucket::new(Utc::now(), 3600);
        bucket.bucket_influencers = vec![
            BucketInfluencer {
                influencer_field_name: BUCKET_TIME_INFLUENCER.to_string(),
                anomaly_score: 10.0,
                ..Default::default()
            },
            BucketInfluencer {
                influencer_field_name: "airline".to_string(),
                anomaly_score: 20.0,
                ..Default::default()
            },
        ];
        bucket.records = vec![AnomalyRecord {
            function: Some("mean".to_string()),
            field_name: Some("responsetime".to_string()),
            by_field_name: Some("airline".to_string()),
            partition_field_name: Some("region".to_string()),
            partition_field_value: Some("eu".to_string()),
            probability: 0.01,
            normalized_probability: 30.0,
            ..Default::default()
        }];
        bucket
    }

    #[test]
    fn test_levels() {
        let mut bucket = bucket();
        let mut node = Normalisable::Bucket(&mut bucket);
        assert_eq!(node.level(), level::ROOT);
        assert!(node.is_container_only());

        let influencers = node.children(ChildType::BucketInfluencer);
        let levels: Vec<_> = influencers.iter().map(|n| n.level()).collect();
        assert_eq!(levels, vec![level::ROOT, level::BUCKET_INFLUENCER]);
    }

    #[test]
    fn test_record_fields() {
        let mut bucket = bucket();
        let mut node = Normalisable::Bucket(&mut bucket);
        let records = node.children(ChildType::Record);
        let record = &records[0];

        assert_eq!(record.level(), level::LEAF);
        assert_eq!(record.partition_field_name(), Some("region"));
        assert_eq!(record.partition_field_value(), Some("eu"));
        assert_eq!(record.person_field_name(), Some("airline"));
        assert_eq!(record.function_name(), Some("mean"));
        assert_eq!(record.value_field_name(), Some("responsetime"));
        assert_eq!(record.normalized_score(), 30.0);
    }

    #[test]
    fn test_scores_write_through() {
        let mut bucket = bucket();
        {
            let mut node = Normalisable::Bucket(&mut bucket);
            let mut records = node.children(ChildType::Record);
            records[0].set_normalized_score(55.0);
            records[0].set_parent_score(40.0);
            records[0].raise_big_update();
        }
        assert_eq!(bucket.records[0].normalized_probability, 55.0);
        assert_eq!(bucket.records[0].anomaly_score, 40.0);
        assert!(bucket.records[0].had_big_normalized_update);
    }

    #[test]
    fn test_max_children_score() {
        let mut bucket = bucket();
        let mut node = Normalisable::Bucket(&mut bucket);

        assert!(node.set_max_children_score(ChildType::BucketInfluencer, 20.0));
        assert!(!node.set_max_children_score(ChildType::BucketInfluencer, 20.0));
        assert!(node.set_max_children_score(ChildType::Record, 30.0));
        assert!(!node.set_max_children_score(ChildType::Partition, 99.0));

        // Small drift is stored but does not count as a change
        assert!(!node.set_max_children_score(ChildType::BucketInfluencer, 20.4));
        drop(node);

        assert_eq!(bucket.anomaly_score, 20.4);
        assert_eq!(bucket.max_normalized_probability, 30.0);
    }

    #[test]
    fn test_leaf_nodes_have_no_children() {
        let mut influencer = BucketInfluencer::default();
        let mut node = Normalisable::BucketInfluencer(&mut influencer);
        assert!(node.child_types().is_empty());
        assert!(node.children(ChildType::Record).is_empty());
        assert!(!node.set_max_children_score(ChildType::BucketInfluencer, 1.0));
    }
}
