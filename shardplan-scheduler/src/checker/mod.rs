//! Checkers
//!
//! Corrective checks run once per region per scheduling pass. Each returns
//! the operator(s) that move the region toward its desired placement, or
//! `None` when nothing needs doing now. Failures to find a plan are logged
//! and the region is simply re-checked on the next pass.

pub mod learner;
pub mod merge;
pub mod rule;
pub mod strategy;

pub use learner::LearnerChecker;
pub use merge::{allow_merge, MergeChecker};
pub use rule::RuleChecker;
pub use strategy::ReplicaStrategy;

use crate::cluster::ClusterView;
use crate::operator::{BuildError, Operator};
use shardplan_core::Region;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a checker could not produce an operator
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("no store to add peer")]
    NoStoreToAdd,

    #[error("no store to replace peer on store {0}")]
    NoStoreToReplace(u64),

    #[error("no new leader")]
    NoNewLeader,

    #[error("peer on store {0} cannot be leader")]
    PeerCannotBeLeader(u64),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),
}

/// Runs every checker over a region
pub struct CheckerController {
    cluster: Arc<dyn ClusterView>,
    learner: LearnerChecker,
    rule: RuleChecker,
    merge: MergeChecker,
}

impl CheckerController {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self {
            learner: LearnerChecker::new(cluster.clone()),
            rule: RuleChecker::new(cluster.clone()),
            merge: MergeChecker::new(cluster.clone()),
            cluster,
        }
    }

    /// Skip the merge checker's warm-up period
    pub fn skip_merge_warm_up(mut self) -> Self {
        self.merge.skip_warm_up();
        self
    }

    pub fn rule_checker(&self) -> &RuleChecker {
        &self.rule
    }

    pub fn merge_checker(&self) -> &MergeChecker {
        &self.merge
    }

    /// First non-empty result of the learner, rule and merge checkers
    ///
    /// Learners are only promoted directly while placement rules are off;
    /// with rules on, roles are the rule checker's business.
    pub fn check_region(&self, region: &Region) -> Option<Vec<Operator>> {
        let opts = self.cluster.options();
        if !opts.placement_rules_enabled {
            if let Some(op) = self.learner.check(region) {
                return Some(vec![op]);
            }
        } else if let Some(op) = self.rule.check(region) {
            return Some(vec![op]);
        }
        self.merge.check(region)
    }
}
