//! Learner promotion checker

use crate::cluster::ClusterView;
use crate::metrics::record_checker_event;
use crate::operator::{create_promote_learner_operator, Operator};
use shardplan_core::Region;
use std::sync::Arc;
use tracing::{debug, instrument};

const CHECKER_NAME: &str = "learner-checker";

/// Promotes caught-up learners when placement rules are disabled
pub struct LearnerChecker {
    cluster: Arc<dyn ClusterView>,
}

impl LearnerChecker {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self { cluster }
    }

    #[instrument(skip_all, fields(region_id = region.id))]
    pub fn check(&self, region: &Region) -> Option<Operator> {
        for learner in region.learners().filter(|p| !region.is_pending(p.id)) {
            match create_promote_learner_operator("promote-learner", self.cluster.as_ref(), region, *learner) {
                Ok(op) => {
                    record_checker_event(CHECKER_NAME, "new-operator");
                    return Some(op);
                }
                Err(e) => debug!(store_id = learner.store_id, error = %e, "Fail to create promote learner operator"),
            }
        }
        None
    }
}
