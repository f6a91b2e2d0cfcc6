//! Cluster view
//!
//! Read-only snapshot interface consumed by filters, the operator builder
//! and checkers, plus the region health predicates they share.

use shardplan_core::{Peer, Region, Result, ScheduleOptions, Store, StoreSet};
use shardplan_placement::{RegionFit, RuleManager};
use std::sync::Arc;

/// Cluster state as seen by the scheduler
///
/// Implementations must be cheap to query; checkers call these methods many
/// times per region.
pub trait ClusterView: StoreSet + Send + Sync {
    fn get_region(&self, id: u64) -> Option<Arc<Region>>;

    /// Regions immediately before and after `region` in key order
    fn get_adjacent_regions(&self, region: &Region) -> (Option<Arc<Region>>, Option<Arc<Region>>);

    /// Mark a store as blocked; fails if it is missing or already blocked
    fn block_store(&self, id: u64) -> Result<()>;

    fn unblock_store(&self, id: u64);

    /// Allocate a cluster-unique id
    fn alloc_id(&self) -> Result<u64>;

    /// Allocate a voter peer on the store
    fn alloc_peer(&self, store_id: u64) -> Result<Peer> {
        Ok(Peer::voter(self.alloc_id()?, store_id))
    }

    /// Current scheduling options
    fn options(&self) -> Arc<ScheduleOptions>;

    /// Whether the region carries enough traffic to avoid moving it
    fn is_region_hot(&self, region: &Region) -> bool;

    fn rule_manager(&self) -> &RuleManager;

    /// Fit the region against its placement rules
    fn fit_region(&self, region: &Region) -> RegionFit {
        self.rule_manager().fit_region(self, region)
    }

    /// Stores holding a peer of the region
    fn get_region_stores(&self, region: &Region) -> Vec<Arc<Store>> {
        region
            .get_store_ids()
            .into_iter()
            .filter_map(|id| self.get_store(id))
            .collect()
    }
}

/// No down peers, and no learners when placement rules are disabled
pub fn is_healthy_allow_pending(cluster: &dyn ClusterView, region: &Region) -> bool {
    if !cluster.options().placement_rules_enabled && region.has_learners() {
        return false;
    }
    region.down_peers.is_empty()
}

/// Healthy and without pending peers
pub fn is_region_healthy(cluster: &dyn ClusterView, region: &Region) -> bool {
    is_healthy_allow_pending(cluster, region) && region.pending_peers.is_empty()
}

/// Fully replicated according to the rules, or to `max_replicas` without them
pub fn is_region_replicated(cluster: &dyn ClusterView, region: &Region) -> bool {
    let opts = cluster.options();
    if opts.placement_rules_enabled {
        return cluster.fit_region(region).is_satisfied();
    }
    !region.has_learners() && region.peers.len() == opts.max_replicas
}
