//! Merge checker
//!
//! Merges small regions into an adjacent region. A region is skipped while
//! the scheduler is warming up, shortly after it split, when it is not
//! small, unhealthy, under-replicated or hot.

use crate::cache::TtlCache;
use crate::cluster::{is_region_healthy, is_region_replicated, ClusterView};
use crate::metrics::record_checker_event;
use crate::operator::{create_merge_region_operator, OpKind, Operator};
use shardplan_core::codec::table_id;
use shardplan_core::{KeyType, Region};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

const CHECKER_NAME: &str = "merge-checker";

pub struct MergeChecker {
    cluster: Arc<dyn ClusterView>,
    start_time: Instant,
    /// Set once region sizes can be trusted
    warmed_up: bool,
    /// Recently split regions
    split_cache: TtlCache,
}

impl MergeChecker {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        let interval = cluster.options().split_merge_interval();
        Self {
            cluster,
            start_time: Instant::now(),
            warmed_up: false,
            split_cache: TtlCache::new(interval),
        }
    }

    /// Keep freshly split regions from being merged back
    pub fn record_region_split(&self, region_ids: &[u64]) {
        for id in region_ids {
            self.split_cache.put(*id);
        }
    }

    /// Trust region sizes right away, e.g. when checking a loaded snapshot
    pub fn skip_warm_up(&mut self) {
        self.warmed_up = true;
    }

    /// Operators merging `region` into a neighbor, source first
    #[instrument(skip_all, fields(region_id = region.id))]
    pub fn check(&self, region: &Region) -> Option<Vec<Operator>> {
        let opts = self.cluster.options();
        if !self.warmed_up && self.start_time.elapsed() < opts.split_merge_interval() {
            record_checker_event(CHECKER_NAME, "recently-start");
            return None;
        }
        if self.split_cache.exists(region.id) {
            record_checker_event(CHECKER_NAME, "recently-split");
            return None;
        }
        record_checker_event(CHECKER_NAME, "check");

        // Not yet reported by its leader
        if region.leader.is_none() || region.approximate_size == 0 {
            record_checker_event(CHECKER_NAME, "skip-uninit-region");
            return None;
        }
        if region.approximate_size > opts.max_merge_region_size || region.approximate_keys > opts.max_merge_region_keys
        {
            record_checker_event(CHECKER_NAME, "no-need");
            return None;
        }
        let cluster = self.cluster.as_ref();
        if !is_region_healthy(cluster, region) {
            record_checker_event(CHECKER_NAME, "special-peer");
            return None;
        }
        if !is_region_replicated(cluster, region) {
            record_checker_event(CHECKER_NAME, "abnormal-replica");
            return None;
        }
        if cluster.is_region_hot(region) {
            record_checker_event(CHECKER_NAME, "hot-region");
            return None;
        }

        let (prev, next) = cluster.get_adjacent_regions(region);
        let mut target = next.filter(|n| self.check_target(region, n));
        if !opts.enable_one_way_merge {
            if let Some(prev) = prev.filter(|p| self.check_target(region, p)) {
                let smaller = target
                    .as_ref()
                    .map(|n| prev.approximate_size < n.approximate_size)
                    .unwrap_or(true);
                if smaller {
                    target = Some(prev);
                }
            }
        }
        let target = match target {
            Some(target) => target,
            None => {
                record_checker_event(CHECKER_NAME, "no-target");
                return None;
            }
        };

        debug!(
            target_id = target.id,
            source_size = region.approximate_size,
            target_size = target.approximate_size,
            "Try to merge region"
        );
        match create_merge_region_operator("merge-region", cluster, region, &target, OpKind::MERGE) {
            Ok(ops) => {
                record_checker_event(CHECKER_NAME, "new-operator");
                if region.approximate_size > target.approximate_size
                    || region.approximate_keys > target.approximate_keys
                {
                    record_checker_event(CHECKER_NAME, "larger-source");
                }
                Some(ops)
            }
            Err(e) => {
                warn!(target_id = target.id, error = %e, "Create merge region operator failed");
                None
            }
        }
    }

    fn check_target(&self, region: &Region, adjacent: &Region) -> bool {
        let cluster = self.cluster.as_ref();
        !cluster.is_region_hot(adjacent)
            && allow_merge(cluster, region, adjacent)
            && is_region_healthy(cluster, adjacent)
            && is_region_replicated(cluster, adjacent)
    }
}

/// Whether `region` and `adjacent` may be merged into one range
pub fn allow_merge(cluster: &dyn ClusterView, region: &Region, adjacent: &Region) -> bool {
    let (start, end) = if !region.end_key.is_empty() && region.end_key == adjacent.start_key {
        (&region.start_key, &adjacent.end_key)
    } else if !adjacent.end_key.is_empty() && adjacent.end_key == region.start_key {
        (&adjacent.start_key, &region.end_key)
    } else {
        return false;
    };

    let opts = cluster.options();
    if opts.placement_rules_enabled {
        return cluster.rule_manager().get_split_keys(start, end).is_empty();
    }
    match opts.key_type {
        KeyType::Table => opts.enable_cross_table_merge || table_id(&region.start_key) == table_id(&adjacent.start_key),
        KeyType::Raw | KeyType::Txn => true,
    }
}
