//! Replica placement strategy
//!
//! Picks stores for the replica of one region under one rule:
//! - where to add a peer (best isolation, then lowest region score)
//! - what replaces a down or offline peer without a worse placement
//! - where to move a peer for strictly better isolation
//! - which peer to drop when there are too many

use crate::cluster::ClusterView;
use crate::filter::{
    isolation_comparer, placement_safeguard, region_score_comparer, DistinctScoreFilter, ExcludedFilter, Filter,
    LabelConstraintFilter, SpecialUseFilter, StorageThresholdFilter, StoreCandidates, StoreStateFilter,
};
use shardplan_core::{Region, Store};
use shardplan_placement::Rule;
use std::sync::Arc;

pub struct ReplicaStrategy<'a> {
    checker_name: &'static str,
    cluster: &'a dyn ClusterView,
    location_labels: Vec<String>,
    region: &'a Region,
    /// Label constraints of the rule being fixed
    rule_filter: Option<LabelConstraintFilter>,
}

impl<'a> ReplicaStrategy<'a> {
    /// Strategy over the cluster's location labels
    pub fn new(checker_name: &'static str, cluster: &'a dyn ClusterView, region: &'a Region) -> Self {
        Self {
            checker_name,
            location_labels: cluster.options().location_labels.clone(),
            cluster,
            region,
            rule_filter: None,
        }
    }

    /// Strategy over one rule's location labels and label constraints
    pub fn for_rule(checker_name: &'static str, cluster: &'a dyn ClusterView, region: &'a Region, rule: &Rule) -> Self {
        Self {
            checker_name,
            cluster,
            location_labels: rule.location_labels.clone(),
            region,
            rule_filter: Some(LabelConstraintFilter::new(checker_name, rule.label_constraints.clone())),
        }
    }

    /// Best store for a new peer next to `co_location_stores`
    pub fn select_store_to_add(
        &self,
        co_location_stores: &[Arc<Store>],
        extra_filters: Vec<Box<dyn Filter + 'a>>,
    ) -> Option<u64> {
        let mut filters: Vec<Box<dyn Filter + 'a>> = vec![
            Box::new(ExcludedFilter::new(self.checker_name, [], self.region.get_store_ids())),
            Box::new(StorageThresholdFilter::new(self.checker_name)),
            Box::new(SpecialUseFilter::new(self.checker_name, &[])),
            Box::new(StoreStateFilter::move_region(self.checker_name)),
        ];
        if let Some(rule_filter) = &self.rule_filter {
            filters.push(Box::new(rule_filter.clone()));
        }
        filters.extend(extra_filters);

        let opts = self.cluster.options();
        let isolation = isolation_comparer(self.location_labels.clone(), co_location_stores.to_vec());
        StoreCandidates::new(self.cluster.get_stores())
            .filter_target(&opts, &filters)
            .sort(&isolation)
            .reverse()
            .top(&isolation)
            .sort(region_score_comparer)
            .pick_first()
            .map(|s| s.id)
    }

    /// Replacement for the peer on `old_store` that keeps placement at least as good
    pub fn select_store_to_replace(&self, co_location_stores: &[Arc<Store>], old_store: u64) -> Option<u64> {
        let source = self.cluster.get_store(old_store)?;
        let safeguard = placement_safeguard(self.checker_name, self.cluster, self.region, &source);
        self.select_store_to_add(co_location_stores, vec![safeguard])
    }

    /// Replacement for the peer on `old_store` with strictly better isolation
    pub fn select_store_to_improve(&self, co_location_stores: &[Arc<Store>], old_store: u64) -> Option<u64> {
        let source = self.cluster.get_store(old_store)?;
        let others: Vec<Arc<Store>> = co_location_stores
            .iter()
            .filter(|s| s.id != old_store)
            .cloned()
            .collect();
        let improver = DistinctScoreFilter::improver(self.checker_name, &self.location_labels, co_location_stores, &source);
        let safeguard = placement_safeguard(self.checker_name, self.cluster, self.region, &source);
        self.select_store_to_add(&others, vec![Box::new(improver), safeguard])
    }

    /// Worst-isolated store among `co_location_stores`, busiest first
    pub fn select_store_to_remove(&self, co_location_stores: &[Arc<Store>]) -> Option<u64> {
        let opts = self.cluster.options();
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(StoreStateFilter::move_region(self.checker_name))];
        let isolation = isolation_comparer(self.location_labels.clone(), co_location_stores.to_vec());
        StoreCandidates::new(co_location_stores.to_vec())
            .filter_source(&opts, &filters)
            .sort(&isolation)
            .top(&isolation)
            .sort(region_score_comparer)
            .reverse()
            .pick_first()
            .map(|s| s.id)
    }
}
