//! Projected effect of operators on store load

use shardplan_core::{LimitType, EMPTY_REGION_APPROXIMATE_SIZE};
use std::collections::HashMap;

/// Regions above this size (MiB) cost a full step
pub const SMALL_REGION_THRESHOLD: i64 = 20;

/// Step cost of moving a regular region
pub const REGION_INFLUENCE: i64 = 1000;

/// Step cost of moving a small region
pub const SMALL_REGION_INFLUENCE: i64 = 200;

/// Change in one store's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreInfluence {
    pub region_size: i64,
    pub region_count: i64,
    pub leader_size: i64,
    pub leader_count: i64,
    step_cost: HashMap<LimitType, i64>,
}

impl StoreInfluence {
    /// Charge the limit for moving a region of `region_size`
    pub fn adjust_step_cost(&mut self, limit: LimitType, region_size: i64) {
        if region_size > SMALL_REGION_THRESHOLD {
            *self.step_cost.entry(limit).or_default() += REGION_INFLUENCE;
        } else if region_size > EMPTY_REGION_APPROXIMATE_SIZE {
            *self.step_cost.entry(limit).or_default() += SMALL_REGION_INFLUENCE;
        }
    }

    pub fn step_cost(&self, limit: LimitType) -> i64 {
        self.step_cost.get(&limit).copied().unwrap_or(0)
    }
}

/// Per-store influence of one or more operators
#[derive(Debug, Clone, Default)]
pub struct OpInfluence {
    stores: HashMap<u64, StoreInfluence>,
}

impl OpInfluence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Influence on a store, created empty on first access
    pub fn store_mut(&mut self, store_id: u64) -> &mut StoreInfluence {
        self.stores.entry(store_id).or_default()
    }

    pub fn get(&self, store_id: u64) -> Option<&StoreInfluence> {
        self.stores.get(&store_id)
    }

    pub fn store_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.stores.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
