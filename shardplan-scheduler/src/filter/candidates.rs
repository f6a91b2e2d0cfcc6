//! Candidate store pipeline
//!
//! `filter -> sort -> top -> pick`, used to choose movement targets.

use super::{filter_source, filter_target, Filter};
use rand::seq::SliceRandom;
use shardplan_core::{distinct_score, ScheduleOptions, Store};
use std::cmp::Ordering;
use std::sync::Arc;

/// Ordered list of candidate stores
#[derive(Debug, Clone, Default)]
pub struct StoreCandidates {
    pub stores: Vec<Arc<Store>>,
}

impl StoreCandidates {
    pub fn new(stores: Vec<Arc<Store>>) -> Self {
        Self { stores }
    }

    /// Keep stores passing every filter as a source
    pub fn filter_source(mut self, opts: &ScheduleOptions, filters: &[Box<dyn Filter + '_>]) -> Self {
        self.stores.retain(|s| filter_source(opts, s, filters));
        self
    }

    /// Keep stores passing every filter as a target
    pub fn filter_target(mut self, opts: &ScheduleOptions, filters: &[Box<dyn Filter + '_>]) -> Self {
        self.stores.retain(|s| filter_target(opts, s, filters));
        self
    }

    /// Stable sort, ascending by `cmp`
    pub fn sort<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&Store, &Store) -> Ordering,
    {
        self.stores.sort_by(|a, b| cmp(a, b));
        self
    }

    pub fn reverse(mut self) -> Self {
        self.stores.reverse();
        self
    }

    /// Keep the leading stores that compare equal to the first one
    pub fn top<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&Store, &Store) -> Ordering,
    {
        if let Some(first) = self.stores.first().cloned() {
            let n = self
                .stores
                .iter()
                .take_while(|s| cmp(&first, s) == Ordering::Equal)
                .count();
            self.stores.truncate(n);
        }
        self
    }

    pub fn pick_first(&self) -> Option<Arc<Store>> {
        self.stores.first().cloned()
    }

    pub fn random_pick(&self) -> Option<Arc<Store>> {
        self.stores.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Lower region score first
pub fn region_score_comparer(a: &Store, b: &Store) -> Ordering {
    a.region_score().total_cmp(&b.region_score())
}

/// Lower distinct score against `region_stores` first
pub fn isolation_comparer(
    location_labels: Vec<String>,
    region_stores: Vec<Arc<Store>>,
) -> impl Fn(&Store, &Store) -> Ordering {
    move |a, b| {
        let sa = distinct_score(&location_labels, &region_stores, a);
        let sb = distinct_score(&location_labels, &region_stores, b);
        sa.total_cmp(&sb)
    }
}
