//! Store filters
//!
//! A filter decides whether a store may act as the source or the target of
//! a peer movement. Filters are combined with AND; the first rejection stops
//! evaluation, is logged at debug level and counted.
//!
//! - Static filters look at one store: state, health, pending peers,
//!   snapshots, storage threshold, special use, label constraints
//! - Relative filters compare against the region: excluded stores,
//!   distinct score, rule fit
//! - [`StoreStateFilter`] bundles the checks needed for leader transfer or
//!   region movement

pub mod candidates;

pub use candidates::{isolation_comparer, region_score_comparer, StoreCandidates};

use crate::cluster::ClusterView;
use crate::metrics::record_filter_rejection;
use shardplan_core::options::REJECT_LEADER;
use shardplan_core::{distinct_score, LimitType, Region, ScheduleOptions, Store};
use shardplan_placement::{compare_region_fit, LabelConstraint, LabelConstraintOp, RegionFit};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Label key marking a store reserved for special use
pub const SPECIAL_USE_KEY: &str = "specialUse";

/// Store reserved for hot regions
pub const SPECIAL_USE_HOT_REGION: &str = "hotRegion";

/// Store reserved for manual placement
pub const SPECIAL_USE_RESERVED: &str = "reserved";

const ALL_SPECIAL_USES: [&str; 2] = [SPECIAL_USE_HOT_REGION, SPECIAL_USE_RESERVED];

/// Predicate over stores used to pick movement sources and targets
pub trait Filter: Send + Sync {
    /// Who uses the filter, for logs and metrics
    fn scope(&self) -> &str;

    fn filter_type(&self) -> &'static str;

    /// Whether the store may give up a peer or leader
    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool;

    /// Whether the store may receive a peer or leader
    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool;
}

/// Whether the store passes every filter as a source
pub fn filter_source(opts: &ScheduleOptions, store: &Store, filters: &[Box<dyn Filter + '_>]) -> bool {
    for filter in filters {
        if !filter.source(opts, store) {
            debug!(
                scope = filter.scope(),
                filter_type = filter.filter_type(),
                store_id = store.id,
                "Source store filtered"
            );
            record_filter_rejection(filter.scope(), filter.filter_type(), "source");
            return false;
        }
    }
    true
}

/// Whether the store passes every filter as a target
pub fn filter_target(opts: &ScheduleOptions, store: &Store, filters: &[Box<dyn Filter + '_>]) -> bool {
    for filter in filters {
        if !filter.target(opts, store) {
            debug!(
                scope = filter.scope(),
                filter_type = filter.filter_type(),
                store_id = store.id,
                "Target store filtered"
            );
            record_filter_rejection(filter.scope(), filter.filter_type(), "target");
            return false;
        }
    }
    true
}

/// Stores passing every filter as a source
pub fn select_source_stores(
    stores: &[Arc<Store>],
    filters: &[Box<dyn Filter + '_>],
    opts: &ScheduleOptions,
) -> Vec<Arc<Store>> {
    stores
        .iter()
        .filter(|s| filter_source(opts, s, filters))
        .cloned()
        .collect()
}

/// Stores passing every filter as a target
pub fn select_target_stores(
    stores: &[Arc<Store>],
    filters: &[Box<dyn Filter + '_>],
    opts: &ScheduleOptions,
) -> Vec<Arc<Store>> {
    stores
        .iter()
        .filter(|s| filter_target(opts, s, filters))
        .cloned()
        .collect()
}

// ===== Static filters =====

/// Rejects explicitly listed stores
pub struct ExcludedFilter {
    scope: String,
    sources: HashSet<u64>,
    targets: HashSet<u64>,
}

impl ExcludedFilter {
    pub fn new(
        scope: impl Into<String>,
        sources: impl IntoIterator<Item = u64>,
        targets: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            scope: scope.into(),
            sources: sources.into_iter().collect(),
            targets: targets.into_iter().collect(),
        }
    }
}

impl Filter for ExcludedFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "exclude-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        !self.sources.contains(&store.id)
    }

    fn target(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        !self.targets.contains(&store.id)
    }
}

/// Tombstone stores are never sources; only up stores are targets
pub struct StateFilter {
    scope: String,
}

impl StateFilter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }
}

impl Filter for StateFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "state-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        !store.is_tombstone()
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        store.is_up() && store.down_time() <= opts.max_store_down_time()
    }
}

/// Rejects busy stores and stores down for too long
pub struct HealthFilter {
    scope: String,
}

impl HealthFilter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }

    fn is_healthy(opts: &ScheduleOptions, store: &Store) -> bool {
        !store.busy && store.down_time() <= opts.max_store_down_time()
    }
}

impl Filter for HealthFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "health-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        Self::is_healthy(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        Self::is_healthy(opts, store)
    }
}

/// Rejects stores with too many pending peers; 0 disables the check
pub struct PendingPeerCountFilter {
    scope: String,
}

impl PendingPeerCountFilter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }

    fn check(opts: &ScheduleOptions, store: &Store) -> bool {
        opts.max_pending_peer_count == 0 || store.pending_peer_count <= opts.max_pending_peer_count
    }
}

impl Filter for PendingPeerCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "pending-peer-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        Self::check(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        Self::check(opts, store)
    }
}

/// Rejects stores handling too many snapshots
pub struct SnapshotCountFilter {
    scope: String,
}

impl SnapshotCountFilter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }
}

fn snapshots_under_limit(opts: &ScheduleOptions, store: &Store) -> bool {
    let max = opts.max_snapshot_count;
    store.sending_snap_count <= max && store.receiving_snap_count <= max && store.applying_snap_count <= max
}

impl Filter for SnapshotCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "snapshot-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        snapshots_under_limit(opts, store)
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        snapshots_under_limit(opts, store)
    }
}

/// Rejects low-space targets
pub struct StorageThresholdFilter {
    scope: String,
}

impl StorageThresholdFilter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self { scope: scope.into() }
    }
}

impl Filter for StorageThresholdFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "storage-threshold-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, _store: &Store) -> bool {
        true
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        !store.is_low_space(opts.low_space_ratio)
    }
}

/// Keeps stores matching a label constraint list
#[derive(Debug, Clone)]
pub struct LabelConstraintFilter {
    scope: String,
    constraints: Vec<LabelConstraint>,
}

impl LabelConstraintFilter {
    pub fn new(scope: impl Into<String>, constraints: Vec<LabelConstraint>) -> Self {
        Self {
            scope: scope.into(),
            constraints,
        }
    }

    fn matches(&self, store: &Store) -> bool {
        self.constraints.iter().all(|c| c.match_store(store))
    }
}

impl Filter for LabelConstraintFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "label-constraint-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        self.matches(store)
    }

    fn target(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        self.matches(store)
    }
}

/// Keeps regular regions off stores reserved for special use
pub struct SpecialUseFilter {
    scope: String,
    constraint: LabelConstraint,
}

impl SpecialUseFilter {
    /// Reject every special use except `allow_uses`
    pub fn new(scope: impl Into<String>, allow_uses: &[&str]) -> Self {
        let values: Vec<&str> = ALL_SPECIAL_USES
            .iter()
            .copied()
            .filter(|u| !allow_uses.contains(u))
            .collect();
        Self {
            scope: scope.into(),
            constraint: LabelConstraint::new(SPECIAL_USE_KEY, LabelConstraintOp::In, &values),
        }
    }
}

impl Filter for SpecialUseFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "special-use-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        // Low-space stores may always shed peers
        if store.is_low_space(opts.low_space_ratio) {
            return true;
        }
        !self.constraint.match_store(store)
    }

    fn target(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        !self.constraint.match_store(store)
    }
}

// ===== Relative filters =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocationPolicy {
    /// Target must not lower isolation
    Safeguard,
    /// Target must raise isolation
    Improver,
}

/// Compares a target's distinct score with the store it replaces
pub struct DistinctScoreFilter {
    scope: String,
    labels: Vec<String>,
    stores: Vec<Arc<Store>>,
    safe_score: f64,
    policy: LocationPolicy,
}

impl DistinctScoreFilter {
    fn new(
        scope: impl Into<String>,
        labels: &[String],
        stores: &[Arc<Store>],
        source: &Store,
        policy: LocationPolicy,
    ) -> Self {
        let stores: Vec<Arc<Store>> = stores.iter().filter(|s| s.id != source.id).cloned().collect();
        let safe_score = distinct_score(labels, &stores, source);
        Self {
            scope: scope.into(),
            labels: labels.to_vec(),
            stores,
            safe_score,
            policy,
        }
    }

    /// Target isolation must be at least the source's
    pub fn safeguard(scope: impl Into<String>, labels: &[String], stores: &[Arc<Store>], source: &Store) -> Self {
        Self::new(scope, labels, stores, source, LocationPolicy::Safeguard)
    }

    /// Target isolation must exceed the source's
    pub fn improver(scope: impl Into<String>, labels: &[String], stores: &[Arc<Store>], source: &Store) -> Self {
        Self::new(scope, labels, stores, source, LocationPolicy::Improver)
    }
}

impl Filter for DistinctScoreFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "distinct-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, _store: &Store) -> bool {
        true
    }

    fn target(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        let score = distinct_score(&self.labels, &self.stores, store);
        match self.policy {
            LocationPolicy::Safeguard => score >= self.safe_score,
            LocationPolicy::Improver => score > self.safe_score,
        }
    }
}

/// Rejects targets that would make the region fit its rules worse
pub struct RuleFitFilter<'a> {
    scope: String,
    cluster: &'a dyn ClusterView,
    region: Region,
    old_fit: RegionFit,
    old_store: u64,
}

impl<'a> RuleFitFilter<'a> {
    pub fn new(scope: impl Into<String>, cluster: &'a dyn ClusterView, region: &Region, old_store: u64) -> Self {
        Self {
            scope: scope.into(),
            cluster,
            region: region.clone(),
            old_fit: cluster.fit_region(region),
            old_store,
        }
    }
}

impl Filter for RuleFitFilter<'_> {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "rule-fit-filter"
    }

    fn source(&self, _opts: &ScheduleOptions, _store: &Store) -> bool {
        true
    }

    fn target(&self, _opts: &ScheduleOptions, store: &Store) -> bool {
        let region = self.region.with_replaced_peer_store(self.old_store, store.id);
        let new_fit = self.cluster.fit_region(&region);
        compare_region_fit(&self.old_fit, &new_fit) != Ordering::Greater
    }
}

/// Filter keeping replacement targets at least as good as `source`.
///
/// Uses rule fitting when placement rules are enabled, the distinct score
/// over the configured location labels otherwise.
pub fn placement_safeguard<'a>(
    scope: &str,
    cluster: &'a dyn ClusterView,
    region: &Region,
    source: &Store,
) -> Box<dyn Filter + 'a> {
    let opts = cluster.options();
    if opts.placement_rules_enabled {
        Box::new(RuleFitFilter::new(scope, cluster, region, source.id))
    } else {
        Box::new(DistinctScoreFilter::safeguard(
            scope,
            &opts.location_labels,
            &cluster.get_region_stores(region),
            source,
        ))
    }
}

// ===== Store state =====

/// Composite state checks for leader transfer and region movement
#[derive(Debug, Clone)]
pub struct StoreStateFilter {
    pub scope: String,
    /// Check the store can send or take leadership
    pub transfer_leader: bool,
    /// Check the store can send or take a peer
    pub move_region: bool,
}

impl StoreStateFilter {
    pub fn transfer_leader(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            transfer_leader: true,
            move_region: false,
        }
    }

    pub fn move_region(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            transfer_leader: false,
            move_region: true,
        }
    }

    fn is_alive(opts: &ScheduleOptions, store: &Store) -> bool {
        !store.is_tombstone() && store.down_time() <= opts.max_store_down_time()
    }

    fn can_move_region(opts: &ScheduleOptions, store: &Store, limit: LimitType) -> bool {
        !store.busy && store.is_available(limit) && snapshots_under_limit(opts, store)
    }
}

impl Filter for StoreStateFilter {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn filter_type(&self) -> &'static str {
        "store-state-filter"
    }

    fn source(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        if !Self::is_alive(opts, store) {
            return false;
        }
        if self.transfer_leader && (store.is_disconnected() || store.blocked) {
            return false;
        }
        if self.move_region && !Self::can_move_region(opts, store, LimitType::RemovePeer) {
            return false;
        }
        true
    }

    fn target(&self, opts: &ScheduleOptions, store: &Store) -> bool {
        if !Self::is_alive(opts, store) {
            return false;
        }
        if self.transfer_leader
            && (store.is_disconnected()
                || store.blocked
                || store.busy
                || opts.check_label_property(REJECT_LEADER, store))
        {
            return false;
        }
        if self.move_region {
            if store.is_offline() {
                return false;
            }
            if opts.max_pending_peer_count > 0 && store.pending_peer_count > opts.max_pending_peer_count {
                return false;
            }
            if !Self::can_move_region(opts, store, LimitType::AddPeer) {
                return false;
            }
        }
        true
    }
}
