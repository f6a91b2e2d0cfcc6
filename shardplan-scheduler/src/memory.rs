//! In-memory cluster view
//!
//! Used by tests and by the scheduler binary, which loads it from a JSON
//! snapshot. Not connected to any live cluster.

use crate::cluster::ClusterView;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardplan_core::{Region, Result, ScheduleOptions, ShardplanError, Store, StoreSet};
use shardplan_placement::{Rule, RuleManager};
use shardplan_storage::MemoryRuleStorage;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// First id handed out by [`MemoryCluster::alloc_id`]
const DEFAULT_FIRST_ID: u64 = 1000;

/// Serialized cluster state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub options: ScheduleOptions,
    pub stores: Vec<Store>,
    pub regions: Vec<Region>,
    /// Ids of regions with high recent traffic
    pub hot_regions: Vec<u64>,
    /// Rules to install on top of the persisted ones
    pub rules: Vec<Rule>,
}

impl ClusterSnapshot {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// In-memory cluster
pub struct MemoryCluster {
    stores: RwLock<BTreeMap<u64, Arc<Store>>>,
    regions: RwLock<BTreeMap<u64, Arc<Region>>>,
    /// Region id by start key
    ranges: RwLock<BTreeMap<Vec<u8>, u64>>,
    hot_regions: RwLock<HashSet<u64>>,
    options: RwLock<Arc<ScheduleOptions>>,
    next_id: AtomicU64,
    rule_manager: Arc<RuleManager>,
}

impl MemoryCluster {
    /// Create an empty cluster around an initialized rule manager
    pub fn new(options: ScheduleOptions, rule_manager: Arc<RuleManager>) -> Self {
        Self {
            stores: RwLock::new(BTreeMap::new()),
            regions: RwLock::new(BTreeMap::new()),
            ranges: RwLock::new(BTreeMap::new()),
            hot_regions: RwLock::new(HashSet::new()),
            options: RwLock::new(Arc::new(options)),
            next_id: AtomicU64::new(DEFAULT_FIRST_ID),
            rule_manager,
        }
    }

    /// Create an empty cluster with an in-memory rule store seeded from `options`
    pub fn with_memory_rules(options: ScheduleOptions) -> shardplan_placement::Result<Self> {
        let manager = RuleManager::new(Arc::new(MemoryRuleStorage::new()));
        manager.initialize(options.max_replicas, options.location_labels.clone())?;
        Ok(Self::new(options, Arc::new(manager)))
    }

    /// Populate a cluster from a snapshot, installing its rules
    pub fn from_snapshot(
        snapshot: ClusterSnapshot,
        rule_manager: Arc<RuleManager>,
    ) -> shardplan_placement::Result<Self> {
        rule_manager.initialize(
            snapshot.options.max_replicas,
            snapshot.options.location_labels.clone(),
        )?;
        for rule in snapshot.rules {
            rule_manager.set_rule(rule)?;
        }

        let cluster = Self::new(snapshot.options, rule_manager);
        let max_id = snapshot
            .regions
            .iter()
            .flat_map(|r| r.peers.iter().map(|p| p.id).chain(std::iter::once(r.id)))
            .max()
            .unwrap_or(0);
        cluster.set_next_id((max_id + 1).max(DEFAULT_FIRST_ID));

        for store in snapshot.stores {
            cluster.put_store(store);
        }
        for region in snapshot.regions {
            cluster.put_region(region);
        }
        for id in snapshot.hot_regions {
            cluster.set_region_hot(id, true);
        }
        Ok(cluster)
    }

    /// Insert or replace a store
    pub fn put_store(&self, store: Store) {
        self.stores.write().insert(store.id, Arc::new(store));
    }

    /// Apply a change to a stored store
    pub fn update_store<F: FnOnce(&mut Store)>(&self, id: u64, f: F) -> Result<()> {
        let mut stores = self.stores.write();
        let store = stores.get_mut(&id).ok_or(ShardplanError::StoreNotFound(id))?;
        f(Arc::make_mut(store));
        Ok(())
    }

    /// Insert or replace a region
    pub fn put_region(&self, region: Region) {
        let mut ranges = self.ranges.write();
        let mut regions = self.regions.write();
        if let Some(old) = regions.get(&region.id) {
            if ranges.get(&old.start_key) == Some(&old.id) {
                ranges.remove(&old.start_key);
            }
        }
        ranges.insert(region.start_key.clone(), region.id);
        regions.insert(region.id, Arc::new(region));
    }

    /// Every region, sorted by id
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.read().values().cloned().collect()
    }

    pub fn set_region_hot(&self, id: u64, hot: bool) {
        let mut hot_regions = self.hot_regions.write();
        if hot {
            hot_regions.insert(id);
        } else {
            hot_regions.remove(&id);
        }
    }

    pub fn set_options(&self, options: ScheduleOptions) {
        *self.options.write() = Arc::new(options);
    }

    /// Apply a change to the options
    pub fn update_options<F: FnOnce(&mut ScheduleOptions)>(&self, f: F) {
        let mut guard = self.options.write();
        f(Arc::make_mut(&mut guard));
    }

    pub fn set_next_id(&self, id: u64) {
        self.next_id.store(id, Ordering::SeqCst);
    }

    pub fn rule_manager_handle(&self) -> Arc<RuleManager> {
        self.rule_manager.clone()
    }
}

impl StoreSet for MemoryCluster {
    fn get_store(&self, id: u64) -> Option<Arc<Store>> {
        self.stores.read().get(&id).cloned()
    }

    fn get_stores(&self) -> Vec<Arc<Store>> {
        self.stores.read().values().cloned().collect()
    }
}

impl ClusterView for MemoryCluster {
    fn get_region(&self, id: u64) -> Option<Arc<Region>> {
        self.regions.read().get(&id).cloned()
    }

    fn get_adjacent_regions(&self, region: &Region) -> (Option<Arc<Region>>, Option<Arc<Region>>) {
        let ranges = self.ranges.read();
        let regions = self.regions.read();

        let prev = if region.start_key.is_empty() {
            None
        } else {
            ranges
                .range(..region.start_key.clone())
                .next_back()
                .and_then(|(_, id)| regions.get(id))
                .filter(|r| r.end_key == region.start_key)
                .cloned()
        };
        let next = if region.end_key.is_empty() {
            None
        } else {
            ranges
                .get(&region.end_key)
                .and_then(|id| regions.get(id))
                .cloned()
        };
        (prev, next)
    }

    fn block_store(&self, id: u64) -> Result<()> {
        let mut stores = self.stores.write();
        let store = stores.get_mut(&id).ok_or(ShardplanError::StoreNotFound(id))?;
        if store.blocked {
            return Err(ShardplanError::StoreBlocked(id));
        }
        Arc::make_mut(store).blocked = true;
        debug!(store_id = id, "Store blocked");
        Ok(())
    }

    fn unblock_store(&self, id: u64) {
        if let Some(store) = self.stores.write().get_mut(&id) {
            Arc::make_mut(store).blocked = false;
            debug!(store_id = id, "Store unblocked");
        }
    }

    fn alloc_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn options(&self) -> Arc<ScheduleOptions> {
        self.options.read().clone()
    }

    fn is_region_hot(&self, region: &Region) -> bool {
        self.hot_regions.read().contains(&region.id)
    }

    fn rule_manager(&self) -> &RuleManager {
        &self.rule_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplan_core::Peer;

    fn region(id: u64, start: &[u8], end: &[u8]) -> Region {
        let peer = Peer::voter(id * 10, 1);
        Region::new(id, start, end, vec![peer], Some(peer))
    }

    #[test]
    fn test_adjacent_regions() {
        let cluster = MemoryCluster::with_memory_rules(ScheduleOptions::default()).unwrap();
        cluster.put_region(region(1, b"", b"b"));
        cluster.put_region(region(2, b"b", b"d"));
        cluster.put_region(region(3, b"d", b""));

        let middle = cluster.get_region(2).unwrap();
        let (prev, next) = cluster.get_adjacent_regions(&middle);
        assert_eq!(prev.map(|r| r.id), Some(1));
        assert_eq!(next.map(|r| r.id), Some(3));

        let first = cluster.get_region(1).unwrap();
        assert!(cluster.get_adjacent_regions(&first).0.is_none());
    }

    #[test]
    fn test_put_region_moves_range() {
        let cluster = MemoryCluster::with_memory_rules(ScheduleOptions::default()).unwrap();
        cluster.put_region(region(1, b"", b"b"));
        cluster.put_region(region(2, b"b", b""));
        // region 2 absorbed region 1
        cluster.put_region(region(2, b"", b""));
        cluster.regions.write().remove(&1);

        let r = cluster.get_region(2).unwrap();
        assert_eq!(cluster.get_adjacent_regions(&r), (None, None));
    }

    #[test]
    fn test_block_store() {
        let cluster = MemoryCluster::with_memory_rules(ScheduleOptions::default()).unwrap();
        cluster.put_store(Store::new(1));

        cluster.block_store(1).unwrap();
        assert!(cluster.get_store(1).unwrap().blocked);
        assert!(matches!(cluster.block_store(1), Err(ShardplanError::StoreBlocked(1))));
        assert!(matches!(cluster.block_store(9), Err(ShardplanError::StoreNotFound(9))));

        cluster.unblock_store(1);
        assert!(!cluster.get_store(1).unwrap().blocked);
    }

    #[test]
    fn test_alloc_id_is_monotonic() {
        let cluster = MemoryCluster::with_memory_rules(ScheduleOptions::default()).unwrap();
        let a = cluster.alloc_id().unwrap();
        let b = cluster.alloc_peer(3).unwrap();
        assert_eq!(b.id, a + 1);
        assert_eq!(b.store_id, 3);
    }

    #[test]
    fn test_snapshot_load() {
        let json = r#"{
            "options": {"max_replicas": 1},
            "stores": [{"id": 1}],
            "regions": [{"id": 7, "start_key": "", "end_key": "", "peers": [{"id": 5000, "store_id": 1}],
                         "leader": {"id": 5000, "store_id": 1}}],
            "hot_regions": [7]
        }"#;
        let snapshot = ClusterSnapshot::from_json(json).unwrap();
        let manager = Arc::new(RuleManager::new(Arc::new(MemoryRuleStorage::new())));
        let cluster = MemoryCluster::from_snapshot(snapshot, manager).unwrap();

        let region = cluster.get_region(7).unwrap();
        assert!(cluster.is_region_hot(&region));
        assert!(cluster.fit_region(&region).is_satisfied());
        assert_eq!(cluster.alloc_id().unwrap(), 5001);
    }
}
