//! Scheduling options
//!
//! Live configuration read by filters, checkers and the operator builder.
//! Options are plain serde data so they can be loaded from a TOML file or a
//! cluster snapshot.

use crate::store::{Store, StoreLabel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Label property marking stores that must not hold leaders
pub const REJECT_LEADER: &str = "reject-leader";

/// Key encoding policy of the cluster, controls cross-range merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Table,
    Raw,
    Txn,
}

impl std::str::FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(KeyType::Table),
            "raw" => Ok(KeyType::Raw),
            "txn" => Ok(KeyType::Txn),
            other => Err(format!("unknown key type: {}", other)),
        }
    }
}

/// Scheduling options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    /// Replica count used when placement rules are disabled
    pub max_replicas: usize,

    /// Location label hierarchy, most significant first
    pub location_labels: Vec<String>,

    /// A store down longer than this is treated as failed
    pub max_store_down_time_secs: u64,

    /// Per-store cap on sending/receiving/applying snapshots
    pub max_snapshot_count: u64,

    /// Per-store cap on pending peers (0 = unlimited)
    pub max_pending_peer_count: u64,

    /// Used-space ratio above which a store counts as low on space
    pub low_space_ratio: f64,

    /// Regions at most this size (MiB) may be merged
    pub max_merge_region_size: i64,

    /// Regions with at most this many keys may be merged
    pub max_merge_region_keys: i64,

    /// Merges are suppressed this long after startup or a split
    pub split_merge_interval_secs: u64,

    /// Only merge a region into its next neighbor
    pub enable_one_way_merge: bool,

    /// Allow merging regions of different tables
    pub enable_cross_table_merge: bool,

    pub key_type: KeyType,

    pub placement_rules_enabled: bool,

    /// Label properties, e.g. `reject-leader` -> `[{key: zone, value: z3}]`
    pub label_properties: HashMap<String, Vec<StoreLabel>>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            max_store_down_time_secs: 30 * 60, // 30 minutes
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            low_space_ratio: 0.8,
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            split_merge_interval_secs: 60 * 60, // 1 hour
            enable_one_way_merge: false,
            enable_cross_table_merge: false,
            key_type: KeyType::Table,
            placement_rules_enabled: false,
            label_properties: HashMap::new(),
        }
    }
}

impl ScheduleOptions {
    pub fn max_store_down_time(&self) -> Duration {
        Duration::from_secs(self.max_store_down_time_secs)
    }

    pub fn split_merge_interval(&self) -> Duration {
        Duration::from_secs(self.split_merge_interval_secs)
    }

    /// Whether the store carries a label listed under the given property
    pub fn check_label_property(&self, property: &str, store: &Store) -> bool {
        self.label_properties
            .get(property)
            .map(|labels| store.has_any_label(labels))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = ScheduleOptions::default();
        assert_eq!(opts.max_replicas, 3);
        assert_eq!(opts.max_store_down_time(), Duration::from_secs(1800));
        assert_eq!(opts.split_merge_interval(), Duration::from_secs(3600));
        assert!(!opts.placement_rules_enabled);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts: ScheduleOptions =
            serde_json::from_str(r#"{"max_replicas": 5, "key_type": "raw"}"#).unwrap();
        assert_eq!(opts.max_replicas, 5);
        assert_eq!(opts.key_type, KeyType::Raw);
        assert_eq!(opts.max_snapshot_count, 3);
    }

    #[test]
    fn test_reject_leader_property() {
        let mut opts = ScheduleOptions::default();
        opts.label_properties.insert(
            REJECT_LEADER.to_string(),
            vec![StoreLabel::new("zone", "z3")],
        );

        assert!(opts.check_label_property(REJECT_LEADER, &Store::new(1).with_label("zone", "z3")));
        assert!(!opts.check_label_property(REJECT_LEADER, &Store::new(2).with_label("zone", "z1")));
    }

    #[test]
    fn test_key_type_parse() {
        assert_eq!("TXN".parse::<KeyType>().unwrap(), KeyType::Txn);
        assert!("bogus".parse::<KeyType>().is_err());
    }
}
