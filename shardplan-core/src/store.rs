//! Store (storage node) model
//!
//! Stores are owned by the cluster view and refreshed by heartbeats. The
//! scheduler only reads them, except for the blocked flag which checkers
//! toggle for admission control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A store is considered disconnected after this long without a heartbeat
pub const STORE_DISCONNECT_DURATION: Duration = Duration::from_secs(20);

/// Store liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

/// Per-store rate limit classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitType {
    AddPeer,
    RemovePeer,
}

impl LimitType {
    pub const ALL: [LimitType; 2] = [LimitType::AddPeer, LimitType::RemovePeer];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::AddPeer => "add-peer",
            LimitType::RemovePeer => "remove-peer",
        }
    }
}

/// A key/value label attached to a store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

impl StoreLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Storage node as seen by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    /// Unique store ID
    pub id: u64,

    /// Network address
    #[serde(default)]
    pub address: String,

    /// Liveness state
    #[serde(default)]
    pub state: StoreState,

    /// Locality labels, ordered as reported
    #[serde(default)]
    pub labels: Vec<StoreLabel>,

    /// Last heartbeat timestamp
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,

    /// Store reported itself as busy
    #[serde(default)]
    pub busy: bool,

    /// Blocked by a checker for admission control
    #[serde(default)]
    pub blocked: bool,

    /// Peers waiting to catch up on this store
    #[serde(default)]
    pub pending_peer_count: u64,

    #[serde(default)]
    pub sending_snap_count: u64,
    #[serde(default)]
    pub receiving_snap_count: u64,
    #[serde(default)]
    pub applying_snap_count: u64,

    /// Capacity in MiB
    #[serde(default)]
    pub capacity: u64,

    /// Available space in MiB
    #[serde(default)]
    pub available: u64,

    #[serde(default)]
    pub region_count: u64,
    #[serde(default)]
    pub region_size: i64,
    #[serde(default)]
    pub leader_count: u64,
    #[serde(default)]
    pub leader_size: i64,

    /// Whether the add-peer limit still has budget
    #[serde(default = "default_true")]
    pub add_peer_available: bool,

    /// Whether the remove-peer limit still has budget
    #[serde(default = "default_true")]
    pub remove_peer_available: bool,
}

impl Store {
    /// Create an up store with no labels
    pub fn new(id: u64) -> Self {
        Self {
            id,
            address: format!("store-{}:20160", id),
            state: StoreState::Up,
            labels: Vec::new(),
            last_heartbeat: Utc::now(),
            busy: false,
            blocked: false,
            pending_peer_count: 0,
            sending_snap_count: 0,
            receiving_snap_count: 0,
            applying_snap_count: 0,
            capacity: 0,
            available: 0,
            region_count: 0,
            region_size: 0,
            leader_count: 0,
            leader_size: 0,
            add_peer_available: true,
            remove_peer_available: true,
        }
    }

    /// Attach a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push(StoreLabel::new(key, value));
        self
    }

    /// Set the liveness state
    pub fn with_state(mut self, state: StoreState) -> Self {
        self.state = state;
        self
    }

    /// Label value for a key, compared case-insensitively; empty when unset
    pub fn get_label_value(&self, key: &str) -> &str {
        self.labels
            .iter()
            .find(|l| l.key.eq_ignore_ascii_case(key))
            .map(|l| l.value.as_str())
            .unwrap_or("")
    }

    pub fn is_up(&self) -> bool {
        self.state == StoreState::Up
    }

    pub fn is_offline(&self) -> bool {
        self.state == StoreState::Offline
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == StoreState::Tombstone
    }

    /// Time since the last heartbeat
    pub fn down_time(&self) -> Duration {
        (Utc::now() - self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_disconnected(&self) -> bool {
        self.down_time() > STORE_DISCONNECT_DURATION
    }

    /// Used space ratio, 0 when capacity is unknown
    pub fn used_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        1.0 - self.available.min(self.capacity) as f64 / self.capacity as f64
    }

    /// Whether the store crossed the low-space watermark
    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        self.capacity > 0 && self.used_ratio() > low_space_ratio
    }

    /// Load score used to spread regions; lower is better
    pub fn region_score(&self) -> f64 {
        self.region_size as f64
    }

    /// Whether the given limit still has budget
    pub fn is_available(&self, limit: LimitType) -> bool {
        match limit {
            LimitType::AddPeer => self.add_peer_available,
            LimitType::RemovePeer => self.remove_peer_available,
        }
    }

    /// Index of the first location label at which the stores differ, or
    /// `None` when they share every label. Unset labels match anything.
    pub fn compare_location(&self, other: &Store, labels: &[String]) -> Option<usize> {
        labels.iter().position(|key| {
            let (v1, v2) = (self.get_label_value(key), other.get_label_value(key));
            !v1.is_empty() && !v2.is_empty() && !v1.eq_ignore_ascii_case(v2)
        })
    }

    /// Whether any label matches a property label set
    pub fn has_any_label(&self, labels: &[StoreLabel]) -> bool {
        labels.iter().any(|l| {
            self.labels
                .iter()
                .any(|s| s.key.eq_ignore_ascii_case(&l.key) && s.value.eq_ignore_ascii_case(&l.value))
        })
    }
}

/// Read access to the stores of a cluster
pub trait StoreSet {
    fn get_store(&self, id: u64) -> Option<Arc<Store>>;

    /// All stores, sorted by id
    fn get_stores(&self) -> Vec<Arc<Store>>;
}

const BASE_SCORE: f64 = 100.0;

/// Location diversity of `other` relative to `stores`.
///
/// Each store differing from `other` at label index `i` adds
/// `100^(len(labels) - i - 1)`, so differences higher in the label hierarchy
/// dominate.
pub fn distinct_score(labels: &[String], stores: &[Arc<Store>], other: &Store) -> f64 {
    stores
        .iter()
        .filter(|s| s.id != other.id)
        .filter_map(|s| s.compare_location(other, labels))
        .map(|index| BASE_SCORE.powi((labels.len() - index - 1) as i32))
        .sum()
}
