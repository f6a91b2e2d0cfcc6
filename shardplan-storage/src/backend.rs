//! Rule storage trait
//!
//! Defines the interface that rule persistence implementations must follow.
//! Values are opaque JSON documents; keys are derived from the rule identity
//! by the placement crate.

use shardplan_core::error::Result;

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Number of persisted rules
    pub rule_count: u64,

    /// Number of save operations
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

/// Synchronous rule storage
///
/// Implementations must be Send + Sync; the rule manager calls them while
/// holding its write lock.
pub trait RuleStorage: Send + Sync {
    /// Persist a rule document under `key`, replacing any previous value
    fn save_rule(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the document stored under `key`; deleting a missing key is not an error
    fn delete_rule(&self, key: &str) -> Result<()>;

    /// Load every stored `(key, value)` pair in key order
    fn load_rules(&self) -> Result<Vec<(String, String)>>;

    /// Get storage statistics
    fn stats(&self) -> StorageStats;
}
