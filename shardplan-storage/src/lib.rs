//! Shardplan Storage Backend
//!
//! Provides persistence for placement rules:
//! - `RuleStorage` trait for pluggable rule persistence
//! - `SledRuleStorage` for durable on-disk storage
//! - `MemoryRuleStorage` for testing

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{RuleStorage, StorageStats};
pub use memory::MemoryRuleStorage;
pub use sled_backend::SledRuleStorage;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the rule database directory
    pub path: std::path::PathBuf,

    /// Flush to disk after every write
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("./shardplan_data"),
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Enable/disable synchronous flushing
    pub fn with_sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }
}
