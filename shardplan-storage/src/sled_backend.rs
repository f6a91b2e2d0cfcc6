//! Sled-based rule storage
//!
//! Rules live in a dedicated `rules` tree keyed by their storage key. Sled
//! provides ACID writes and is pure Rust.

use crate::backend::{RuleStorage, StorageStats};
use crate::StorageConfig;
use shardplan_core::error::{Result, ShardplanError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const RULES_TREE: &str = "rules";

/// Sled-based rule store
pub struct SledRuleStorage {
    db: sled::Db,
    rules: sled::Tree,
    sync_writes: bool,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl SledRuleStorage {
    /// Open or create a rule store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(&StorageConfig::new(path.as_ref()))
    }

    /// Open or create a rule store with explicit settings
    pub fn open_with_config(config: &StorageConfig) -> Result<Self> {
        info!(path = ?config.path, "Opening Sled rule store");

        let db = sled::open(&config.path)
            .map_err(|e| ShardplanError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db, config.sync_writes)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ShardplanError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::from_db(db, false)
    }

    fn from_db(db: sled::Db, sync_writes: bool) -> Result<Self> {
        let rules = db
            .open_tree(RULES_TREE)
            .map_err(|e| ShardplanError::Storage(e.to_string()))?;
        Ok(Self {
            db,
            rules,
            sync_writes,
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| ShardplanError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get size on disk
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    fn maybe_flush(&self) -> Result<()> {
        if self.sync_writes {
            self.rules
                .flush()
                .map_err(|e| ShardplanError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}

impl RuleStorage for SledRuleStorage {
    fn save_rule(&self, key: &str, value: &str) -> Result<()> {
        self.rules
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| ShardplanError::Storage(e.to_string()))?;
        self.maybe_flush()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Saved rule");
        Ok(())
    }

    fn delete_rule(&self, key: &str) -> Result<()> {
        self.rules
            .remove(key.as_bytes())
            .map_err(|e| ShardplanError::Storage(e.to_string()))?;
        self.maybe_flush()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Deleted rule");
        Ok(())
    }

    fn load_rules(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.rules.iter() {
            let (k, v) = item.map_err(|e| ShardplanError::Storage(e.to_string()))?;
            // Non-UTF8 entries are surfaced lossily so the loader can drop them
            out.push((
                String::from_utf8_lossy(&k).into_owned(),
                String::from_utf8_lossy(&v).into_owned(),
            ));
        }
        Ok(out)
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            rule_count: self.rules.len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let store = SledRuleStorage::open_temporary().unwrap();
        store.save_rule("6664-6466", r#"{"id":"x"}"#).unwrap();
        store.save_rule("6161-6161", r#"{"id":"y"}"#).unwrap();

        let loaded = store.load_rules().unwrap();
        assert_eq!(loaded.len(), 2);
        // Sled iterates in key order
        assert_eq!(loaded[0].0, "6161-6161");
    }

    #[test]
    fn test_delete() {
        let store = SledRuleStorage::open_temporary().unwrap();
        store.save_rule("k", "v").unwrap();
        store.delete_rule("k").unwrap();
        store.delete_rule("k").unwrap();
        assert!(store.load_rules().unwrap().is_empty());
        assert_eq!(store.stats().deletes, 2);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        {
            let store = SledRuleStorage::open(dir.path()).unwrap();
            store.save_rule("k", "v").unwrap();
            store.flush().unwrap();
        }

        let store = SledRuleStorage::open(dir.path()).unwrap();
        assert_eq!(store.load_rules().unwrap(), vec![("k".into(), "v".into())]);
    }
}
