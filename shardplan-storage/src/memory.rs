//! In-memory rule storage
//!
//! Used for testing and development. Not persistent.

use crate::backend::{RuleStorage, StorageStats};
use parking_lot::RwLock;
use shardplan_core::error::{Result, ShardplanError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory rule storage
pub struct MemoryRuleStorage {
    /// Rule documents by key
    rules: RwLock<BTreeMap<String, String>>,

    /// Fail every write, to exercise rollback paths
    fail_writes: AtomicBool,

    /// Writes left before a single injected failure, 0 when disarmed
    fail_countdown: AtomicU64,

    /// Operation counters
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryRuleStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_countdown: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Make subsequent saves and deletes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only the `n`-th next write (0-based); later writes succeed
    pub fn fail_nth_write(&self, n: u64) {
        self.fail_countdown.store(n + 1, Ordering::SeqCst);
    }

    /// Insert a raw document, bypassing failure injection
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.rules.write().insert(key.into(), value.into());
    }

    /// Get a stored document
    pub fn get(&self, key: &str) -> Option<String> {
        self.rules.read().get(key).cloned()
    }

    /// Stored keys in order
    pub fn keys(&self) -> Vec<String> {
        self.rules.read().keys().cloned().collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ShardplanError::Storage("injected write failure".into()));
        }
        let armed = self
            .fail_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if armed == Ok(1) {
            return Err(ShardplanError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryRuleStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStorage for MemoryRuleStorage {
    fn save_rule(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.rules.write().insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete_rule(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.rules.write().remove(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_rules(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .rules
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            rule_count: self.rules.read().len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}
