//! Expiring id set
//!
//! Tracks region ids for a fixed TTL. Used for recently split regions and
//! for regions waiting on an available store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Set of ids that expire after a fixed TTL
#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, Instant>>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an id, refreshing its deadline if present
    pub fn put(&self, id: u64) {
        self.entries.lock().insert(id, Instant::now() + self.ttl);
    }

    /// Whether the id is present and not expired
    pub fn exists(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&id) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                entries.remove(&id);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    /// Live ids, sorted
    pub fn ids(&self) -> Vec<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, deadline| *deadline > now);
        let mut ids: Vec<u64> = entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
