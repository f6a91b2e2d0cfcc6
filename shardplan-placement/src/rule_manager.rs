//! Rule manager
//!
//! Owns the persisted rule set and its range index. All state lives in one
//! struct behind a single reader/writer lock:
//! - Readers see a rule map and an index built from exactly that map
//! - Writers validate, rebuild the index, persist, and only then publish
//! - Any failure leaves the published state untouched

use crate::error::{Result, RuleError};
use crate::fit::{fit_region, RegionFit};
use crate::rule::{compare_rule, rule_store_key, Rule};
use crate::rule_list::RuleList;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardplan_core::{Region, StoreSet};
use shardplan_storage::RuleStorage;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

type RuleKey = (String, String);

/// One step of a batch update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RuleOp {
    /// Insert or replace a rule
    Add(Rule),
    /// Delete a rule, or every rule of the group whose id starts with `id`
    #[serde(rename = "del")]
    Delete {
        group_id: String,
        id: String,
        #[serde(default)]
        delete_by_id_prefix: bool,
    },
}

#[derive(Default)]
struct RuleState {
    initialized: bool,
    rules: BTreeMap<RuleKey, Arc<Rule>>,
    rule_list: RuleList,
}

/// Pending changes computed against a copy of the rule map
struct Patch {
    rules: BTreeMap<RuleKey, Arc<Rule>>,
    /// Keys whose persisted value must change; `None` means delete
    dirty: BTreeMap<RuleKey, Option<Arc<Rule>>>,
}

impl Patch {
    fn new(rules: &BTreeMap<RuleKey, Arc<Rule>>) -> Self {
        Self {
            rules: rules.clone(),
            dirty: BTreeMap::new(),
        }
    }

    fn set_rule(&mut self, rule: Rule) {
        let rule = Arc::new(rule);
        self.rules.insert(rule.key(), rule.clone());
        self.dirty.insert(rule.key(), Some(rule));
    }

    fn delete_rule(&mut self, group_id: &str, id: &str) {
        let key = (group_id.to_string(), id.to_string());
        self.rules.remove(&key);
        self.dirty.insert(key, None);
    }
}

/// Persisted placement rule manager
pub struct RuleManager {
    storage: Arc<dyn RuleStorage>,
    state: RwLock<RuleState>,
}

impl RuleManager {
    /// Create a manager; call [`RuleManager::initialize`] before use
    pub fn new(storage: Arc<dyn RuleStorage>) -> Self {
        Self {
            storage,
            state: RwLock::new(RuleState::default()),
        }
    }

    /// Load persisted rules, seeding the default rule when none exist
    pub fn initialize(&self, max_replicas: usize, location_labels: Vec<String>) -> Result<()> {
        let mut state = self.state.write();
        if state.initialized {
            return Ok(());
        }

        let mut rules = self.load_rules()?;
        if rules.is_empty() {
            let rule = Rule::default_rule(max_replicas, location_labels);
            self.storage.save_rule(&rule.store_key(), &rule.to_json()?)?;
            info!(rule = %rule, "Seeded default placement rule");
            rules.insert(rule.key(), Arc::new(rule));
        }

        state.rule_list = RuleList::build(&rules)?;
        state.rules = rules;
        state.initialized = true;

        info!(rules = state.rules.len(), "Rule manager initialized");
        Ok(())
    }

    /// Read every persisted rule, repairing the storage on the way.
    ///
    /// Undecodable, invalid and duplicated entries are deleted. Entries stored
    /// under the wrong key are moved to the right one.
    fn load_rules(&self) -> Result<BTreeMap<RuleKey, Arc<Rule>>> {
        let mut rules = BTreeMap::new();
        let mut to_save = Vec::new();
        let mut to_delete = Vec::new();

        for (key, value) in self.storage.load_rules()? {
            let rule = match Rule::from_json(&value) {
                Ok(rule) => rule,
                Err(e) => {
                    error!(key = %key, error = %e, "Dropping corrupt placement rule");
                    to_delete.push(key);
                    continue;
                }
            };
            if rules.contains_key(&rule.key()) {
                error!(key = %key, rule = %rule, "Dropping duplicated placement rule");
                to_delete.push(key);
                continue;
            }
            if key != rule.store_key() {
                warn!(key = %key, expected = %rule.store_key(), "Placement rule stored under mismatched key");
                to_delete.push(key);
                to_save.push(rule.clone());
            }
            rules.insert(rule.key(), Arc::new(rule));
        }

        for key in &to_delete {
            self.storage.delete_rule(key)?;
        }
        for rule in &to_save {
            self.storage.save_rule(&rule.store_key(), &rule.to_json()?)?;
        }
        Ok(rules)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn get_rule(&self, group_id: &str, id: &str) -> Option<Arc<Rule>> {
        self.state
            .read()
            .rules
            .get(&(group_id.to_string(), id.to_string()))
            .cloned()
    }

    /// Insert or replace a rule
    pub fn set_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let desc = rule.to_string();

        let mut state = self.state.write();
        let mut patch = Patch::new(&state.rules);
        patch.set_rule(rule);
        self.commit(&mut state, patch)?;

        info!(rule = %desc, "Placement rule updated");
        Ok(())
    }

    /// Delete a rule; deleting a missing rule succeeds
    pub fn delete_rule(&self, group_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let mut patch = Patch::new(&state.rules);
        patch.delete_rule(group_id, id);
        self.commit(&mut state, patch)?;

        info!(group_id = %group_id, id = %id, "Placement rule removed");
        Ok(())
    }

    /// Apply several changes atomically
    pub fn batch(&self, ops: Vec<RuleOp>) -> Result<()> {
        for op in &ops {
            if let RuleOp::Add(rule) = op {
                rule.validate()?;
            }
        }

        let mut state = self.state.write();
        let mut patch = Patch::new(&state.rules);
        let count = ops.len();
        for op in ops {
            match op {
                RuleOp::Add(rule) => patch.set_rule(rule),
                RuleOp::Delete {
                    group_id,
                    id,
                    delete_by_id_prefix: false,
                } => patch.delete_rule(&group_id, &id),
                RuleOp::Delete {
                    group_id,
                    id,
                    delete_by_id_prefix: true,
                } => {
                    let matched: Vec<RuleKey> = patch
                        .rules
                        .keys()
                        .filter(|(g, i)| *g == group_id && i.starts_with(&id))
                        .cloned()
                        .collect();
                    for (g, i) in matched {
                        patch.delete_rule(&g, &i);
                    }
                }
            }
        }
        self.commit(&mut state, patch)?;

        info!(ops = count, "Placement rules updated in batch");
        Ok(())
    }

    /// Rebuild the index, persist the dirty keys and publish
    fn commit(&self, state: &mut RuleState, patch: Patch) -> Result<()> {
        if !state.initialized {
            return Err(RuleError::NotInitialized);
        }

        let rule_list = RuleList::build(&patch.rules)?;

        let mut written: Vec<&RuleKey> = Vec::new();
        for (key, value) in &patch.dirty {
            let store_key = rule_store_key(&key.0, &key.1);
            let res = match value {
                Some(rule) => rule.to_json().and_then(|json| Ok(self.storage.save_rule(&store_key, &json)?)),
                None => Ok(self.storage.delete_rule(&store_key)?),
            };
            if let Err(e) = res {
                self.restore(&state.rules, &written);
                return Err(e);
            }
            written.push(key);
        }

        state.rules = patch.rules;
        state.rule_list = rule_list;
        Ok(())
    }

    /// Best-effort rewrite of already persisted keys after a failed commit
    fn restore(&self, rules: &BTreeMap<RuleKey, Arc<Rule>>, written: &[&RuleKey]) {
        for key in written {
            let store_key = rule_store_key(&key.0, &key.1);
            let res = match rules.get(*key) {
                Some(rule) => rule
                    .to_json()
                    .and_then(|json| Ok(self.storage.save_rule(&store_key, &json)?)),
                None => self.storage.delete_rule(&store_key).map_err(RuleError::from),
            };
            if let Err(e) = res {
                error!(key = %store_key, error = %e, "Failed to restore placement rule after failed commit");
            }
        }
    }

    /// Every rule in priority order
    pub fn get_all_rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self.state.read().rules.values().cloned().collect();
        rules.sort_by(|a, b| compare_rule(a, b));
        rules
    }

    pub fn get_rules_by_group(&self, group_id: &str) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = self
            .state
            .read()
            .rules
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| compare_rule(a, b));
        rules
    }

    /// Every rule whose range contains `key`
    pub fn get_rules_by_key(&self, key: &[u8]) -> Vec<Arc<Rule>> {
        self.state.read().rule_list.get_rules_by_key(key)
    }

    /// Rules applied to the region, empty when it spans a rule boundary
    pub fn get_rules_for_apply_region(&self, region: &Region) -> Vec<Arc<Rule>> {
        self.state
            .read()
            .rule_list
            .get_rules_for_apply_region(&region.start_key, &region.end_key)
    }

    /// Rule boundaries strictly inside `(start, end)`
    pub fn get_split_keys(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        self.state.read().rule_list.get_split_keys(start, end)
    }

    /// Fit the region against the rules applied to it
    pub fn fit_region<S: StoreSet + ?Sized>(&self, stores: &S, region: &Region) -> RegionFit {
        let rules = self.get_rules_for_apply_region(region);
        fit_region(stores, region, &rules)
    }
}
