//! Placement rules
//!
//! A rule states how many peers of which role must exist for every region
//! overlapping `[start_key, end_key)`, optionally restricted by label
//! constraints and spread over a location label hierarchy.
//!
//! Rules are ordered by `(group_id, index, id)`. Within a group an `override`
//! rule hides every rule sorted before it.

use crate::error::{Result, RuleError};
use crate::label_constraint::LabelConstraint;
use serde::{Deserialize, Serialize};
use shardplan_core::codec::{hex_bytes, hex_key};
use shardplan_core::PeerRole;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Group of the rule seeded on first start
pub const DEFAULT_GROUP_ID: &str = "pd";

/// ID of the rule seeded on first start
pub const DEFAULT_RULE_ID: &str = "default";

/// Role a rule requires of its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRoleType {
    /// Any voter, leader or not
    Voter,
    /// The region leader
    Leader,
    /// A voter that is not the leader
    Follower,
    Learner,
}

impl PeerRoleType {
    /// Peer role used when creating a peer for this rule
    pub fn peer_role(&self) -> PeerRole {
        match self {
            PeerRoleType::Learner => PeerRole::Learner,
            _ => PeerRole::Voter,
        }
    }

    /// Whether a leader may be placed on a peer of this rule
    pub fn allows_leader(&self) -> bool {
        matches!(self, PeerRoleType::Voter | PeerRoleType::Leader)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRoleType::Voter => "voter",
            PeerRoleType::Leader => "leader",
            PeerRoleType::Follower => "follower",
            PeerRoleType::Learner => "learner",
        }
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Placement rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Owner group, e.g. the component that created the rule
    pub group_id: String,

    /// Unique within the group
    pub id: String,

    /// Priority within the group, lower sorts first
    #[serde(default, skip_serializing_if = "is_zero")]
    pub index: i32,

    /// Hide lower-index rules of the same group
    #[serde(default, rename = "override", skip_serializing_if = "is_false")]
    pub override_: bool,

    #[serde(with = "hex_bytes", default)]
    pub start_key: Vec<u8>,

    /// Empty means +inf
    #[serde(with = "hex_bytes", default)]
    pub end_key: Vec<u8>,

    pub role: PeerRoleType,

    pub count: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_constraints: Vec<LabelConstraint>,

    /// Location hierarchy used to spread the rule's peers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_labels: Vec<String>,
}

impl Rule {
    /// Create a whole-keyspace rule
    pub fn new(group_id: impl Into<String>, id: impl Into<String>, role: PeerRoleType, count: usize) -> Self {
        Self {
            group_id: group_id.into(),
            id: id.into(),
            index: 0,
            override_: false,
            start_key: Vec::new(),
            end_key: Vec::new(),
            role,
            count,
            label_constraints: Vec::new(),
            location_labels: Vec::new(),
        }
    }

    /// The default rule seeded when no rule exists
    pub fn default_rule(max_replicas: usize, location_labels: Vec<String>) -> Self {
        Self {
            location_labels,
            ..Self::new(DEFAULT_GROUP_ID, DEFAULT_RULE_ID, PeerRoleType::Voter, max_replicas)
        }
    }

    pub fn with_range(mut self, start_key: &[u8], end_key: &[u8]) -> Self {
        self.start_key = start_key.to_vec();
        self.end_key = end_key.to_vec();
        self
    }

    pub fn with_index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn with_override(mut self, override_: bool) -> Self {
        self.override_ = override_;
        self
    }

    pub fn with_label_constraints(mut self, constraints: Vec<LabelConstraint>) -> Self {
        self.label_constraints = constraints;
        self
    }

    pub fn with_location_labels(mut self, labels: &[&str]) -> Self {
        self.location_labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Identity of the rule
    pub fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.id.clone())
    }

    /// Key under which the rule is persisted
    pub fn store_key(&self) -> String {
        rule_store_key(&self.group_id, &self.id)
    }

    /// Validate the rule content
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(RuleError::InvalidRule("group ID should not be empty".into()));
        }
        if self.id.is_empty() {
            return Err(RuleError::InvalidRule("ID should not be empty".into()));
        }
        if !self.end_key.is_empty() && self.end_key <= self.start_key {
            return Err(RuleError::InvalidRule(format!(
                "endKey {} should be greater than startKey {}",
                hex_key(&self.end_key),
                hex_key(&self.start_key)
            )));
        }
        if self.count == 0 {
            return Err(RuleError::InvalidRule("count should be positive".into()));
        }
        Ok(())
    }

    /// Decode a persisted rule and validate it
    pub fn from_json(data: &str) -> Result<Self> {
        let rule: Rule = serde_json::from_str(data)?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether the rule range overlaps `[start, end)`
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let starts_before_end = end.is_empty() || self.start_key.as_slice() < end;
        let ends_after_start = self.end_key.is_empty() || self.end_key.as_slice() > start;
        starts_before_end && ends_after_start
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}, {}) {}x{}",
            self.group_id,
            self.id,
            hex_key(&self.start_key),
            hex_key(&self.end_key),
            self.role.as_str(),
            self.count
        )
    }
}

/// Persisted key of a rule: `hex(group_id)-hex(id)`
pub fn rule_store_key(group_id: &str, id: &str) -> String {
    format!("{}-{}", hex::encode(group_id), hex::encode(id))
}

/// Priority order of rules: group, then index, then id
pub fn compare_rule(a: &Rule, b: &Rule) -> Ordering {
    a.group_id
        .cmp(&b.group_id)
        .then(a.index.cmp(&b.index))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_rules(rules: &mut [Arc<Rule>]) {
    rules.sort_by(|a, b| compare_rule(a, b));
}

/// Sort rules and drop those hidden by an `override` rule of the same group
pub fn prepare_rules_for_apply(mut rules: Vec<Arc<Rule>>) -> Vec<Arc<Rule>> {
    sort_rules(&mut rules);

    let mut res = Vec::with_capacity(rules.len());
    let mut group_start = 0;
    for i in 1..rules.len() {
        if rules[group_start].group_id != rules[i].group_id {
            res.extend_from_slice(&rules[group_start..i]);
            group_start = i;
        }
        if rules[i].override_ {
            group_start = i;
        }
    }
    if !rules.is_empty() {
        res.extend_from_slice(&rules[group_start..]);
    }
    res
}
