//! Label constraints
//!
//! A constraint restricts which stores a rule may place peers on, based on a
//! single store label.

use serde::{Deserialize, Serialize};
use shardplan_core::Store;

/// Constraint operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelConstraintOp {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notIn")]
    NotIn,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "notExists")]
    NotExists,
}

impl LabelConstraintOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelConstraintOp::In => "in",
            LabelConstraintOp::NotIn => "notIn",
            LabelConstraintOp::Exists => "exists",
            LabelConstraintOp::NotExists => "notExists",
        }
    }
}

/// Store label constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelConstraint {
    pub key: String,
    pub op: LabelConstraintOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelConstraint {
    pub fn new(key: impl Into<String>, op: LabelConstraintOp, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            op,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Whether the store satisfies this constraint
    pub fn match_store(&self, store: &Store) -> bool {
        let label = store.get_label_value(&self.key);
        match self.op {
            LabelConstraintOp::In => !label.is_empty() && self.values.iter().any(|v| v == label),
            LabelConstraintOp::NotIn => label.is_empty() || self.values.iter().all(|v| v != label),
            LabelConstraintOp::Exists => !label.is_empty(),
            LabelConstraintOp::NotExists => label.is_empty(),
        }
    }
}

/// Whether a store satisfies every constraint; a missing store never matches
pub fn match_label_constraints(store: Option<&Store>, constraints: &[LabelConstraint]) -> bool {
    match store {
        Some(store) => constraints.iter().all(|c| c.match_store(store)),
        None => false,
    }
}
