//! Shardplan Placement Rule Engine
//!
//! Decides where the replicas of a key range should live:
//! - `Rule`: range-scoped replica policy (role, count, label constraints)
//! - `RuleList`: range index derived from all rules
//! - `fit_region`: assigns region peers to rules, leftovers become orphans
//! - `RuleManager`: persisted, lock-guarded rule CRUD

pub mod error;
pub mod fit;
pub mod label_constraint;
pub mod rule;
pub mod rule_list;
pub mod rule_manager;

pub use error::{Result, RuleError};
pub use fit::{compare_region_fit, fit_region, RegionFit, RuleFit};
pub use label_constraint::{match_label_constraints, LabelConstraint, LabelConstraintOp};
pub use rule::{rule_store_key, PeerRoleType, Rule, DEFAULT_GROUP_ID, DEFAULT_RULE_ID};
pub use rule_list::RuleList;
pub use rule_manager::{RuleManager, RuleOp};
