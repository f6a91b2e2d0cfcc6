//! Shardplan Scheduler Library
//!
//! Turns placement decisions into executable operators:
//! - Store filters (state, health, labels, rule fit, isolation)
//! - Operator steps, status tracking and the step planner behind `Builder`
//! - Checkers that fix replica placement, promote learners and merge small regions
//! - An in-memory cluster view loaded from JSON snapshots

pub mod cache;
pub mod checker;
pub mod cluster;
pub mod config;
pub mod filter;
pub mod memory;
pub mod metrics;
pub mod operator;

// Re-export main types
pub use checker::{
    allow_merge, CheckerController, CheckerError, LearnerChecker, MergeChecker, ReplicaStrategy, RuleChecker,
};
pub use cluster::{is_healthy_allow_pending, is_region_healthy, is_region_replicated, ClusterView};
pub use config::{ConfigError, LogFormat, SchedulerConfig};
pub use filter::{
    placement_safeguard, select_source_stores, select_target_stores, Filter, StoreCandidates, StoreStateFilter,
};
pub use memory::{ClusterSnapshot, MemoryCluster};
pub use operator::{
    BuildError, Builder, OpInfluence, OpKind, OpStatus, OpStep, Operator, PriorityLevel, SplitPolicy,
};
