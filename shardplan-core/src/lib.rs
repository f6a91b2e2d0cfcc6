//! Shardplan Core Library
//!
//! Data model shared by every shardplan crate:
//! - Stores (storage nodes) with labels, liveness and load counters
//! - Regions (replicated key ranges) with their peers and epochs
//! - Scheduling options read by filters, checkers and the operator builder
//! - Key codec helpers (hex serde, memcomparable bytes, table ids)

pub mod codec;
pub mod error;
pub mod options;
pub mod region;
pub mod store;

pub use error::{Result, ShardplanError};
pub use options::{KeyType, ScheduleOptions};
pub use region::{DownPeer, Peer, PeerRole, Region, RegionEpoch, RegionMeta};
pub use store::{distinct_score, LimitType, Store, StoreLabel, StoreSet, StoreState};

/// Empty regions report this size (MiB) until their first split
pub const EMPTY_REGION_APPROXIMATE_SIZE: i64 = 1;
