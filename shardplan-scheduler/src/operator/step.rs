//! Operator steps
//!
//! A step is a plain value. Whether it finished is decided only from the
//! region as currently reported, so checking is idempotent and survives
//! restarts of the executor.

use super::influence::OpInfluence;
use shardplan_core::codec::hex_key;
use shardplan_core::{LimitType, Region, RegionMeta};
use std::fmt;
use tracing::warn;

/// How a region picks its split keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Scan the data for the middle key
    Scan,
    /// Use the approximate middle from size estimates
    Approximate,
    /// Split at the given keys
    UseKey,
}

impl SplitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitPolicy::Scan => "SCAN",
            SplitPolicy::Approximate => "APPROXIMATE",
            SplitPolicy::UseKey => "USEKEY",
        }
    }
}

impl fmt::Display for SplitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configuration change sent to a region
#[derive(Debug, Clone, PartialEq)]
pub enum OpStep {
    TransferLeader {
        from_store: u64,
        to_store: u64,
    },
    AddLearner {
        to_store: u64,
        peer_id: u64,
    },
    /// Same as `AddLearner` but without charging the store limit
    AddLightLearner {
        to_store: u64,
        peer_id: u64,
    },
    PromoteLearner {
        to_store: u64,
        peer_id: u64,
    },
    RemovePeer {
        from_store: u64,
    },
    MergeRegion {
        from_region: RegionMeta,
        to_region: RegionMeta,
        /// The absorbed side waits for its range to change
        is_passive: bool,
    },
    SplitRegion {
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        policy: SplitPolicy,
        split_keys: Vec<Vec<u8>>,
    },
}

impl OpStep {
    /// Whether the region already reflects this step
    pub fn is_finish(&self, region: &Region) -> bool {
        match self {
            OpStep::TransferLeader { to_store, .. } => region.leader_store_id() == Some(*to_store),
            OpStep::AddLearner { to_store, peer_id } | OpStep::AddLightLearner { to_store, peer_id } => {
                match region.get_store_learner(*to_store) {
                    Some(learner) if learner.id != *peer_id => {
                        warn!(
                            region_id = region.id,
                            expected = peer_id,
                            actual = learner.id,
                            "Obtained unexpected learner peer"
                        );
                        false
                    }
                    Some(learner) => !region.is_pending(learner.id),
                    None => false,
                }
            }
            OpStep::PromoteLearner { to_store, peer_id } => match region.get_store_voter(*to_store) {
                Some(voter) => {
                    if voter.id != *peer_id {
                        warn!(
                            region_id = region.id,
                            expected = peer_id,
                            actual = voter.id,
                            "Obtained unexpected voter peer"
                        );
                    }
                    voter.id == *peer_id
                }
                None => false,
            },
            OpStep::RemovePeer { from_store } => region.get_store_peer(*from_store).is_none(),
            OpStep::MergeRegion {
                to_region,
                is_passive,
                ..
            } => {
                *is_passive
                    && (region.start_key != to_region.start_key || region.end_key != to_region.end_key)
            }
            OpStep::SplitRegion {
                start_key, end_key, ..
            } => region.start_key != *start_key || region.end_key != *end_key,
        }
    }

    /// 1 if this step's conf change is visible in the region, else 0
    pub fn conf_ver_changed(&self, region: &Region) -> u64 {
        let changed = match self {
            OpStep::AddLearner { to_store, peer_id } | OpStep::AddLightLearner { to_store, peer_id } => {
                region.get_store_learner(*to_store).map(|p| p.id) == Some(*peer_id)
            }
            OpStep::PromoteLearner { to_store, peer_id } => {
                region.get_store_voter(*to_store).map(|p| p.id) == Some(*peer_id)
            }
            OpStep::RemovePeer { from_store } => region.get_store_peer(*from_store).is_none(),
            OpStep::TransferLeader { .. } | OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } => false,
        };
        changed as u64
    }

    /// Add this step's effect on store counters
    pub fn influence(&self, inf: &mut OpInfluence, region: &Region) {
        let region_size = region.approximate_size;
        match self {
            OpStep::TransferLeader { from_store, to_store } => {
                let from = inf.store_mut(*from_store);
                from.leader_size -= region_size;
                from.leader_count -= 1;
                let to = inf.store_mut(*to_store);
                to.leader_size += region_size;
                to.leader_count += 1;
            }
            OpStep::AddLearner { to_store, .. } => {
                let to = inf.store_mut(*to_store);
                to.region_size += region_size;
                to.region_count += 1;
                to.adjust_step_cost(LimitType::AddPeer, region_size);
            }
            OpStep::AddLightLearner { to_store, .. } => {
                let to = inf.store_mut(*to_store);
                to.region_size += region_size;
                to.region_count += 1;
            }
            OpStep::PromoteLearner { .. } => {}
            OpStep::RemovePeer { from_store } => {
                let from = inf.store_mut(*from_store);
                from.region_size -= region_size;
                from.region_count -= 1;
                from.adjust_step_cost(LimitType::RemovePeer, region_size);
            }
            OpStep::MergeRegion { is_passive, .. } => {
                if *is_passive {
                    let leader = region.leader_store_id();
                    for peer in &region.peers {
                        let store = inf.store_mut(peer.store_id);
                        store.region_count -= 1;
                        if leader == Some(peer.store_id) {
                            store.leader_count -= 1;
                        }
                    }
                }
            }
            OpStep::SplitRegion { .. } => {
                let leader = region.leader_store_id();
                for peer in &region.peers {
                    let store = inf.store_mut(peer.store_id);
                    store.region_count += 1;
                    if leader == Some(peer.store_id) {
                        store.leader_count += 1;
                    }
                }
            }
        }
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::TransferLeader { from_store, to_store } => {
                write!(f, "transfer leader from store {} to store {}", from_store, to_store)
            }
            OpStep::AddLearner { to_store, peer_id } => {
                write!(f, "add learner peer {} on store {}", peer_id, to_store)
            }
            OpStep::AddLightLearner { to_store, peer_id } => {
                write!(f, "add light learner peer {} on store {}", peer_id, to_store)
            }
            OpStep::PromoteLearner { to_store, peer_id } => {
                write!(f, "promote learner peer {} on store {} to voter", peer_id, to_store)
            }
            OpStep::RemovePeer { from_store } => write!(f, "remove peer on store {}", from_store),
            OpStep::MergeRegion {
                from_region,
                to_region,
                is_passive,
            } => {
                if *is_passive {
                    write!(f, "merge region {} into region {} (passive)", from_region.id, to_region.id)
                } else {
                    write!(f, "merge region {} into region {}", from_region.id, to_region.id)
                }
            }
            OpStep::SplitRegion {
                policy, split_keys, ..
            } => {
                write!(f, "split region with policy {}", policy)?;
                if !split_keys.is_empty() {
                    let keys: Vec<String> = split_keys.iter().map(|k| hex_key(k)).collect();
                    write!(f, " and keys [{}]", keys.join(","))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplan_core::Peer;

    fn region() -> Region {
        let leader = Peer::voter(11, 1);
        Region::new(
            1,
            b"a",
            b"z",
            vec![leader, Peer::voter(12, 2), Peer::learner(13, 3)],
            Some(leader),
        )
        .with_approximate(50, 1000)
    }

    #[test]
    fn test_add_learner_finish() {
        let mut r = region();
        let step = OpStep::AddLearner { to_store: 3, peer_id: 13 };
        assert!(step.is_finish(&r));
        assert!(step.is_finish(&r));

        r.pending_peers.push(Peer::learner(13, 3));
        assert!(!step.is_finish(&r));

        let wrong_id = OpStep::AddLearner { to_store: 3, peer_id: 99 };
        assert!(!wrong_id.is_finish(&region()));
        assert!(!OpStep::AddLightLearner { to_store: 4, peer_id: 14 }.is_finish(&region()));
    }

    #[test]
    fn test_promote_remove_transfer_finish() {
        let r = region();
        assert!(!OpStep::PromoteLearner { to_store: 3, peer_id: 13 }.is_finish(&r));
        assert!(OpStep::PromoteLearner { to_store: 2, peer_id: 12 }.is_finish(&r));
        assert!(OpStep::RemovePeer { from_store: 4 }.is_finish(&r));
        assert!(!OpStep::RemovePeer { from_store: 2 }.is_finish(&r));
        assert!(OpStep::TransferLeader { from_store: 2, to_store: 1 }.is_finish(&r));
        assert!(!OpStep::TransferLeader { from_store: 1, to_store: 2 }.is_finish(&r));
    }

    #[test]
    fn test_merge_and_split_finish() {
        let r = region();
        let active = OpStep::MergeRegion {
            from_region: r.meta(),
            to_region: r.meta(),
            is_passive: false,
        };
        let mut widened = r.clone();
        widened.start_key = Vec::new();
        assert!(!active.is_finish(&widened));

        let passive = OpStep::MergeRegion {
            from_region: r.meta(),
            to_region: r.meta(),
            is_passive: true,
        };
        assert!(!passive.is_finish(&r));
        assert!(passive.is_finish(&widened));

        let split = OpStep::SplitRegion {
            start_key: b"a".to_vec(),
            end_key: b"z".to_vec(),
            policy: SplitPolicy::Scan,
            split_keys: Vec::new(),
        };
        assert!(!split.is_finish(&r));
        let mut narrowed = r.clone();
        narrowed.end_key = b"m".to_vec();
        assert!(split.is_finish(&narrowed));
    }

    #[test]
    fn test_influence() {
        let r = region();
        let mut inf = OpInfluence::new();
        OpStep::AddLearner { to_store: 4, peer_id: 14 }.influence(&mut inf, &r);
        OpStep::RemovePeer { from_store: 2 }.influence(&mut inf, &r);
        OpStep::TransferLeader { from_store: 1, to_store: 4 }.influence(&mut inf, &r);
        OpStep::PromoteLearner { to_store: 4, peer_id: 14 }.influence(&mut inf, &r);

        let to = inf.get(4).unwrap();
        assert_eq!((to.region_size, to.region_count), (50, 1));
        assert_eq!((to.leader_size, to.leader_count), (50, 1));
        assert_eq!(to.step_cost(LimitType::AddPeer), 1000);

        let removed = inf.get(2).unwrap();
        assert_eq!((removed.region_size, removed.region_count), (-50, -1));
        assert_eq!(removed.step_cost(LimitType::RemovePeer), 1000);

        assert_eq!(inf.get(1).unwrap().leader_count, -1);
    }

    #[test]
    fn test_light_learner_has_no_step_cost() {
        let r = region();
        let mut inf = OpInfluence::new();
        OpStep::AddLightLearner { to_store: 4, peer_id: 14 }.influence(&mut inf, &r);
        let to = inf.get(4).unwrap();
        assert_eq!(to.region_count, 1);
        assert_eq!(to.step_cost(LimitType::AddPeer), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            OpStep::TransferLeader { from_store: 1, to_store: 2 }.to_string(),
            "transfer leader from store 1 to store 2"
        );
        let split = OpStep::SplitRegion {
            start_key: Vec::new(),
            end_key: Vec::new(),
            policy: SplitPolicy::UseKey,
            split_keys: vec![b"a".to_vec(), b"b".to_vec()],
        };
        assert_eq!(split.to_string(), "split region with policy USEKEY and keys [61,62]");
    }
}
