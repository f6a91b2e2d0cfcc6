//! Region model
//!
//! A region is a contiguous key range `[start_key, end_key)` replicated as a
//! set of peers, at most one per store. An empty end key means +inf.

use crate::codec::hex_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Peer role in the replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    #[default]
    Voter,
    Learner,
}

/// One replica of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
    #[serde(default)]
    pub role: PeerRole,
}

impl Peer {
    pub fn voter(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: u64, store_id: u64) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }
}

/// A peer reported down by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownPeer {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// Optimistic concurrency version of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegionEpoch {
    /// Bumped by membership changes
    pub conf_ver: u64,
    /// Bumped by splits and merges
    pub version: u64,
}

/// Identity and range of a region, as carried by merge steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMeta {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

/// Region as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: u64,

    #[serde(with = "hex_bytes", default)]
    pub start_key: Vec<u8>,

    #[serde(with = "hex_bytes", default)]
    pub end_key: Vec<u8>,

    #[serde(default)]
    pub epoch: RegionEpoch,

    pub peers: Vec<Peer>,

    /// Leader peer, `None` until the first heartbeat
    #[serde(default)]
    pub leader: Option<Peer>,

    #[serde(default)]
    pub down_peers: Vec<DownPeer>,

    #[serde(default)]
    pub pending_peers: Vec<Peer>,

    /// Approximate size in MiB
    #[serde(default)]
    pub approximate_size: i64,

    #[serde(default)]
    pub approximate_keys: i64,
}

impl Region {
    /// Create a region; the leader must be one of `peers`
    pub fn new(id: u64, start_key: &[u8], end_key: &[u8], peers: Vec<Peer>, leader: Option<Peer>) -> Self {
        Self {
            id,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            epoch: RegionEpoch::default(),
            peers,
            leader,
            down_peers: Vec::new(),
            pending_peers: Vec::new(),
            approximate_size: 0,
            approximate_keys: 0,
        }
    }

    /// Set approximate size and key count
    pub fn with_approximate(mut self, size: i64, keys: i64) -> Self {
        self.approximate_size = size;
        self.approximate_keys = keys;
        self
    }

    pub fn get_peer(&self, peer_id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn get_store_peer(&self, store_id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn get_store_voter(&self, store_id: u64) -> Option<&Peer> {
        self.get_store_peer(store_id).filter(|p| !p.is_learner())
    }

    pub fn get_store_learner(&self, store_id: u64) -> Option<&Peer> {
        self.get_store_peer(store_id).filter(|p| p.is_learner())
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| !p.is_learner())
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_learner())
    }

    /// Voters other than the leader
    pub fn followers(&self) -> impl Iterator<Item = &Peer> {
        let leader = self.leader.map(|l| l.id);
        self.voters().filter(move |p| Some(p.id) != leader)
    }

    pub fn has_learners(&self) -> bool {
        self.learners().next().is_some()
    }

    pub fn leader_store_id(&self) -> Option<u64> {
        self.leader.map(|l| l.store_id)
    }

    pub fn get_store_ids(&self) -> BTreeSet<u64> {
        self.peers.iter().map(|p| p.store_id).collect()
    }

    pub fn get_down_peer(&self, peer_id: u64) -> Option<&DownPeer> {
        self.down_peers.iter().find(|d| d.peer.id == peer_id)
    }

    pub fn get_pending_peer(&self, peer_id: u64) -> Option<&Peer> {
        self.pending_peers.iter().find(|p| p.id == peer_id)
    }

    pub fn is_pending(&self, peer_id: u64) -> bool {
        self.get_pending_peer(peer_id).is_some()
    }

    /// Identity and range snapshot
    pub fn meta(&self) -> RegionMeta {
        RegionMeta {
            id: self.id,
            start_key: self.start_key.clone(),
            end_key: self.end_key.clone(),
            epoch: self.epoch,
            peers: self.peers.clone(),
        }
    }

    /// Copy of the region with the peer on `old_store` moved to `new_store`.
    ///
    /// Used to evaluate placement rules against a hypothetical layout.
    pub fn with_replaced_peer_store(&self, old_store: u64, new_store: u64) -> Region {
        let mut region = self.clone();
        for peer in region.peers.iter_mut() {
            if peer.store_id == old_store {
                peer.store_id = new_store;
            }
        }
        if let Some(leader) = region.leader.as_mut() {
            if leader.store_id == old_store {
                leader.store_id = new_store;
            }
        }
        region.down_peers.clear();
        region.pending_peers.clear();
        region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(
            1,
            b"a",
            b"z",
            vec![Peer::voter(10, 1), Peer::voter(11, 2), Peer::learner(12, 3)],
            Some(Peer::voter(10, 1)),
        )
    }

    #[test]
    fn test_peer_accessors() {
        let r = region();
        assert_eq!(r.get_store_voter(1).map(|p| p.id), Some(10));
        assert!(r.get_store_voter(3).is_none());
        assert_eq!(r.get_store_learner(3).map(|p| p.id), Some(12));
        assert_eq!(r.followers().map(|p| p.id).collect::<Vec<_>>(), vec![11]);
        assert_eq!(r.get_store_ids().into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(r.has_learners());
    }

    #[test]
    fn test_replace_peer_store() {
        let r = region().with_replaced_peer_store(1, 9);
        assert_eq!(r.get_store_peer(9).map(|p| p.id), Some(10));
        assert_eq!(r.leader_store_id(), Some(9));
        assert!(r.get_store_peer(1).is_none());
    }

    #[test]
    fn test_region_json_uses_hex_keys() {
        let r = region();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["start_key"], "61");
        assert_eq!(json["end_key"], "7a");

        let back: Region = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
