//! Operator kind bitset

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use thiserror::Error;

/// Unknown name in an operator kind string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operator kind: {0}")]
pub struct ParseOpKindError(pub String);

/// Flags describing what an operator touches and why it was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpKind(u32);

impl OpKind {
    /// Transfers leadership
    pub const LEADER: OpKind = OpKind(1 << 0);
    /// Changes the peer set
    pub const REGION: OpKind = OpKind(1 << 1);
    pub const SPLIT: OpKind = OpKind(1 << 2);
    /// Requested by an administrator
    pub const ADMIN: OpKind = OpKind(1 << 3);
    pub const HOT_REGION: OpKind = OpKind(1 << 4);
    /// Touches adjacent regions
    pub const ADJACENT: OpKind = OpKind(1 << 5);
    /// Repairs the replica set
    pub const REPLICA: OpKind = OpKind(1 << 6);
    pub const BALANCE: OpKind = OpKind(1 << 7);
    pub const MERGE: OpKind = OpKind(1 << 8);
    /// Created for a key range
    pub const RANGE: OpKind = OpKind(1 << 9);

    const NAMES: [(OpKind, &'static str); 10] = [
        (OpKind::LEADER, "leader"),
        (OpKind::REGION, "region"),
        (OpKind::SPLIT, "split"),
        (OpKind::ADMIN, "admin"),
        (OpKind::HOT_REGION, "hot-region"),
        (OpKind::ADJACENT, "adjacent"),
        (OpKind::REPLICA, "replica"),
        (OpKind::BALANCE, "balance"),
        (OpKind::MERGE, "merge"),
        (OpKind::RANGE, "range"),
    ];

    pub const fn empty() -> Self {
        OpKind(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether every flag of `other` is set
    pub const fn contains(&self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set
    pub const fn intersects(&self, other: OpKind) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: OpKind) {
        self.0 |= other.0;
    }
}

impl BitOr for OpKind {
    type Output = OpKind;

    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpKind {
    fn bitor_assign(&mut self, rhs: OpKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("unknown");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(","))
    }
}

impl FromStr for OpKind {
    type Err = ParseOpKindError;

    /// Parse a comma separated list of kind names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kind = OpKind::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let flag = Self::NAMES
                .iter()
                .find(|(_, name)| *name == part)
                .map(|(flag, _)| *flag)
                .ok_or_else(|| ParseOpKindError(part.to_string()))?;
            kind |= flag;
        }
        Ok(kind)
    }
}
