//! Operator status machine
//!
//! `Created -> {Started, Canceled, Expired}`
//! `Started -> {Success, Canceled, Replaced, Timeout}`
//!
//! Every other status is terminal. The tracker keeps the current status and
//! the time each status was reached in atomics. Only the executor driving an
//! operator may move it; readers never block.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

/// Lifecycle status of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpStatus {
    Created = 0,
    Started = 1,
    Success = 2,
    Canceled = 3,
    Replaced = 4,
    Expired = 5,
    Timeout = 6,
}

impl OpStatus {
    pub const ALL: [OpStatus; 7] = [
        OpStatus::Created,
        OpStatus::Started,
        OpStatus::Success,
        OpStatus::Canceled,
        OpStatus::Replaced,
        OpStatus::Expired,
        OpStatus::Timeout,
    ];

    fn from_u8(v: u8) -> OpStatus {
        Self::ALL.get(v as usize).copied().unwrap_or(OpStatus::Created)
    }

    /// Whether no transition leaves this status
    pub fn is_end(&self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Created => "CREATED",
            OpStatus::Started => "STARTED",
            OpStatus::Success => "SUCCESS",
            OpStatus::Canceled => "CANCELED",
            OpStatus::Replaced => "REPLACED",
            OpStatus::Expired => "EXPIRED",
            OpStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` appears in the transition table
pub fn is_valid_transition(from: OpStatus, to: OpStatus) -> bool {
    use OpStatus::*;
    matches!(
        (from, to),
        (Created, Started | Canceled | Expired) | (Started, Success | Canceled | Replaced | Timeout)
    )
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Lock-free status holder with per-status reach times
#[derive(Debug)]
pub struct StatusTracker {
    current: AtomicU8,
    /// Unix micros, 0 when never reached
    reach_times: [AtomicI64; 7],
}

impl StatusTracker {
    /// Start in `Created`, reached now
    pub fn new() -> Self {
        let tracker = Self {
            current: AtomicU8::new(OpStatus::Created as u8),
            reach_times: Default::default(),
        };
        tracker.reach_times[OpStatus::Created as usize].store(now_micros(), Ordering::SeqCst);
        tracker
    }

    pub fn status(&self) -> OpStatus {
        OpStatus::from_u8(self.current.load(Ordering::SeqCst))
    }

    /// Time the status was reached, if ever
    pub fn reach_time_of(&self, status: OpStatus) -> Option<DateTime<Utc>> {
        match self.reach_times[status as usize].load(Ordering::SeqCst) {
            0 => None,
            micros => Utc.timestamp_micros(micros).single(),
        }
    }

    /// Time spent since the status was reached, zero if never reached
    pub fn since(&self, status: OpStatus) -> Duration {
        match self.reach_times[status as usize].load(Ordering::SeqCst) {
            0 => Duration::ZERO,
            micros => Duration::from_micros((now_micros() - micros).max(0) as u64),
        }
    }

    /// Move to `to`; returns false and changes nothing if the table forbids it
    pub fn to(&self, to: OpStatus) -> bool {
        let from = self.status();
        if !is_valid_transition(from, to) {
            return false;
        }
        if self
            .current
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.reach_times[to as usize].store(now_micros(), Ordering::SeqCst);
        true
    }

    pub fn is_end(&self) -> bool {
        self.status().is_end()
    }

    /// Expire a created operator that waited longer than `expire_time`
    pub fn check_expired(&self, expire_time: Duration) -> bool {
        if self.status() == OpStatus::Created && self.since(OpStatus::Created) >= expire_time {
            self.to(OpStatus::Expired);
        }
        self.status() == OpStatus::Expired
    }

    /// Time out a started operator that ran longer than `wait_time`
    pub fn check_timeout(&self, wait_time: Duration) -> bool {
        if self.status() == OpStatus::Started && self.since(OpStatus::Started) >= wait_time {
            self.to(OpStatus::Timeout);
        }
        self.status() == OpStatus::Timeout
    }

    #[cfg(test)]
    pub(crate) fn shift_reach_time(&self, status: OpStatus, back: Duration) {
        self.reach_times[status as usize].fetch_sub(back.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
