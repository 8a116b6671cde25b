//! Sequence numbers and gaps.
//!
//! Sequence numbers are unsigned 64-bit counters compared serially: `a < b`
//! when the signed distance from `b` to `a` is negative. Arithmetic wraps, so a
//! stream may run through `u64::MAX` without reordering.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A wrap-aware 64-bit sequence number.
///
/// Ordering is only meaningful between numbers less than 2^63 apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Distance from `earlier` up to `self`, zero if `earlier` is not behind.
    pub fn since(self, earlier: SeqNo) -> u64 {
        if self > earlier {
            self.0.wrapping_sub(earlier.0)
        } else {
            0
        }
    }
}

impl Ord for SeqNo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl PartialOrd for SeqNo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<u64> for SeqNo {
    type Output = SeqNo;

    fn add(self, rhs: u64) -> SeqNo {
        SeqNo(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u64> for SeqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u64> for SeqNo {
    type Output = SeqNo;

    fn sub(self, rhs: u64) -> SeqNo {
        SeqNo(self.0.wrapping_sub(rhs))
    }
}

/// Raw wrapping distance; callers compare first.
impl Sub<SeqNo> for SeqNo {
    type Output = u64;

    fn sub(self, rhs: SeqNo) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl From<u64> for SeqNo {
    fn from(n: u64) -> Self {
        SeqNo(n)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A half-open range `[start, start + len)` of missing sequence numbers.
///
/// The empty gap is canonical: `Gap::default()`, which is what every empty
/// range normalizes to, so gaps can be compared with `==`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gap {
    start: SeqNo,
    len: u64,
}

impl Gap {
    /// The range `[start, end)`; empty if `end` is not after `start`.
    pub fn new(start: SeqNo, end: SeqNo) -> Self {
        Self::with_len(start, end.since(start))
    }

    pub fn with_len(start: SeqNo, len: u64) -> Self {
        if len == 0 {
            Self::default()
        } else {
            Self { start, len }
        }
    }

    pub fn start(&self) -> SeqNo {
        self.start
    }

    pub fn end(&self) -> SeqNo {
        self.start + self.len
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, seq_no: SeqNo) -> bool {
        !self.is_empty() && seq_no >= self.start && seq_no < self.end()
    }

    /// The smallest gap covering both `self` and `other`.
    pub fn union(self, other: Gap) -> Gap {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Gap::new(start, end)
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}
