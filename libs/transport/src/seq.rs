//! Wrapping 32-bit sequence numbers, RFC 793 style.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A TCP sequence number. All comparisons are modulo 2^32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(pub u32);

impl Seq {
    /// `self < other` in sequence space.
    pub fn before(self, other: Seq) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }

    /// `self <= other` in sequence space.
    pub fn at_or_before(self, other: Seq) -> bool {
        self == other || self.before(other)
    }

    pub fn after(self, other: Seq) -> bool {
        other.before(self)
    }

    pub fn at_or_after(self, other: Seq) -> bool {
        self == other || self.after(other)
    }

    /// Distance from `earlier` to `self`, assuming `self` is not before it.
    pub fn distance(self, earlier: Seq) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// `lo <= self < hi` in sequence space.
    pub fn in_window(self, lo: Seq, hi: Seq) -> bool {
        self.distance(lo) < hi.distance(lo)
    }
}

impl Add<u32> for Seq {
    type Output = Seq;

    fn add(self, rhs: u32) -> Seq {
        Seq(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for Seq {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for Seq {
    type Output = Seq;

    fn sub(self, rhs: u32) -> Seq {
        Seq(self.0.wrapping_sub(rhs))
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self == other {
            std::cmp::Ordering::Equal
        } else if self.before(*other) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
