// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Coordination-free kernel ID generation.
//!
//! Each listening server owns a contiguous slice of the 64-bit ID space
//! derived from its address's rank within its subnet; IDs are globally
//! unique as long as subnet membership is stable. The generator starts
//! unbounded and is narrowed when the first server is added. Zero is
//! never produced: it means "unassigned" on the wire.

use parking_lot::Mutex;

/// IDs below this are reserved for well-known instances (the main
/// kernel is always 1); the generator never produces them.
pub const RESERVED_IDS: u64 = 16;

#[derive(Debug)]
struct IdRange {
    next: u64,
    lo: u64,
    hi: u64,
}

/// Monotone counter wrapped to a half-open range `[lo, hi)`.
#[derive(Debug)]
pub struct IdGenerator {
    inner: Mutex<IdRange>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl IdGenerator {
    /// Full ID space; used until a listening server narrows the range.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(IdRange {
                next: RESERVED_IDS,
                lo: RESERVED_IDS,
                hi: u64::MAX,
            }),
        }
    }

    /// The ID slice owned by the server with zero-based `rank` in a
    /// subnet of `count` hosts.
    #[must_use]
    pub fn range_for(rank: u64, count: u64) -> (u64, u64) {
        let count = count.max(1);
        let chunk = u64::MAX / count;
        let lo = (rank % count).saturating_mul(chunk).max(RESERVED_IDS);
        (lo, lo.saturating_add(chunk))
    }

    /// Narrow the generator to `[lo, hi)`. The counter restarts at `lo`
    /// unless it already points inside the new range.
    pub fn set_range(&self, lo: u64, hi: u64) {
        let mut inner = self.inner.lock();
        inner.lo = lo.max(RESERVED_IDS);
        inner.hi = hi.max(inner.lo + 1);
        if inner.next < inner.lo || inner.next >= inner.hi {
            inner.next = inner.lo;
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next = if inner.next + 1 >= inner.hi {
            inner.lo
        } else {
            inner.next + 1
        };
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn never_yields_zero() {
        let ids = IdGenerator::unbounded();
        for _ in 0..1000 {
            assert_ne!(ids.next_id(), 0);
        }
    }

    #[test]
    fn wraps_within_range() {
        let ids = IdGenerator::unbounded();
        ids.set_range(20, 23);
        assert_eq!(ids.next_id(), 20);
        assert_eq!(ids.next_id(), 21);
        assert_eq!(ids.next_id(), 22);
        assert_eq!(ids.next_id(), 20);
    }

    #[test]
    fn ranges_are_disjoint_per_rank() {
        let (lo0, hi0) = IdGenerator::range_for(0, 6);
        let (lo1, hi1) = IdGenerator::range_for(1, 6);
        assert!(hi0 <= lo1 || hi1 <= lo0);
        assert!(lo0 >= RESERVED_IDS && lo1 >= RESERVED_IDS);
    }
}
