//! Vector of event counters, one per vector timestamper.
//!
//! A clock is owned by the VT whose counter it bumps on local events; clocks
//! received from peers are merged componentwise. Deleted-at-"never" records
//! carry a sentinel clock that no viewer can dominate.

use std::hash::{Hash, Hasher};

/// Owner id for clocks that have no owning VT (wire sentinel).
pub const NO_OWNER: u64 = u64::MAX;

/// Per-VT queue timestamps, indexed by VT id.
pub type QTimestamps = Vec<u64>;

/// Logical time: one unsigned 64-bit counter per VT plus the owning VT id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VectorClock {
    pub owner: u64,
    pub counters: Vec<u64>,
}

impl VectorClock {
    /// A zeroed clock owned by `owner`.
    pub fn new(owner: u64, num_vts: usize) -> Self {
        debug_assert!(owner < num_vts as u64 || owner == NO_OWNER);
        VectorClock { owner, counters: vec![0; num_vts] }
    }

    /// The "never" sentinel: all counters saturated, no owner. Not ≤ any
    /// real viewer clock, so records deleted-at-never stay visible.
    pub fn never(num_vts: usize) -> Self {
        VectorClock { owner: NO_OWNER, counters: vec![u64::MAX; num_vts] }
    }

    pub fn from_counters(owner: u64, counters: Vec<u64>) -> Self {
        VectorClock { owner, counters }
    }

    pub fn is_never(&self) -> bool {
        self.counters.iter().all(|&c| c == u64::MAX)
    }

    /// Bumps the owner's counter. Local events only.
    pub fn increment_local(&mut self) {
        debug_assert_ne!(self.owner, NO_OWNER);
        self.counters[self.owner as usize] += 1;
    }

    /// Bumps an arbitrary counter; used when replaying another VT's events.
    pub fn increment_counter(&mut self, index: usize) {
        self.counters[index] += 1;
    }

    /// Componentwise max with `other`. Counters never move backwards.
    pub fn merge(&mut self, other: &VectorClock) {
        debug_assert_eq!(self.counters.len(), other.counters.len());
        for (mine, theirs) in self.counters.iter_mut().zip(other.counters.iter()) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
    }

    /// True iff every counter of `self` is ≤ the matching counter of
    /// `other`: self happened before (or at) other.
    pub fn happens_before_eq(&self, other: &VectorClock) -> bool {
        debug_assert_eq!(self.counters.len(), other.counters.len());
        self.counters.iter().zip(other.counters.iter()).all(|(a, b)| a <= b)
    }
}

/// Clocks hash by counters only, so equal counter vectors collide even when
/// observed through different owners.
impl Hash for VectorClock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in &self.counters {
            c.hash(state);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn increment_and_merge() {
        let mut a = VectorClock::new(0, 3);
        a.increment_local();
        a.increment_local();
        let mut b = VectorClock::new(1, 3);
        b.increment_local();
        b.counters[2] = 5;

        let prior = a.clone();
        a.merge(&b);
        for i in 0..3 {
            assert!(a.counters[i] >= prior.counters[i]);
            assert!(a.counters[i] >= b.counters[i]);
        }
        assert_eq!(a.counters, vec![2, 1, 5]);
        // merge does not change ownership
        assert_eq!(a.owner, 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = VectorClock::from_counters(0, vec![3, 1]);
        let b = VectorClock::from_counters(1, vec![2, 4]);
        a.merge(&b);
        let once = a.clone();
        a.merge(&b);
        assert_eq!(a, once);
    }

    #[test]
    fn happens_before() {
        let a = VectorClock::from_counters(0, vec![1, 2]);
        let b = VectorClock::from_counters(1, vec![2, 2]);
        assert!(a.happens_before_eq(&b));
        assert!(!b.happens_before_eq(&a));
        assert!(a.happens_before_eq(&a));
        assert!(!VectorClock::never(2).happens_before_eq(&b));
    }

    #[test]
    fn hash_ignores_owner() {
        use std::collections::hash_map::DefaultHasher;
        let h = |c: &VectorClock| {
            let mut s = DefaultHasher::new();
            c.hash(&mut s);
            s.finish()
        };
        let a = VectorClock::from_counters(0, vec![7, 9]);
        let b = VectorClock::from_counters(1, vec![7, 9]);
        assert_eq!(h(&a), h(&b));
    }
}
