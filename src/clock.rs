//! Vector clock implementation for happens-before tracking.
//!
//! A clock vector is a vector of logical timestamps, one per thread. Each
//! action carries the clock vector that was current when it executed; if
//! `a.seq <= b.cv.get(a.tid)`, then `a` happens-before `b`. Componentwise
//! comparison decides ordering between whole vectors; incomparable vectors
//! belong to concurrent actions.
//!
//! Unlike a classic Mattern/Fidge clock, components here are execution-wide
//! sequence numbers rather than per-thread event counts: the component for
//! thread `t` is the sequence number of the latest action of `t` known to
//! happen before the owner.

use crate::{ModelClock, ThreadId};

/// A vector clock indexed by thread ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClockVector {
    /// Clock values indexed by thread ID. Thread IDs are dense integers 0..N.
    clocks: Vec<ModelClock>,
}

impl ClockVector {
    /// Create the clock vector for a new action: the parent's knowledge
    /// (if any) plus the owning action's own `(tid, seq#)` component.
    pub fn new(parent: Option<&ClockVector>, tid: ThreadId, seq: ModelClock) -> Self {
        let mut clocks = match parent {
            Some(p) => p.clocks.clone(),
            None => Vec::new(),
        };
        if clocks.len() <= tid {
            clocks.resize(tid + 1, 0);
        }
        clocks[tid] = seq;
        Self { clocks }
    }

    /// Number of threads tracked.
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Get the clock value for a given thread. Threads beyond the tracked
    /// range are at time zero.
    pub fn get(&self, tid: ThreadId) -> ModelClock {
        self.clocks.get(tid).copied().unwrap_or(0)
    }

    /// Grow the vector to track at least `num_threads` threads.
    pub fn extend_to(&mut self, num_threads: usize) {
        if self.clocks.len() < num_threads {
            self.clocks.resize(num_threads, 0);
        }
    }

    /// Point-wise maximum: self = max(self, other).
    ///
    /// Returns true iff any component of `self` grew. Used for acquire
    /// synchronization, release-sequence propagation and thread join.
    pub fn merge(&mut self, other: &ClockVector) -> bool {
        if other.clocks.len() > self.clocks.len() {
            self.clocks.resize(other.clocks.len(), 0);
        }
        let mut changed = false;
        for (a, b) in self.clocks.iter_mut().zip(other.clocks.iter()) {
            if *b > *a {
                *a = *b;
                changed = true;
            }
        }
        changed
    }

    /// The happens-before primitive: has the owner of this vector observed
    /// the action `(tid, seq)`?
    pub fn synchronized_since(&self, tid: ThreadId, seq: ModelClock) -> bool {
        seq <= self.get(tid)
    }

    /// Returns true if `self <= other` componentwise, i.e. everything the
    /// owner of `self` knows is also known to the owner of `other`.
    pub fn happens_before(&self, other: &ClockVector) -> bool {
        for i in 0..self.clocks.len().max(other.clocks.len()) {
            if self.get(i) > other.get(i) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for ClockVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.clocks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}
