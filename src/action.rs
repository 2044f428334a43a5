//! One observable atomic operation of the modeled program.
//!
//! An `Action` is constructed by the host with its kind, ordering, thread,
//! location and value, then handed to the engine. The engine assigns the
//! sequence number and clock vector at insertion and seals the action into
//! the trace; afterwards it is only read.

use crate::clock::ClockVector;
use crate::{ActionId, Location, ModelClock, ThreadId};

/// Return value recorded for operations that produce none.
pub const VALUE_NONE: u64 = 0xdeadbeef;
/// Return values for trylock.
pub const VALUE_TRYSUCCESS: u64 = 1;
pub const VALUE_TRYFAILED: u64 = 0;

/// The kind of an atomic operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Synthesized write modeling the value of a never-written atomic.
    Uninit,
    AtomicRead,
    AtomicWrite,
    /// The read half of a read-modify-write.
    RmwRead,
    /// The read half of a compare-and-swap.
    RmwReadCas,
    /// The commit half of a read-modify-write that wrote nothing (failed CAS).
    RmwCommit,
    /// A fused read-modify-write: both read and write.
    Rmw,
    /// A plain store observed lazily at the first atomic access.
    NonatomicWrite,
    Fence,
    Lock,
    TryLock,
    Unlock,
    Wait,
    TimedWait,
    NotifyOne,
    NotifyAll,
    ThreadCreate,
    ThreadJoin,
    ThreadStart,
    ThreadFinish,
    ThreadSleep,
    PthreadCreate,
    PthreadJoin,
}

/// C++11 memory orderings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

/// One atomic operation: kind, ordering, location, value, and the
/// bookkeeping attached by the engine at insertion.
#[derive(Clone, Debug)]
pub struct Action {
    pub kind: ActionKind,
    pub order: MemOrder,
    pub tid: ThreadId,
    pub location: Location,
    pub value: u64,
    /// Access width in bytes: 1, 2, 4 or 8.
    pub size: u32,

    /// Assigned at insertion; monotone across the execution.
    pub seq: ModelClock,
    /// Built at insertion from the thread's parent action.
    pub cv: Option<ClockVector>,
    /// For reads: the chosen write.
    pub reads_from: Option<ActionId>,
    /// For writes: cached release-sequence clock.
    pub rfcv: Option<ClockVector>,
    /// Snapshot of the issuing thread's most recent release fence.
    pub last_fence_release: Option<ActionId>,
    /// For thread create/join: the other thread involved.
    pub thread_operand: Option<ThreadId>,
}

impl Action {
    pub fn new(
        kind: ActionKind,
        order: MemOrder,
        tid: ThreadId,
        location: Location,
        value: u64,
    ) -> Self {
        Self {
            kind,
            order,
            tid,
            location,
            value,
            size: 8,
            seq: 0,
            cv: None,
            reads_from: None,
            rfcv: None,
            last_fence_release: None,
            thread_operand: None,
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        self.size = size;
        self
    }

    // -- kind predicates ---------------------------------------------------

    pub fn is_read(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::AtomicRead | ActionKind::RmwRead | ActionKind::RmwReadCas | ActionKind::Rmw
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::AtomicWrite
                | ActionKind::Rmw
                | ActionKind::NonatomicWrite
                | ActionKind::Uninit
        )
    }

    /// The read half of an rmw (either flavor). Never wakes sleepers and
    /// pins the next schedule to its own thread.
    pub fn is_rmw_read(&self) -> bool {
        matches!(self.kind, ActionKind::RmwRead | ActionKind::RmwReadCas)
    }

    pub fn is_rmw_cas(&self) -> bool {
        self.kind == ActionKind::RmwReadCas
    }

    pub fn is_rmw_commit(&self) -> bool {
        self.kind == ActionKind::RmwCommit
    }

    pub fn is_rmw(&self) -> bool {
        self.kind == ActionKind::Rmw
    }

    pub fn is_fence(&self) -> bool {
        self.kind == ActionKind::Fence
    }

    pub fn is_lock(&self) -> bool {
        self.kind == ActionKind::Lock
    }

    pub fn is_unlock(&self) -> bool {
        self.kind == ActionKind::Unlock
    }

    pub fn is_wait(&self) -> bool {
        matches!(self.kind, ActionKind::Wait | ActionKind::TimedWait)
    }

    pub fn is_notify(&self) -> bool {
        matches!(self.kind, ActionKind::NotifyOne | ActionKind::NotifyAll)
    }

    pub fn is_mutex_op(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::Lock
                | ActionKind::TryLock
                | ActionKind::Unlock
                | ActionKind::Wait
                | ActionKind::TimedWait
                | ActionKind::NotifyOne
                | ActionKind::NotifyAll
        )
    }

    pub fn is_thread_start(&self) -> bool {
        self.kind == ActionKind::ThreadStart
    }

    pub fn is_thread_join(&self) -> bool {
        matches!(self.kind, ActionKind::ThreadJoin | ActionKind::PthreadJoin)
    }

    pub fn is_thread_finish(&self) -> bool {
        self.kind == ActionKind::ThreadFinish
    }

    pub fn is_sleep(&self) -> bool {
        self.kind == ActionKind::ThreadSleep
    }

    /// An operation on an atomic variable, i.e. one that prompts synthesis
    /// of the uninitialized store on first touch.
    pub fn is_atomic_op(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::AtomicRead
                | ActionKind::AtomicWrite
                | ActionKind::RmwRead
                | ActionKind::RmwReadCas
                | ActionKind::RmwCommit
                | ActionKind::Rmw
        )
    }

    // -- ordering predicates -----------------------------------------------

    pub fn is_acquire(&self) -> bool {
        matches!(self.order, MemOrder::Acquire | MemOrder::AcqRel | MemOrder::SeqCst)
    }

    pub fn is_release(&self) -> bool {
        matches!(self.order, MemOrder::Release | MemOrder::AcqRel | MemOrder::SeqCst)
    }

    pub fn is_seqcst(&self) -> bool {
        self.order == MemOrder::SeqCst
    }

    pub fn same_var(&self, other: &Action) -> bool {
        self.location == other.location
    }

    /// Happens-before against another action's clock vector: `self` happens
    /// before the holder iff the holder has observed `self`'s sequence
    /// number on `self`'s thread.
    pub fn happens_before(&self, other: &Action) -> bool {
        match &other.cv {
            Some(cv) => cv.synchronized_since(self.tid, self.seq),
            None => false,
        }
    }

    /// Could `other` (about to execute) synchronize with `self` (a pending
    /// action of a sleeping or backtracked thread)? Acquire/release pairing
    /// with location agreement, mutex hand-off, or thread completion.
    pub fn could_synchronize_with(&self, other: &Action) -> bool {
        if self.is_acquire() {
            if self.is_read() && other.is_write() && other.is_release() && self.same_var(other) {
                return true;
            }
            if self.is_fence() && other.is_release() && (other.is_write() || other.is_fence()) {
                return true;
            }
        }
        if self.is_lock() && (other.is_unlock() || other.is_wait()) && self.same_var(other) {
            return true;
        }
        if self.is_thread_join() && other.is_thread_finish() {
            return self.thread_operand == Some(other.tid);
        }
        false
    }

    /// Fuse the commit half of an rmw into this action (the pending read
    /// half). A commit without a write downgrades to a plain read; a full
    /// rmw takes the commit's value. Either way the commit's ordering wins
    /// and the read's seq# and clock vector are kept.
    pub fn absorb_rmw(&mut self, commit: &Action) {
        debug_assert!(self.is_rmw_read());
        self.order = commit.order;
        match commit.kind {
            ActionKind::RmwCommit => self.kind = ActionKind::AtomicRead,
            ActionKind::Rmw => {
                self.kind = ActionKind::Rmw;
                self.value = commit.value;
            }
            _ => unreachable!("absorb_rmw on non-rmw action kind {:?}", commit.kind),
        }
    }

    /// Trace hash contribution; combined per action into the summary hash.
    pub fn hash(&self) -> u32 {
        let mut h: u32 = 2166136261;
        let mut mix = |v: u64| {
            for b in v.to_le_bytes() {
                h ^= u32::from(b);
                h = h.wrapping_mul(16777619);
            }
        };
        mix(self.seq);
        mix(self.tid as u64);
        mix(self.kind as u64);
        mix(self.order as u64);
        mix(self.location.0);
        mix(self.value);
        h
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            ActionKind::Uninit => "uninitialized",
            ActionKind::AtomicRead => "atomic read",
            ActionKind::AtomicWrite => "atomic write",
            ActionKind::RmwRead => "atomic rmwr",
            ActionKind::RmwReadCas => "atomic rmwrcas",
            ActionKind::RmwCommit => "atomic rmwc",
            ActionKind::Rmw => "atomic rmw",
            ActionKind::NonatomicWrite => "nonatomic write",
            ActionKind::Fence => "fence",
            ActionKind::Lock => "lock",
            ActionKind::TryLock => "trylock",
            ActionKind::Unlock => "unlock",
            ActionKind::Wait => "wait",
            ActionKind::TimedWait => "timed wait",
            ActionKind::NotifyOne => "notify one",
            ActionKind::NotifyAll => "notify all",
            ActionKind::ThreadCreate => "thread create",
            ActionKind::ThreadJoin => "thread join",
            ActionKind::ThreadStart => "thread start",
            ActionKind::ThreadFinish => "thread finish",
            ActionKind::ThreadSleep => "thread sleep",
            ActionKind::PthreadCreate => "pthread create",
            ActionKind::PthreadJoin => "pthread join",
        }
    }

    pub fn order_str(&self) -> &'static str {
        match self.order {
            MemOrder::Relaxed => "relaxed",
            MemOrder::Acquire => "acquire",
            MemOrder::Release => "release",
            MemOrder::AcqRel => "acq_rel",
            MemOrder::SeqCst => "seq_cst",
        }
    }
}

/// Compare two values at a given access width. A failing CAS compares only
/// the low `size` bytes.
pub fn val_equals(a: u64, b: u64, size: u32) -> bool {
    match size {
        1 => a as u8 == b as u8,
        2 => a as u16 == b as u16,
        4 => a as u32 == b as u32,
        8 => a == b,
        _ => unreachable!("unsupported access size {}", size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(kind: ActionKind, order: MemOrder) -> Action {
        Action::new(kind, order, 1, Location(0x10), 0)
    }

    #[test]
    fn test_rmw_is_both_read_and_write() {
        let a = act(ActionKind::Rmw, MemOrder::Relaxed);
        assert!(a.is_read());
        assert!(a.is_write());
    }

    #[test]
    fn test_seqcst_is_acquire_and_release() {
        let a = act(ActionKind::AtomicRead, MemOrder::SeqCst);
        assert!(a.is_acquire());
        assert!(a.is_release());
        assert!(a.is_seqcst());
    }

    #[test]
    fn test_absorb_failed_rmw_becomes_read() {
        let mut read = act(ActionKind::RmwReadCas, MemOrder::Acquire);
        read.seq = 3;
        let commit = act(ActionKind::RmwCommit, MemOrder::Relaxed);
        read.absorb_rmw(&commit);
        assert_eq!(read.kind, ActionKind::AtomicRead);
        assert_eq!(read.order, MemOrder::Relaxed);
        assert_eq!(read.seq, 3);
    }

    #[test]
    fn test_absorb_rmw_takes_commit_value() {
        let mut read = act(ActionKind::RmwRead, MemOrder::Relaxed);
        let mut commit = act(ActionKind::Rmw, MemOrder::AcqRel);
        commit.value = 42;
        read.absorb_rmw(&commit);
        assert_eq!(read.kind, ActionKind::Rmw);
        assert_eq!(read.value, 42);
        assert_eq!(read.order, MemOrder::AcqRel);
    }

    #[test]
    fn test_could_synchronize_acquire_read_with_release_write() {
        let pending = act(ActionKind::AtomicRead, MemOrder::Acquire);
        let store = act(ActionKind::AtomicWrite, MemOrder::Release);
        assert!(pending.could_synchronize_with(&store));

        let relaxed = act(ActionKind::AtomicWrite, MemOrder::Relaxed);
        assert!(!pending.could_synchronize_with(&relaxed));
    }

    #[test]
    fn test_could_synchronize_requires_same_location() {
        let pending = act(ActionKind::AtomicRead, MemOrder::Acquire);
        let mut store = act(ActionKind::AtomicWrite, MemOrder::Release);
        store.location = Location(0x99);
        assert!(!pending.could_synchronize_with(&store));
    }

    #[test]
    fn test_could_synchronize_lock_with_unlock() {
        let pending = act(ActionKind::Lock, MemOrder::Relaxed);
        let unlock = act(ActionKind::Unlock, MemOrder::Relaxed);
        assert!(pending.could_synchronize_with(&unlock));
    }

    #[test]
    fn test_could_synchronize_join_with_finish() {
        let mut pending = act(ActionKind::ThreadJoin, MemOrder::Relaxed);
        pending.thread_operand = Some(2);
        let mut finish = act(ActionKind::ThreadFinish, MemOrder::Relaxed);
        finish.tid = 2;
        assert!(pending.could_synchronize_with(&finish));
        finish.tid = 3;
        assert!(!pending.could_synchronize_with(&finish));
    }

    #[test]
    fn test_val_equals_truncates() {
        assert!(val_equals(0x1_00, 0x2_00, 1));
        assert!(!val_equals(0x1_00, 0x2_00, 2));
        assert!(val_equals(0xffff_ffff_0000_0001, 0x1, 4));
        assert!(!val_equals(0xffff_ffff_0000_0001, 0x1, 8));
    }

    #[test]
    fn test_happens_before_via_cv() {
        let mut a = act(ActionKind::AtomicWrite, MemOrder::Relaxed);
        a.tid = 1;
        a.seq = 2;
        let mut b = act(ActionKind::AtomicRead, MemOrder::Relaxed);
        b.tid = 2;
        b.seq = 5;
        b.cv = Some(crate::clock::ClockVector::new(None, 2, 5));
        assert!(!a.happens_before(&b));
        b.cv.as_mut().unwrap().merge(&crate::clock::ClockVector::new(None, 1, 2));
        assert!(a.happens_before(&b));
    }
}
