//! Thread state tracking for the execution engine.
//!
//! Modeled threads are not OS threads: they are cooperatively scheduled
//! units that the host advances one action at a time. Each thread records
//! its lifecycle state, the action it is blocked on or sleeping in, and
//! which thread it is waiting for (a mutex owner or a join target).

use crate::action::Action;
use crate::{ActionId, ThreadId};

/// Lifecycle state of a modeled thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable: the host may submit this thread's next action.
    Ready,
    /// Blocked on a disabled action (lock held elsewhere, incomplete join).
    Blocked,
    /// Finished executing.
    Completed,
}

/// State of a single modeled thread within one execution.
#[derive(Debug)]
pub struct ModelThread {
    /// Thread identifier (dense integer, 0-indexed). Thread 0 is the model
    /// thread, which owns synthesized actions and never runs user code.
    pub id: ThreadId,

    /// The thread that created this one.
    pub parent: Option<ThreadId>,

    /// The thread-create action this thread was born from.
    pub creation: Option<ActionId>,

    /// The action this thread wants to run but could not (blocked), or the
    /// sleep/wait it is parked in. Cleared when the host resubmits it.
    pub pending: Option<Action>,

    pub state: ThreadState,

    /// The thread whose progress unblocks this one, if any.
    pub waiting_on: Option<ThreadId>,

    /// Set when a sleeping thread was woken by an observable event rather
    /// than by exhausting its sleep.
    pub wakeup_state: bool,

    /// Return value of this thread's most recent operation.
    pub return_value: u64,

    /// User-visible pthread handle, when created through the pthread shims.
    pub user_pthread: Option<u32>,
}

impl ModelThread {
    pub fn new(id: ThreadId, parent: Option<ThreadId>) -> Self {
        Self {
            id,
            parent,
            creation: None,
            pending: None,
            state: ThreadState::Ready,
            waiting_on: None,
            wakeup_state: false,
            return_value: 0,
            user_pthread: None,
        }
    }

    /// The model thread owns synthesized actions (uninitialized stores) and
    /// is never scheduled.
    pub fn is_model_thread(&self) -> bool {
        self.id == 0
    }

    pub fn is_complete(&self) -> bool {
        self.state == ThreadState::Completed
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ThreadState::Blocked
    }

    pub fn complete(&mut self) {
        self.state = ThreadState::Completed;
    }

    pub fn block_on(&mut self, waiting_on: Option<ThreadId>, pending: Action) {
        self.state = ThreadState::Blocked;
        self.waiting_on = waiting_on;
        self.pending = Some(pending);
    }

    pub fn unblock(&mut self) {
        if self.state == ThreadState::Blocked {
            self.state = ThreadState::Ready;
        }
        self.waiting_on = None;
    }

    /// Hand the stashed pending action back to the host.
    pub fn take_pending(&mut self) -> Option<Action> {
        self.pending.take()
    }
}
