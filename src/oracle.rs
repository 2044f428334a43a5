//! The pluggable choice oracle.
//!
//! Wherever the memory model admits several legal outcomes (which write a
//! read observes, which waiter a notify wakes, which thread runs next),
//! the engine defers the pick to an oracle. The engine never mutates
//! oracle state except through these calls, and the oracle sees actions
//! only through the read-only arguments.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::action::Action;
use crate::execution::Params;
use crate::ThreadId;

/// Exploration strategy plug-in.
pub trait Oracle {
    /// Rank the rf candidates for a read: the index of the write to try, or
    /// None when no candidate is acceptable (the read fails).
    fn select_write(&mut self, read: &Action, rf_set: &[&Action]) -> Option<usize>;

    /// Which waiter (by index into `waiters`) a notify-one wakes.
    fn select_notify(&mut self, waiters: &[ThreadId]) -> usize;

    /// Which thread the scheduler runs next.
    fn select_thread(&mut self, candidates: &[ThreadId]) -> ThreadId;

    /// May this thread-sleep action actually sleep?
    fn should_sleep(&mut self, sleep: &Action) -> bool;

    /// Should a sleeping thread be woken by the current step?
    fn should_wake(&mut self, sleep: &Action) -> bool;

    /// Should this condvar wait actually park the thread?
    fn should_wait(&mut self, wait: &Action) -> bool;

    fn has_paused_threads(&self) -> bool {
        false
    }

    fn notify_paused_thread(&mut self, _tid: ThreadId) {}

    /// Called once when the execution is constructed.
    fn register_engine(&mut self, _params: &Params) {}
}

/// One recorded oracle decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Choice {
    Write(Option<usize>),
    Notify(usize),
    Thread(ThreadId),
    Sleep(bool),
    Wake(bool),
    Wait(bool),
}

/// The default oracle: uniform random picks from a seeded generator, so a
/// given seed reproduces a given interleaving.
#[derive(Debug)]
pub struct RandomOracle {
    rng: StdRng,
}

impl RandomOracle {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Oracle for RandomOracle {
    fn select_write(&mut self, _read: &Action, rf_set: &[&Action]) -> Option<usize> {
        if rf_set.is_empty() {
            None
        } else {
            Some(self.rng.random_range(0..rf_set.len()))
        }
    }

    fn select_notify(&mut self, waiters: &[ThreadId]) -> usize {
        self.rng.random_range(0..waiters.len())
    }

    fn select_thread(&mut self, candidates: &[ThreadId]) -> ThreadId {
        candidates[self.rng.random_range(0..candidates.len())]
    }

    fn should_sleep(&mut self, _sleep: &Action) -> bool {
        true
    }

    fn should_wake(&mut self, _sleep: &Action) -> bool {
        false
    }

    fn should_wait(&mut self, _wait: &Action) -> bool {
        self.rng.random()
    }
}

/// Wraps another oracle and logs every choice it makes, so the run can be
/// replayed through a [`ScriptedOracle`].
///
/// The log lives behind a shared handle: the execution owns the oracle,
/// while the host keeps the handle to extract the script afterwards.
#[derive(Debug)]
pub struct RecordingOracle<O> {
    inner: O,
    log: Rc<RefCell<Vec<Choice>>>,
}

impl<O: Oracle> RecordingOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// A handle to the choice log, valid after the oracle is handed off.
    pub fn log_handle(&self) -> Rc<RefCell<Vec<Choice>>> {
        Rc::clone(&self.log)
    }

    fn push(&self, choice: Choice) {
        self.log.borrow_mut().push(choice);
    }
}

impl<O: Oracle> Oracle for RecordingOracle<O> {
    fn select_write(&mut self, read: &Action, rf_set: &[&Action]) -> Option<usize> {
        let c = self.inner.select_write(read, rf_set);
        self.push(Choice::Write(c));
        c
    }

    fn select_notify(&mut self, waiters: &[ThreadId]) -> usize {
        let c = self.inner.select_notify(waiters);
        self.push(Choice::Notify(c));
        c
    }

    fn select_thread(&mut self, candidates: &[ThreadId]) -> ThreadId {
        let c = self.inner.select_thread(candidates);
        self.push(Choice::Thread(c));
        c
    }

    fn should_sleep(&mut self, sleep: &Action) -> bool {
        let c = self.inner.should_sleep(sleep);
        self.push(Choice::Sleep(c));
        c
    }

    fn should_wake(&mut self, sleep: &Action) -> bool {
        let c = self.inner.should_wake(sleep);
        self.push(Choice::Wake(c));
        c
    }

    fn should_wait(&mut self, wait: &Action) -> bool {
        let c = self.inner.should_wait(wait);
        self.push(Choice::Wait(c));
        c
    }
}

/// Replays a previously recorded choice list.
///
/// Replay must ask the same questions in the same order as the recorded
/// run; a mismatched or exhausted script is a harness bug and panics.
#[derive(Debug)]
pub struct ScriptedOracle {
    script: VecDeque<Choice>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Choice>) -> Self {
        Self {
            script: script.into(),
        }
    }

    fn next(&mut self) -> Choice {
        self.script
            .pop_front()
            .expect("scripted oracle: script exhausted")
    }
}

impl Oracle for ScriptedOracle {
    fn select_write(&mut self, _read: &Action, rf_set: &[&Action]) -> Option<usize> {
        match self.next() {
            Choice::Write(c) => {
                debug_assert!(c.map_or(true, |i| i < rf_set.len()));
                c
            }
            other => panic!("scripted oracle: expected Write, got {:?}", other),
        }
    }

    fn select_notify(&mut self, _waiters: &[ThreadId]) -> usize {
        match self.next() {
            Choice::Notify(c) => c,
            other => panic!("scripted oracle: expected Notify, got {:?}", other),
        }
    }

    fn select_thread(&mut self, candidates: &[ThreadId]) -> ThreadId {
        match self.next() {
            Choice::Thread(c) => {
                debug_assert!(candidates.contains(&c));
                c
            }
            other => panic!("scripted oracle: expected Thread, got {:?}", other),
        }
    }

    fn should_sleep(&mut self, _sleep: &Action) -> bool {
        match self.next() {
            Choice::Sleep(c) => c,
            other => panic!("scripted oracle: expected Sleep, got {:?}", other),
        }
    }

    fn should_wake(&mut self, _sleep: &Action) -> bool {
        match self.next() {
            Choice::Wake(c) => c,
            other => panic!("scripted oracle: expected Wake, got {:?}", other),
        }
    }

    fn should_wait(&mut self, _wait: &Action) -> bool {
        match self.next() {
            Choice::Wait(c) => c,
            other => panic!("scripted oracle: expected Wait, got {:?}", other),
        }
    }
}
