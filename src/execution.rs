//! The execution engine: drives one feasible interleaving of the modeled
//! program, one atomic action at a time.
//!
//! The host submits an action for some thread; the engine assigns it a
//! sequence number and clock vector, resolves reads-from choices against
//! the C++11 coherence rules (§29.3), maintains the modification-order
//! graph, propagates happens-before across release sequences, and mutates
//! scheduler state for mutex, condition-variable and thread actions.
//!
//! The engine is strictly single-threaded and cooperative: `step` runs to
//! completion before the next thread is picked, and every observable effect
//! is linearized by sequence-number assignment inside `step`.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace};

use crate::action::{
    val_equals, Action, ActionKind, MemOrder, VALUE_NONE, VALUE_TRYFAILED, VALUE_TRYSUCCESS,
};
use crate::clock::ClockVector;
use crate::graph::CycleGraph;
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;
use crate::thread::ModelThread;
use crate::{ActionId, Location, ModelClock, ThreadId, FENCE_LOCATION};

/// The thread owning synthesized actions (uninitialized stores).
pub const MODEL_THREAD_ID: ThreadId = 0;
/// The first user thread, present from construction.
pub const INITIAL_THREAD_ID: ThreadId = 1;

/// A bug detected in the modeled program (data race, ordering violation,
/// user assertion). Reported, not thrown: the execution keeps going until
/// the next step boundary.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct Bug(pub String);

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Params {
    /// Value returned when an atomic read precedes any write to its location.
    pub uninit_value: u64,
    /// Seed for the default random oracle.
    pub seed: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            uninit_value: 0,
            seed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct MutexState {
    locked: Option<ThreadId>,
}

/// A raw (nonatomic) store observed by the host, waiting to be converted
/// into a write action at the first atomic access of its location.
#[derive(Clone, Copy, Debug)]
struct PendingStore {
    tid: ThreadId,
    clock: ModelClock,
    value: u64,
}

/// What `step` did with the submitted action.
#[derive(Debug)]
pub enum StepOutcome {
    /// The action executed. `action` may differ from the submitted one
    /// (rmw fusion substitutes the pending read half). `next_thread` is
    /// set when the action itself pins the schedule (partial rmw, thread
    /// create); otherwise the scheduler decides.
    Executed {
        action: ActionId,
        next_thread: Option<ThreadId>,
    },
    /// The action is disabled (lock held elsewhere, join of a live thread,
    /// sleep denied). It is stashed as the thread's pending action and the
    /// thread is blocked until an unlock/finish wakes it.
    Blocked { tid: ThreadId },
    /// A read for which the oracle found no feasible write. The action is
    /// not added to any index; execution continues.
    ReadFailed { tid: ThreadId },
}

/// One execution of the modeled program.
pub struct Execution {
    pub(crate) params: Params,
    oracle: Box<dyn Oracle>,
    pub(crate) scheduler: Scheduler,
    pub(crate) threads: Vec<ModelThread>,

    /// Arena owning every action; all indices hold [`ActionId`] handles.
    pub(crate) actions: Vec<Action>,
    /// Total order of all actions, kept in sequence-number order (lazy
    /// nonatomic writes are spliced in at their rank).
    pub(crate) action_trace: Vec<ActionId>,

    /// location -> every action on that location. Fences live under
    /// [`FENCE_LOCATION`].
    obj_map: FxHashMap<Location, Vec<ActionId>>,
    /// location -> per-thread action lists.
    obj_thrd_map: FxHashMap<Location, Vec<Vec<ActionId>>>,
    /// location -> per-thread lists of writes only.
    obj_wr_thrd_map: FxHashMap<Location, Vec<Vec<ActionId>>>,
    /// location -> most recent seq_cst write.
    obj_last_sc_map: FxHashMap<Location, ActionId>,
    condvar_waiters_map: FxHashMap<Location, Vec<ActionId>>,
    mutex_map: FxHashMap<Location, MutexState>,
    nonatomic_stores: FxHashMap<Location, PendingStore>,

    thrd_last_action: Vec<Option<ActionId>>,
    thrd_last_fence_release: Vec<Option<ActionId>>,
    /// Per-thread rmw state machine: a pending read half waiting for its
    /// commit.
    pending_rmw: Vec<Option<ActionId>>,

    pub(crate) mo_graph: CycleGraph,
    used_sequence_numbers: ModelClock,

    pthread_counter: u32,
    pthread_map: Vec<Option<ThreadId>>,

    bugs: Vec<Bug>,
    asserted: bool,
    pub(crate) execution_number: u32,
    is_finished: bool,
}

impl Execution {
    pub fn new(params: Params, mut oracle: Box<dyn Oracle>) -> Self {
        oracle.register_engine(&params);
        let mut exec = Self {
            params,
            oracle,
            scheduler: Scheduler::new(),
            threads: Vec::new(),
            actions: Vec::new(),
            action_trace: Vec::new(),
            obj_map: FxHashMap::default(),
            obj_thrd_map: FxHashMap::default(),
            obj_wr_thrd_map: FxHashMap::default(),
            obj_last_sc_map: FxHashMap::default(),
            condvar_waiters_map: FxHashMap::default(),
            mutex_map: FxHashMap::default(),
            nonatomic_stores: FxHashMap::default(),
            thrd_last_action: Vec::new(),
            thrd_last_fence_release: Vec::new(),
            pending_rmw: Vec::new(),
            mo_graph: CycleGraph::new(),
            used_sequence_numbers: 0,
            pthread_counter: 1,
            pthread_map: Vec::new(),
            bugs: Vec::new(),
            asserted: false,
            execution_number: 0,
            is_finished: false,
        };
        // We always need at least two threads: the model thread for
        // synthesized actions and the initial user thread.
        exec.add_thread(None);
        exec.add_thread(None);
        exec
    }

    /// Construct with the default random oracle, seeded from the params.
    pub fn with_random_oracle(params: Params) -> Self {
        let seed = params.seed;
        Self::new(params, Box::new(crate::oracle::RandomOracle::new(seed)))
    }

    // -- thread management -------------------------------------------------

    fn add_thread(&mut self, parent: Option<ThreadId>) -> ThreadId {
        let id = self.threads.len();
        self.threads.push(ModelThread::new(id, parent));
        self.thrd_last_action.push(None);
        self.thrd_last_fence_release.push(None);
        self.pending_rmw.push(None);
        if id != MODEL_THREAD_ID {
            self.scheduler.add_thread(id);
        }
        id
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, tid: ThreadId) -> &ModelThread {
        &self.threads[tid]
    }

    /// Resolve a user-visible pthread handle to its modeled thread.
    pub fn get_pthread(&self, pid: u32) -> Option<ThreadId> {
        self.pthread_map.get(pid as usize).copied().flatten()
    }

    /// Return value of the thread's most recent operation (the value read,
    /// the trylock result, or [`VALUE_NONE`]).
    pub fn thread_return_value(&self, tid: ThreadId) -> u64 {
        self.threads[tid].return_value
    }

    /// Hand back a blocked thread's stashed action for resubmission.
    pub fn take_pending(&mut self, tid: ThreadId) -> Option<Action> {
        self.threads[tid].take_pending()
    }

    // -- sequence numbers --------------------------------------------------

    fn get_next_seq_num(&mut self) -> ModelClock {
        self.used_sequence_numbers += 1;
        self.used_sequence_numbers
    }

    /// Hand back the most recent sequence number when the host postpones an
    /// action.
    pub fn restore_last_seq_num(&mut self) {
        self.used_sequence_numbers -= 1;
    }

    // -- bug reports -------------------------------------------------------

    /// Record a detected bug and mark the execution for halting at the next
    /// step boundary.
    pub fn assert_bug(&mut self, msg: &str) {
        self.bugs.push(Bug(msg.to_string()));
        self.set_assert();
    }

    pub fn have_bug_reports(&self) -> bool {
        !self.bugs.is_empty()
    }

    pub fn bugs(&self) -> &[Bug] {
        &self.bugs
    }

    pub fn has_asserted(&self) -> bool {
        self.asserted
    }

    pub fn set_assert(&mut self) {
        self.asserted = true;
    }

    pub fn set_execution_number(&mut self, n: u32) {
        self.execution_number = n;
    }

    pub fn get_execution_number(&self) -> u32 {
        self.execution_number
    }

    // -- liveness queries --------------------------------------------------

    pub fn is_enabled(&self, tid: ThreadId) -> bool {
        self.scheduler.is_enabled(tid)
    }

    /// Deadlock: nothing can run, yet some user thread still wants to.
    pub fn is_deadlocked(&self) -> bool {
        let mut blocking_threads = false;
        for t in &self.threads {
            if self.scheduler.is_enabled(t.id) || self.scheduler.is_sleep_set(t.id) {
                return false;
            }
            if !t.is_model_thread() && t.pending.is_some() {
                blocking_threads = true;
            }
        }
        blocking_threads
    }

    /// Complete: no thread can be scheduled at all (as opposed to exiting
    /// because the sleep set forced a redundant execution).
    pub fn is_complete_execution(&self) -> bool {
        self.threads
            .iter()
            .all(|t| !self.scheduler.is_enabled(t.id) && !self.scheduler.is_sleep_set(t.id))
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    /// Ask the scheduler (and through it the oracle) for the next thread.
    pub fn next_thread(&mut self) -> Option<ThreadId> {
        self.scheduler.next_thread(&mut *self.oracle)
    }

    // -- accessors for actions ---------------------------------------------

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    pub fn action_trace(&self) -> &[ActionId] {
        &self.action_trace
    }

    pub fn get_last_action(&self, tid: ThreadId) -> Option<ActionId> {
        self.thrd_last_action.get(tid).copied().flatten()
    }

    pub fn get_last_fence_release(&self, tid: ThreadId) -> Option<ActionId> {
        self.thrd_last_fence_release.get(tid).copied().flatten()
    }

    fn get_parent_action(&self, tid: ThreadId) -> Option<ActionId> {
        self.get_last_action(tid).or(self.threads[tid].creation)
    }

    /// The clock vector a new action of `tid` would inherit.
    pub fn get_cv(&self, tid: ThreadId) -> Option<&ClockVector> {
        let parent = self.get_parent_action(tid)?;
        self.actions[parent.0].cv.as_ref()
    }

    // -- nonatomic stores --------------------------------------------------

    /// Note a raw (nonatomic) store. The store is not modeled as an action
    /// until the first atomic access of its location observes it; it is
    /// then spliced into every index at the rank it would have had now.
    pub fn record_nonatomic_store(&mut self, location: Location, tid: ThreadId, value: u64) {
        self.nonatomic_stores.insert(
            location,
            PendingStore {
                tid,
                clock: self.used_sequence_numbers,
                value,
            },
        );
    }

    // =======================================================================
    // step: the heart of the engine
    // =======================================================================

    /// Execute one action. Returns the executed action (rmw fusion may
    /// substitute it) and, when the action pins the schedule, the thread
    /// that must run next.
    pub fn step(&mut self, mut curr: Action) -> StepOutcome {
        let tid = curr.tid;
        assert!(
            tid < self.threads.len() && tid != MODEL_THREAD_ID,
            "step from unknown or model thread {}",
            tid
        );
        assert!(!self.threads[tid].is_complete(), "step from finished thread");

        if curr.is_fence() {
            // Every fence is filed under the fence sentinel location.
            curr.location = FENCE_LOCATION;
        }

        if !self.check_action_enabled(&curr) {
            let waiting_on = match curr.kind {
                ActionKind::Lock => self
                    .mutex_map
                    .get(&curr.location)
                    .and_then(|m| m.locked),
                ActionKind::ThreadJoin | ActionKind::PthreadJoin => curr.thread_operand,
                _ => None,
            };
            trace!(tid, kind = curr.kind_str(), "action disabled; blocking thread");
            self.threads[tid].block_on(waiting_on, curr);
            self.scheduler.remove_thread(tid);
            return StepOutcome::Blocked { tid };
        }

        let second_part_of_rmw = curr.is_rmw_commit() || curr.is_rmw();
        let curr_id = self.initialize_curr_action(curr);
        trace!(
            seq = self.actions[curr_id.0].seq,
            tid,
            kind = self.actions[curr_id.0].kind_str(),
            "stepping action"
        );

        self.wake_up_sleeping_actions(curr_id);

        if !second_part_of_rmw {
            self.add_uninit_action_to_lists(curr_id);
        }

        if self.actions[curr_id.0].is_read() && !second_part_of_rmw {
            let rf_set = self.build_may_read_from(curr_id);
            if !self.process_read(curr_id, rf_set) {
                // No feasible write: the read is not added to any list.
                // Mark it postponed (seq 0) and return its sequence number.
                debug!(tid, "read has no feasible write; dropping action");
                self.actions[curr_id.0].seq = 0;
                self.restore_last_seq_num();
                return StepOutcome::ReadFailed { tid };
            }
        }

        if !second_part_of_rmw {
            self.add_action_to_lists(curr_id);
        }
        if self.actions[curr_id.0].is_write() {
            self.add_write_to_lists(curr_id);
        }
        if self.actions[curr_id.0].is_rmw_read() {
            self.pending_rmw[tid] = Some(curr_id);
        }

        self.process_thread_action(curr_id);

        if self.actions[curr_id.0].is_write() {
            self.process_write(curr_id);
        }
        if self.actions[curr_id.0].is_fence() {
            self.process_fence(curr_id);
        }
        if self.actions[curr_id.0].is_mutex_op() {
            self.process_mutex(curr_id);
        }

        if self.threads[tid].is_blocked() || self.threads[tid].is_complete() {
            self.scheduler.remove_thread(tid);
        }

        let next_thread = self.action_select_next_thread(curr_id);
        StepOutcome::Executed {
            action: curr_id,
            next_thread,
        }
    }

    /// Would this action succeed right now?
    fn check_action_enabled(&mut self, curr: &Action) -> bool {
        if curr.is_lock() {
            self.mutex_map
                .entry(curr.location)
                .or_default()
                .locked
                .is_none()
        } else if curr.is_thread_join() {
            let target = curr
                .thread_operand
                .expect("join action without a target thread");
            self.threads[target].is_complete()
        } else if curr.is_sleep() {
            self.oracle.should_sleep(curr)
        } else {
            true
        }
    }

    /// Allocate the sequence number and clock vector for a new action, or
    /// fuse an rmw commit into its pending read half.
    fn initialize_curr_action(&mut self, curr: Action) -> ActionId {
        if curr.is_rmw_commit() || curr.is_rmw() {
            return self.process_rmw(curr);
        }
        let mut curr = curr;
        let seq = self.get_next_seq_num();
        curr.seq = seq;
        let parent_cv = self
            .get_parent_action(curr.tid)
            .and_then(|p| self.actions[p.0].cv.as_ref());
        curr.cv = Some(ClockVector::new(parent_cv, curr.tid, seq));
        curr.last_fence_release = self.get_last_fence_release(curr.tid);
        let id = ActionId(self.actions.len());
        self.actions.push(curr);
        id
    }

    /// Close out an rmw: the pending read half absorbs the commit. A full
    /// rmw additionally gets the rmw edge from its reads-from write.
    fn process_rmw(&mut self, commit: Action) -> ActionId {
        let tid = commit.tid;
        let last = self.pending_rmw[tid]
            .take()
            .unwrap_or_else(|| panic!("rmw commit on thread {} with no pending rmw read", tid));
        let full_rmw = commit.is_rmw();
        self.actions[last.0].absorb_rmw(&commit);
        if full_rmw {
            let rf = self.actions[last.0]
                .reads_from
                .expect("fused rmw with unresolved reads-from");
            self.mo_graph.add_rmw_edge(rf, last);
        }
        last
    }

    // -- wakeups -----------------------------------------------------------

    /// Should the current action wake a given sleeping thread?
    fn should_wake_up(&mut self, curr: ActionId, tid: ThreadId) -> bool {
        let curr_act = &self.actions[curr.0];
        // A partial rmw never wakes anyone.
        if curr_act.is_rmw_read() {
            return false;
        }
        let Some(asleep) = self.threads[tid].pending.as_ref() else {
            return false;
        };
        if asleep.could_synchronize_with(curr_act) {
            return true;
        }
        if asleep.is_fence() && asleep.is_acquire() && curr_act.is_release() {
            return true;
        }
        // A release fence plus a plain store can wake a load-acquire on the
        // same variable, if the fence dominates the sleeper's last action.
        if asleep.is_read()
            && asleep.is_acquire()
            && curr_act.same_var(asleep)
            && curr_act.is_write()
        {
            if let Some(fence) = self.get_last_fence_release(curr_act.tid) {
                let sleeper_last_seq = self
                    .get_last_action(tid)
                    .map_or(0, |a| self.actions[a.0].seq);
                if sleeper_last_seq < self.actions[fence.0].seq {
                    return true;
                }
            }
        }
        if asleep.is_sleep() && self.oracle.should_wake(asleep) {
            return true;
        }
        false
    }

    fn wake_up_sleeping_actions(&mut self, curr: ActionId) {
        for tid in 0..self.threads.len() {
            if !self.scheduler.is_sleep_set(tid) {
                continue;
            }
            if self.should_wake_up(curr, tid) {
                trace!(tid, "waking sleeping thread");
                self.scheduler.remove_sleep(tid);
                if self.threads[tid]
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.is_sleep())
                {
                    self.threads[tid].wakeup_state = true;
                }
            }
        }
    }

    // -- index maintenance -------------------------------------------------

    fn per_thread_lists<'a>(
        map: &'a mut FxHashMap<Location, Vec<Vec<ActionId>>>,
        loc: Location,
        num_threads: usize,
    ) -> &'a mut Vec<Vec<ActionId>> {
        let vec = map.entry(loc).or_default();
        if vec.len() < num_threads {
            vec.resize_with(num_threads, Vec::new);
        }
        vec
    }

    /// On the first atomic reference to a location, synthesize the
    /// uninitialized store and splice it to the front of every index.
    fn add_uninit_action_to_lists(&mut self, act: ActionId) {
        let (loc, is_atomic) = {
            let a = &self.actions[act.0];
            (a.location, a.is_atomic_op())
        };
        let num_threads = self.threads.len();

        let first_touch = is_atomic && self.obj_map.get(&loc).map_or(true, |l| l.is_empty());
        if first_touch {
            debug!(location = loc.0, value = self.params.uninit_value, "synthesizing uninitialized store");
            let mut uninit = Action::new(
                ActionKind::Uninit,
                MemOrder::Relaxed,
                MODEL_THREAD_ID,
                loc,
                self.params.uninit_value,
            );
            uninit.cv = Some(ClockVector::new(None, MODEL_THREAD_ID, 0));
            let uid = ActionId(self.actions.len());
            self.actions.push(uninit);

            self.obj_map.entry(loc).or_default().insert(0, uid);
            let wr = Self::per_thread_lists(&mut self.obj_wr_thrd_map, loc, num_threads);
            wr[MODEL_THREAD_ID].insert(0, uid);
            self.action_trace.insert(0, uid);
            let thrd = Self::per_thread_lists(&mut self.obj_thrd_map, loc, num_threads);
            thrd[MODEL_THREAD_ID].insert(0, uid);
            self.thrd_last_action[MODEL_THREAD_ID] = Some(uid);
        }

        // Size the per-thread lists for the incoming action's thread.
        Self::per_thread_lists(&mut self.obj_thrd_map, loc, num_threads);
    }

    fn add_action_to_lists(&mut self, act: ActionId) {
        let (tid, loc, is_release_fence, is_wait, value) = {
            let a = &self.actions[act.0];
            (
                a.tid,
                a.location,
                a.is_fence() && a.is_release(),
                a.is_wait(),
                a.value,
            )
        };
        let num_threads = self.threads.len();

        self.obj_map.entry(loc).or_default().push(act);
        self.action_trace.push(act);
        Self::per_thread_lists(&mut self.obj_thrd_map, loc, num_threads)[tid].push(act);

        self.thrd_last_action[tid] = Some(act);
        if is_release_fence {
            self.thrd_last_fence_release[tid] = Some(act);
        }

        // A wait releases its mutex, so it is also filed under the mutex
        // location for the unlock scan.
        if is_wait {
            let mutex_loc = Location(value);
            self.obj_map.entry(mutex_loc).or_default().push(act);
            Self::per_thread_lists(&mut self.obj_thrd_map, mutex_loc, num_threads)[tid].push(act);
        }
    }

    fn add_write_to_lists(&mut self, write: ActionId) {
        let (tid, loc) = {
            let a = &self.actions[write.0];
            (a.tid, a.location)
        };
        let num_threads = self.threads.len();
        Self::per_thread_lists(&mut self.obj_wr_thrd_map, loc, num_threads)[tid].push(write);
    }

    /// Splice `act` into `list` after the last entry with seq# <= its own,
    /// preserving per-list sequence order.
    fn splice_by_seq(actions: &[Action], list: &mut Vec<ActionId>, act: ActionId) {
        let seq = actions[act.0].seq;
        let pos = list.partition_point(|&a| actions[a.0].seq <= seq);
        list.insert(pos, act);
    }

    /// Bookkeeping for a lazily observed nonatomic write: unlike every
    /// other insert, this lands in the middle of the lists.
    fn add_normal_write_to_lists(&mut self, act: ActionId) {
        let (tid, loc, seq) = {
            let a = &self.actions[act.0];
            (a.tid, a.location, a.seq)
        };
        let num_threads = self.threads.len();

        // The spliced write's clock vector is parented at its predecessor
        // in the trace.
        let pos = self
            .action_trace
            .partition_point(|&a| self.actions[a.0].seq <= seq);
        let parent_cv = pos
            .checked_sub(1)
            .and_then(|p| self.actions[self.action_trace[p].0].cv.clone());
        self.actions[act.0].cv = Some(ClockVector::new(parent_cv.as_ref(), tid, seq));
        self.action_trace.insert(pos, act);

        let list = self.obj_map.entry(loc).or_default();
        Self::splice_by_seq(&self.actions, list, act);

        let thrd = Self::per_thread_lists(&mut self.obj_thrd_map, loc, num_threads);
        Self::splice_by_seq(&self.actions, &mut thrd[tid], act);

        if let Some(last) = self.thrd_last_action[tid] {
            if self.actions[last.0].seq == seq {
                self.thrd_last_action[tid] = Some(act);
            }
        } else {
            self.thrd_last_action[tid] = Some(act);
        }
    }

    /// Convert a stashed raw store into a write action at its historical
    /// rank, and order it in the mo-graph.
    fn convert_nonatomic_store(&mut self, location: Location) -> ActionId {
        let store = self
            .nonatomic_stores
            .remove(&location)
            .expect("no stashed nonatomic store for location");
        debug!(location = location.0, tid = store.tid, "lazily observing nonatomic store");
        let mut act = Action::new(
            ActionKind::NonatomicWrite,
            MemOrder::Relaxed,
            store.tid,
            location,
            store.value,
        );
        act.seq = store.clock;
        let id = ActionId(self.actions.len());
        self.actions.push(act);

        self.add_normal_write_to_lists(id);
        let num_threads = self.threads.len();
        let wr = Self::per_thread_lists(&mut self.obj_wr_thrd_map, location, num_threads);
        Self::splice_by_seq(&self.actions, &mut wr[store.tid], id);
        self.w_modification_order(id);
        id
    }

    // -- reads ---------------------------------------------------------------

    /// Build the set of writes this read may observe.
    fn build_may_read_from(&mut self, curr: ActionId) -> Vec<ActionId> {
        let (loc, is_seqcst, is_rmw_read, is_rmw_cas, value, size) = {
            let a = &self.actions[curr.0];
            debug_assert!(a.is_read());
            (a.location, a.is_seqcst(), a.is_rmw_read(), a.is_rmw_cas(), a.value, a.size)
        };

        let last_sc_write = if is_seqcst {
            self.obj_last_sc_map.get(&loc).copied()
        } else {
            None
        };

        let mut rf_set = Vec::new();
        let Some(thrd_lists) = self.obj_wr_thrd_map.get(&loc) else {
            return rf_set;
        };

        for list in thrd_lists {
            for &aid in list.iter().rev() {
                if aid == curr {
                    continue;
                }
                let act = &self.actions[aid.0];
                let mut allow_read = true;

                // A seq_cst read sees at most one seq_cst write: the latest.
                if is_seqcst {
                    let hb_last_sc = last_sc_write
                        .is_some_and(|w| act.happens_before(&self.actions[w.0]));
                    if (act.is_seqcst() || hb_last_sc) && Some(aid) != last_sc_write {
                        allow_read = false;
                    }
                }

                // Two rmws never read from the same write; a failing CAS
                // (comparing unequal at the access width) is exempt.
                if is_rmw_read
                    && (!is_rmw_cas || val_equals(value, act.value, size))
                    && self.mo_graph.rmw_successor(aid).is_some()
                {
                    allow_read = false;
                }

                if allow_read {
                    rf_set.push(aid);
                }

                // Include at most one write per thread that happens before
                // the read.
                if act.happens_before(&self.actions[curr.0]) {
                    break;
                }
            }
        }
        rf_set
    }

    /// Resolve a read: let the oracle rank the candidates, validate each
    /// against read modification order, and commit the first feasible one.
    fn process_read(&mut self, curr: ActionId, mut rf_set: Vec<ActionId>) -> bool {
        let loc = self.actions[curr.0].location;
        if self.nonatomic_stores.contains_key(&loc) {
            let na = self.convert_nonatomic_store(loc);
            rf_set.push(na);
        }

        let mut priorset: SmallVec<[ActionId; 8]> = SmallVec::new();
        loop {
            let index = {
                let refs: Vec<&Action> = rf_set.iter().map(|a| &self.actions[a.0]).collect();
                self.oracle.select_write(&self.actions[curr.0], &refs)
            };
            let Some(index) = index else {
                return false;
            };
            let rf = rf_set[index];

            priorset.clear();
            let mut canprune = false;
            if self.r_modification_order(curr, rf, &mut priorset, &mut canprune) {
                for &prior in &priorset {
                    let added = self.mo_graph.add_edge(prior, rf);
                    debug_assert!(added, "accepted rf produced an mo cycle");
                }
                self.read_from(curr, rf);
                let tid = self.actions[curr.0].tid;
                self.threads[tid].return_value = self.actions[rf.0].value;
                if canprune && self.actions[curr.0].kind == ActionKind::AtomicRead {
                    // The preceding same-thread read pinned the same rf;
                    // it carries no extra mo information.
                    if let Some(lists) = self.obj_thrd_map.get_mut(&loc) {
                        lists[tid].pop();
                    }
                }
                return true;
            }
            rf_set.swap_remove(index);
        }
    }

    /// Establish the reads-from relation, inheriting the release-sequence
    /// clock on acquire.
    fn read_from(&mut self, act: ActionId, rf: ActionId) {
        debug_assert!(self.actions[rf.0].is_write());
        debug_assert!(self.actions[rf.0].location == self.actions[act.0].location);
        self.actions[act.0].reads_from = Some(rf);
        if self.actions[act.0].is_acquire() {
            if let Some(cv) = self.get_hb_from_write(rf) {
                self.actions[act.0]
                    .cv
                    .as_mut()
                    .expect("sealed action has a clock vector")
                    .merge(&cv);
            }
        }
    }

    /// Gets the last seq_cst fence of `tid`, optionally restricted to
    /// fences strictly before `before_fence` in the trace.
    fn get_last_seq_cst_fence(
        &self,
        tid: ThreadId,
        before_fence: Option<ActionId>,
    ) -> Option<ActionId> {
        let list = self.obj_map.get(&FENCE_LOCATION)?;
        let end = match before_fence {
            Some(before) => list
                .iter()
                .position(|&a| a == before)
                .expect("bounding fence not in the fence list"),
            None => list.len(),
        };
        list[..end].iter().rev().copied().find(|&a| {
            let act = &self.actions[a.0];
            act.is_fence() && act.tid == tid && act.is_seqcst()
        })
    }

    /// Read modification order (C++11 §29.3 statements 4-6): collect the
    /// writes that must be mo-before `rf` if `curr` reads from it, or
    /// reject the candidate when the graph already orders `rf` before one
    /// of them. The graph is untouched either way; the caller adds the
    /// edges on accept.
    fn r_modification_order(
        &mut self,
        curr: ActionId,
        rf: ActionId,
        priorset: &mut SmallVec<[ActionId; 8]>,
        canprune: &mut bool,
    ) -> bool {
        debug_assert!(self.actions[curr.0].is_read());
        let loc = self.actions[curr.0].location;
        let curr_tid = self.actions[curr.0].tid;
        let curr_seqcst = self.actions[curr.0].is_seqcst();
        let num_lists = self.obj_thrd_map.get(&loc).map_or(0, |v| v.len());

        let last_sc_fence_local = self.get_last_seq_cst_fence(curr_tid, None);

        let mut tid = curr_tid;
        let mut prev_same_thread: Option<ActionId> = None;
        for i in 0..num_lists {
            let last_sc_fence_thread_local = if i != 0 {
                self.get_last_seq_cst_fence(tid, None)
            } else {
                None
            };
            let last_sc_fence_thread_before =
                last_sc_fence_local.and_then(|f| self.get_last_seq_cst_fence(tid, Some(f)));

            // The walk can be skipped if hb for this thread is unchanged
            // since the previous same-thread action and no seq_cst fence
            // intervened.
            if let Some(prev) = prev_same_thread {
                let prev_act = &self.actions[prev.0];
                let prev_clock = prev_act.cv.as_ref().map_or(0, |cv| cv.get(tid));
                let curr_clock = self.actions[curr.0].cv.as_ref().map_or(0, |cv| cv.get(tid));
                let fence_older = last_sc_fence_thread_local
                    .map_or(true, |f| self.actions[f.0].seq < prev_act.seq);
                if prev_clock == curr_clock && fence_older {
                    tid = if tid + 1 == num_lists { 0 } else { tid + 1 };
                    continue;
                }
            }

            let list_len = self.obj_thrd_map[&loc][tid].len();
            for j in (0..list_len).rev() {
                let aid = self.obj_thrd_map[&loc][tid][j];
                if aid == curr {
                    continue;
                }
                // No reflexive edges on rf itself.
                if aid == rf {
                    if self.actions[aid.0].happens_before(&self.actions[curr.0]) {
                        break;
                    }
                    continue;
                }

                let act_is_write = self.actions[aid.0].is_write();
                let act_seq = self.actions[aid.0].seq;

                if act_is_write {
                    let seq_before = |f: Option<ActionId>| {
                        f.is_some_and(|f| act_seq < self.actions[f.0].seq)
                    };
                    // §29.3/5: seq_cst read after a seq_cst fence in act's
                    // thread; §29.3/4: seq_cst write before our own fence;
                    // §29.3/6: fence-to-fence ordering.
                    if (curr_seqcst && seq_before(last_sc_fence_thread_local))
                        || (self.actions[aid.0].is_seqcst() && seq_before(last_sc_fence_local))
                        || seq_before(last_sc_fence_thread_before)
                    {
                        if self.mo_graph.reachable(rf, aid) {
                            return false;
                        }
                        priorset.push(aid);
                        break;
                    }
                }

                // Include at most one action per thread that happens before
                // the read.
                if self.actions[aid.0].happens_before(&self.actions[curr.0]) {
                    if i == 0 {
                        let past_fence = last_sc_fence_local
                            .map_or(true, |f| self.actions[f.0].seq < act_seq);
                        if past_fence {
                            prev_same_thread = Some(aid);
                        }
                    }
                    if act_is_write {
                        if self.mo_graph.reachable(rf, aid) {
                            return false;
                        }
                        priorset.push(aid);
                    } else if let Some(prevrf) = self.actions[aid.0].reads_from {
                        if prevrf != rf {
                            if self.mo_graph.reachable(rf, prevrf) {
                                return false;
                            }
                            priorset.push(prevrf);
                        } else if self.actions[aid.0].tid == curr_tid {
                            // The earlier same-thread read already pinned
                            // this rf; curr may be pruned from the index.
                            *canprune = true;
                        }
                    }
                    break;
                }
            }
            tid = if tid + 1 == num_lists { 0 } else { tid + 1 };
        }
        true
    }

    // -- writes --------------------------------------------------------------

    fn process_write(&mut self, curr: ActionId) {
        self.w_modification_order(curr);
        let tid = self.actions[curr.0].tid;
        self.threads[tid].return_value = VALUE_NONE;
    }

    /// Write modification order: the edges a new write imposes (C++11
    /// §29.3 statement 7 and coherence). A cycle here is a model bug.
    fn w_modification_order(&mut self, curr: ActionId) {
        debug_assert!(self.actions[curr.0].is_write());
        let loc = self.actions[curr.0].location;
        let curr_tid = self.actions[curr.0].tid;
        let curr_is_rmw = self.actions[curr.0].is_rmw();
        let curr_rf = self.actions[curr.0].reads_from;

        let mut edgeset: SmallVec<[ActionId; 8]> = SmallVec::new();

        if self.actions[curr.0].is_seqcst() {
            // The new write is ordered after the previous seq_cst write.
            if let Some(&last_sc) = self.obj_last_sc_map.get(&loc) {
                edgeset.push(last_sc);
            }
            self.obj_last_sc_map.insert(loc, curr);
        }

        let last_sc_fence_local = self.get_last_seq_cst_fence(curr_tid, None);
        let num_lists = self.obj_thrd_map.get(&loc).map_or(0, |v| v.len());

        for tid in 0..num_lists {
            let last_sc_fence_thread_before = if last_sc_fence_local.is_some() && tid != curr_tid {
                self.get_last_seq_cst_fence(tid, last_sc_fence_local)
            } else {
                None
            };

            let list_len = self.obj_thrd_map[&loc][tid].len();
            for j in (0..list_len).rev() {
                let aid = self.obj_thrd_map[&loc][tid][j];
                if aid == curr {
                    // An rmw that resolved its read already has every
                    // relevant edge through the rmw chain.
                    if curr_is_rmw {
                        if curr_rf.is_some() {
                            break;
                        }
                        continue;
                    }
                    continue;
                }

                let act_is_write = self.actions[aid.0].is_write();
                if let Some(f) = last_sc_fence_thread_before {
                    if act_is_write && self.actions[aid.0].seq < self.actions[f.0].seq {
                        edgeset.push(aid);
                        break;
                    }
                }

                // Include at most one action per thread that happens before
                // the write.
                if self.actions[aid.0].happens_before(&self.actions[curr.0]) {
                    if act_is_write {
                        edgeset.push(aid);
                    } else if let Some(prevrf) = self.actions[aid.0].reads_from {
                        edgeset.push(prevrf);
                    }
                    break;
                }
            }
        }

        let acyclic = self.mo_graph.add_edges(&edgeset, curr);
        assert!(acyclic, "modification-order cycle while processing a write");
    }

    // -- release sequences ---------------------------------------------------

    /// The clock vector an acquire-reader of `rf` inherits, honoring
    /// release sequences: walk the rmw chain back to a node that settles
    /// the clock, then unwind, caching the result in each visited node.
    fn get_hb_from_write(&mut self, rf: ActionId) -> Option<ClockVector> {
        let mut node = rf;
        let mut chain: SmallVec<[ActionId; 4]> = SmallVec::new();
        loop {
            let act = &self.actions[node.0];
            debug_assert!(act.is_write());
            if !act.is_rmw() || (act.is_acquire() && act.is_release()) || act.rfcv.is_some() {
                break;
            }
            chain.push(node);
            node = act
                .reads_from
                .expect("rmw in a release chain always reads from some write");
        }

        let mut vec: Option<ClockVector> = None;
        let mut i = chain.len();
        loop {
            let (cached, is_acq, is_rel, is_rmw, cv, lfr) = {
                let act = &self.actions[node.0];
                (
                    act.rfcv.clone(),
                    act.is_acquire(),
                    act.is_release(),
                    act.is_rmw(),
                    act.cv.clone().expect("sealed action has a clock vector"),
                    act.last_fence_release,
                )
            };

            if let Some(cached) = cached {
                vec = Some(cached);
            } else if is_acq && is_rel {
                vec = Some(cv);
            } else if is_rel && !is_rmw {
                vec = Some(cv);
            } else if is_rel {
                // A release rmw extends the sequence it continues.
                match vec.as_mut() {
                    Some(v) => {
                        v.merge(&cv);
                    }
                    None => unreachable!("release rmw heads a release sequence with no clock"),
                }
                self.actions[node.0].rfcv = vec.clone();
            } else {
                // Not a release: only a prior release fence contributes.
                if let Some(f) = lfr {
                    let fence_cv = self.actions[f.0]
                        .cv
                        .clone()
                        .expect("sealed action has a clock vector");
                    match vec.as_mut() {
                        Some(v) => {
                            v.merge(&fence_cv);
                        }
                        None => vec = Some(fence_cv),
                    }
                }
                self.actions[node.0].rfcv = vec.clone();
            }

            if i == 0 {
                break;
            }
            i -= 1;
            node = chain[i];
        }
        vec
    }

    // -- fences --------------------------------------------------------------

    /// fence-relaxed is a no-op; fence-release is logged at insertion;
    /// fence-seq-cst participates through the modification-order scans. A
    /// fence-acquire establishes hypothetical release sequences for every
    /// prior non-acquire read of its thread.
    fn process_fence(&mut self, curr: ActionId) -> bool {
        if !self.actions[curr.0].is_acquire() {
            return false;
        }
        let curr_tid = self.actions[curr.0].tid;

        let mut rfs: SmallVec<[ActionId; 4]> = SmallVec::new();
        for &aid in self.action_trace.iter().rev() {
            if aid == curr {
                continue;
            }
            let act = &self.actions[aid.0];
            if act.tid != curr_tid {
                continue;
            }
            // Stop at the beginning of the thread or a prior fence-acquire.
            if act.is_thread_start() {
                break;
            }
            if act.is_fence() && act.is_acquire() {
                break;
            }
            if !act.is_read() {
                continue;
            }
            // A read-acquire found its own release sequences already.
            if act.is_acquire() {
                continue;
            }
            if let Some(rf) = act.reads_from {
                rfs.push(rf);
            }
        }

        let mut updated = false;
        for rf in rfs {
            if let Some(cv) = self.get_hb_from_write(rf) {
                let fence_cv = self.actions[curr.0]
                    .cv
                    .as_mut()
                    .expect("sealed action has a clock vector");
                if fence_cv.merge(&cv) {
                    updated = true;
                }
            }
        }
        updated
    }

    // -- synchronization -----------------------------------------------------

    /// `second` inherits `first`'s clock vector. Synchronizing with a
    /// later-than-self action is a fatal model bug.
    fn synchronize(&mut self, first: ActionId, second: ActionId) -> bool {
        let first_seq = self.actions[first.0].seq;
        let second_seq = self.actions[second.0].seq;
        assert!(
            second_seq >= first_seq,
            "synchronizing action {} with later action {}",
            second_seq,
            first_seq
        );
        let first_cv = self.actions[first.0]
            .cv
            .clone()
            .expect("sealed action has a clock vector");
        self.actions[second.0]
            .cv
            .as_mut()
            .expect("sealed action has a clock vector")
            .merge(&first_cv)
    }

    // -- mutexes and condition variables -------------------------------------

    /// Most recent unlock (or mutex-releasing wait) on the location.
    fn get_last_unlock(&self, curr: ActionId) -> Option<ActionId> {
        let loc = self.actions[curr.0].location;
        let list = self.obj_map.get(&loc)?;
        list.iter()
            .rev()
            .copied()
            .find(|&a| self.actions[a.0].is_unlock() || self.actions[a.0].is_wait())
    }

    fn lock_mutex(&mut self, curr: ActionId) {
        let loc = self.actions[curr.0].location;
        let tid = self.actions[curr.0].tid;
        self.mutex_map.entry(loc).or_default().locked = Some(tid);
        // Synchronize with the previous unlock on the same mutex.
        if let Some(unlock) = self.get_last_unlock(curr) {
            self.synchronize(unlock, curr);
        }
    }

    /// Wake every thread blocked trying to lock a mutex held by `owner`.
    fn wake_lock_waiters(&mut self, owner: ThreadId) {
        for tid in 0..self.threads.len() {
            let waiting = self.threads[tid].waiting_on == Some(owner)
                && self.threads[tid]
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.is_lock());
            if waiting {
                self.scheduler.wake(tid);
                self.threads[tid].unblock();
            }
        }
    }

    fn process_mutex(&mut self, curr: ActionId) {
        let (kind, loc, tid, value) = {
            let a = &self.actions[curr.0];
            (a.kind, a.location, a.tid, a.value)
        };
        match kind {
            ActionKind::TryLock => {
                let held = self.mutex_map.entry(loc).or_default().locked.is_some();
                if held {
                    self.actions[curr.0].value = VALUE_TRYFAILED;
                    self.threads[tid].return_value = 0;
                } else {
                    self.actions[curr.0].value = VALUE_TRYSUCCESS;
                    self.threads[tid].return_value = 1;
                    self.lock_mutex(curr);
                }
            }
            ActionKind::Lock => {
                self.lock_mutex(curr);
            }
            ActionKind::Wait => {
                self.wake_lock_waiters(tid);
                // The wait releases its mutex (stored as the action value).
                self.mutex_map.entry(Location(value)).or_default().locked = None;

                let park = {
                    let act = &self.actions[curr.0];
                    self.oracle.should_wait(act)
                };
                if park {
                    trace!(tid, condvar = loc.0, "parking thread on condition variable");
                    self.condvar_waiters_map.entry(loc).or_default().push(curr);
                    let pending = self.actions[curr.0].clone();
                    self.threads[tid].block_on(None, pending);
                    self.scheduler.sleep(tid);
                }
            }
            ActionKind::TimedWait | ActionKind::Unlock => {
                self.wake_lock_waiters(tid);
                let mutex_loc = if kind == ActionKind::TimedWait {
                    Location(value)
                } else {
                    loc
                };
                self.mutex_map.entry(mutex_loc).or_default().locked = None;
            }
            ActionKind::NotifyAll => {
                let waiters = self
                    .condvar_waiters_map
                    .get_mut(&loc)
                    .map(std::mem::take)
                    .unwrap_or_default();
                for waiter in waiters {
                    let wtid = self.actions[waiter.0].tid;
                    self.scheduler.wake(wtid);
                    self.threads[wtid].unblock();
                }
            }
            ActionKind::NotifyOne => {
                let waiter_tids: Vec<ThreadId> = self
                    .condvar_waiters_map
                    .get(&loc)
                    .map(|w| w.iter().map(|&a| self.actions[a.0].tid).collect())
                    .unwrap_or_default();
                if !waiter_tids.is_empty() {
                    let index = self.oracle.select_notify(&waiter_tids);
                    let wtid = waiter_tids[index];
                    self.condvar_waiters_map
                        .get_mut(&loc)
                        .expect("waiter list exists")
                        .remove(index);
                    self.scheduler.wake(wtid);
                    self.threads[wtid].unblock();
                }
            }
            _ => unreachable!("process_mutex on non-mutex action {:?}", kind),
        }
    }

    // -- thread lifecycle ----------------------------------------------------

    fn process_thread_action(&mut self, curr: ActionId) {
        let (kind, tid) = {
            let a = &self.actions[curr.0];
            (a.kind, a.tid)
        };
        match kind {
            ActionKind::ThreadCreate | ActionKind::PthreadCreate => {
                let child = self.add_thread(Some(tid));
                self.actions[curr.0].thread_operand = Some(child);
                self.threads[child].creation = Some(curr);
                debug!(parent = tid, child, "thread created");
                if kind == ActionKind::PthreadCreate {
                    let pid = self.pthread_counter;
                    self.pthread_counter += 1;
                    self.threads[child].user_pthread = Some(pid);
                    if self.pthread_map.len() <= pid as usize {
                        self.pthread_map.resize(pid as usize + 1, None);
                    }
                    self.pthread_map[pid as usize] = Some(child);
                    // The handle value is user visible.
                    self.actions[curr.0].value = u64::from(pid);
                    self.threads[tid].return_value = u64::from(pid);
                }
            }
            ActionKind::ThreadJoin | ActionKind::PthreadJoin => {
                let target = self.actions[curr.0]
                    .thread_operand
                    .expect("join action without a target thread");
                if let Some(last) = self.get_last_action(target) {
                    self.synchronize(last, curr);
                }
            }
            ActionKind::ThreadFinish => {
                if tid == INITIAL_THREAD_ID {
                    self.threads[tid].complete();
                    self.is_finished = true;
                    debug!("initial thread finished; execution finished");
                    return;
                }
                // Wake any joiners.
                for t in 0..self.threads.len() {
                    let joining = self.threads[t].waiting_on == Some(tid)
                        && self.threads[t]
                            .pending
                            .as_ref()
                            .is_some_and(|p| p.is_thread_join());
                    if joining {
                        self.scheduler.wake(t);
                        self.threads[t].unblock();
                    }
                }
                self.threads[tid].complete();
            }
            ActionKind::ThreadStart => {}
            ActionKind::ThreadSleep => {
                let pending = self.actions[curr.0].clone();
                self.threads[tid].pending = Some(pending);
                self.scheduler.add_sleep(tid);
            }
            _ => {}
        }
    }

    /// RMW halves must not be split, and a created thread runs next; in
    /// either case the current action determines the schedule.
    fn action_select_next_thread(&self, curr: ActionId) -> Option<ThreadId> {
        let act = &self.actions[curr.0];
        // A read postponed by the oracle (seq reset to 0) releases its pin.
        if act.is_rmw_read() && act.seq != 0 {
            return Some(act.tid);
        }
        if matches!(act.kind, ActionKind::ThreadCreate | ActionKind::PthreadCreate) {
            return act.thread_operand;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind as K;
    use crate::oracle::RandomOracle;

    fn exec() -> Execution {
        Execution::new(Params::default(), Box::new(RandomOracle::new(0)))
    }

    fn read(tid: ThreadId, order: MemOrder, loc: u64) -> Action {
        Action::new(K::AtomicRead, order, tid, Location(loc), 0)
    }

    fn write(tid: ThreadId, order: MemOrder, loc: u64, value: u64) -> Action {
        Action::new(K::AtomicWrite, order, tid, Location(loc), value)
    }

    fn executed(outcome: StepOutcome) -> ActionId {
        match outcome {
            StepOutcome::Executed { action, .. } => action,
            other => panic!("expected Executed, got {:?}", other),
        }
    }

    #[test]
    fn test_new_execution_has_model_and_init_threads() {
        let e = exec();
        assert_eq!(e.num_threads(), 2);
        assert!(e.thread(MODEL_THREAD_ID).is_model_thread());
        assert!(e.is_enabled(INITIAL_THREAD_ID));
        assert!(!e.is_enabled(MODEL_THREAD_ID));
    }

    #[test]
    fn test_first_read_sees_uninit_value() {
        let mut e = Execution::new(
            Params {
                uninit_value: 99,
                ..Params::default()
            },
            Box::new(RandomOracle::new(0)),
        );
        let r = executed(e.step(read(1, MemOrder::Relaxed, 0x10)));
        let rf = e.action(r).reads_from.expect("read resolved");
        assert_eq!(e.action(rf).kind, K::Uninit);
        assert_eq!(e.action(rf).value, 99);
        assert_eq!(e.thread_return_value(1), 99);
    }

    #[test]
    fn test_sequence_numbers_are_monotone_in_trace() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x10, 1));
        e.step(write(1, MemOrder::Relaxed, 0x20, 2));
        e.step(read(1, MemOrder::Relaxed, 0x10));
        let seqs: Vec<_> = e
            .action_trace()
            .iter()
            .map(|&a| e.action(a).seq)
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_read_observes_only_write_to_location() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x10, 7));
        let r = executed(e.step(read(1, MemOrder::Relaxed, 0x10)));
        // Same-thread read must see the hb-latest write, not the uninit.
        let rf = e.action(r).reads_from.unwrap();
        assert_eq!(e.action(rf).value, 7);
        assert_eq!(e.action(rf).location, Location(0x10));
        assert!(e.action(rf).is_write());
    }

    #[test]
    fn test_mo_graph_stays_acyclic() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();
        e.step(write(1, MemOrder::Relaxed, 0x10, 1));
        e.step(write(t2, MemOrder::Relaxed, 0x10, 2));
        e.step(write(1, MemOrder::SeqCst, 0x10, 3));
        e.step(write(t2, MemOrder::SeqCst, 0x10, 4));
        e.step(read(1, MemOrder::Relaxed, 0x10));
        assert!(e.mo_graph.is_acyclic());
    }

    #[test]
    fn test_rmw_fusion_substitutes_pending_read() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x10, 5));
        let r = executed(e.step(Action::new(K::RmwRead, MemOrder::Acquire, 1, Location(0x10), 0)));
        // The engine pins the schedule to the same thread mid-rmw.
        let mut commit = Action::new(K::Rmw, MemOrder::Release, 1, Location(0x10), 6);
        commit.size = 8;
        let fused = executed(e.step(commit));
        assert_eq!(fused, r);
        assert_eq!(e.action(fused).kind, K::Rmw);
        assert_eq!(e.action(fused).value, 6);
        assert!(e.action(fused).is_write());
        assert!(e.mo_graph.is_acyclic());
    }

    #[test]
    fn test_failed_cas_fuses_to_plain_read() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x10, 5));
        let r = executed(e.step(Action::new(
            K::RmwReadCas,
            MemOrder::Relaxed,
            1,
            Location(0x10),
            4, // expected value; actual is 5, so the CAS fails
        )));
        let fused = executed(e.step(Action::new(
            K::RmwCommit,
            MemOrder::Relaxed,
            1,
            Location(0x10),
            0,
        )));
        assert_eq!(fused, r);
        assert_eq!(e.action(fused).kind, K::AtomicRead);
        assert!(!e.action(fused).is_write());
    }

    #[test]
    fn test_rmw_read_pins_next_thread() {
        let mut e = exec();
        let outcome = e.step(Action::new(K::RmwRead, MemOrder::Relaxed, 1, Location(0x10), 0));
        match outcome {
            StepOutcome::Executed { next_thread, .. } => assert_eq!(next_thread, Some(1)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_thread_create_runs_child_next() {
        let mut e = exec();
        let outcome = e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        ));
        match outcome {
            StepOutcome::Executed {
                action,
                next_thread,
            } => {
                let child = e.action(action).thread_operand.unwrap();
                assert_eq!(next_thread, Some(child));
                assert!(e.is_enabled(child));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_child_inherits_creator_clock() {
        let mut e = exec();
        let w = executed(e.step(write(1, MemOrder::Relaxed, 0x10, 1)));
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();
        let start = executed(e.step(Action::new(
            K::ThreadStart,
            MemOrder::Relaxed,
            t2,
            Location(0x1000),
            0,
        )));
        // The child's first action observes the creator's prior write.
        let w_act = e.action(w).clone();
        assert!(w_act.happens_before(e.action(start)));
    }

    #[test]
    fn test_lock_blocks_second_thread() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();
        let m = Location(0x40);
        e.step(Action::new(K::Lock, MemOrder::Acquire, 1, m, 0));
        let outcome = e.step(Action::new(K::Lock, MemOrder::Acquire, t2, m, 0));
        assert!(matches!(outcome, StepOutcome::Blocked { tid } if tid == t2));
        assert!(!e.is_enabled(t2));

        // Unlock wakes the blocked locker.
        e.step(Action::new(K::Unlock, MemOrder::Release, 1, m, 0));
        assert!(e.is_enabled(t2));
        let pending = e.take_pending(t2).expect("pending lock survives");
        assert_eq!(pending.kind, K::Lock);
        // Resubmission succeeds now.
        let outcome = e.step(pending);
        assert!(matches!(outcome, StepOutcome::Executed { .. }));
    }

    #[test]
    fn test_trylock_fails_without_blocking() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();
        let m = Location(0x40);
        e.step(Action::new(K::Lock, MemOrder::Acquire, 1, m, 0));
        let outcome = e.step(Action::new(K::TryLock, MemOrder::Acquire, t2, m, 0));
        assert!(matches!(outcome, StepOutcome::Executed { .. }));
        assert_eq!(e.thread_return_value(t2), 0);
        assert!(e.is_enabled(t2));
    }

    #[test]
    fn test_lock_synchronizes_with_unlock() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();
        let m = Location(0x40);
        e.step(Action::new(K::Lock, MemOrder::Acquire, 1, m, 0));
        e.step(write(1, MemOrder::Relaxed, 0x10, 42));
        let unlock = executed(e.step(Action::new(K::Unlock, MemOrder::Release, 1, m, 0)));
        let lock2 = executed(e.step(Action::new(K::Lock, MemOrder::Acquire, t2, m, 0)));
        let unlock_act = e.action(unlock).clone();
        assert!(unlock_act.happens_before(e.action(lock2)));
    }

    #[test]
    fn test_thread_finish_wakes_joiner() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::ThreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let t2 = e.action(create).thread_operand.unwrap();

        let mut join = Action::new(K::ThreadJoin, MemOrder::Relaxed, 1, Location(0x1000), 0);
        join.thread_operand = Some(t2);
        let outcome = e.step(join);
        assert!(matches!(outcome, StepOutcome::Blocked { tid } if tid == 1));

        e.step(Action::new(K::ThreadFinish, MemOrder::Relaxed, t2, Location(0x2000), 0));
        assert!(e.is_enabled(1));
        let pending = e.take_pending(1).unwrap();
        let outcome = e.step(pending);
        assert!(matches!(outcome, StepOutcome::Executed { .. }));
        assert!(e.thread(t2).is_complete());
    }

    #[test]
    fn test_init_thread_finish_marks_execution_finished() {
        let mut e = exec();
        e.step(Action::new(K::ThreadFinish, MemOrder::Relaxed, 1, Location(0x2000), 0));
        assert!(e.is_finished());
        assert!(e.is_complete_execution());
    }

    #[test]
    fn test_nonatomic_store_lazily_spliced() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x20, 1)); // unrelated, consumes seq 1
        e.record_nonatomic_store(Location(0x10), 1, 77);
        e.step(write(1, MemOrder::Relaxed, 0x20, 2)); // seq 2
        let r = executed(e.step(read(1, MemOrder::Relaxed, 0x10)));

        // The raw store is now an action, ranked where it happened.
        let na = e
            .action_trace()
            .iter()
            .copied()
            .find(|&a| e.action(a).kind == K::NonatomicWrite)
            .expect("nonatomic store converted");
        assert_eq!(e.action(na).value, 77);
        assert_eq!(e.action(na).seq, 1);
        // Trace order still matches sequence order.
        let seqs: Vec<_> = e.action_trace().iter().map(|&a| e.action(a).seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
        // And the read could have observed it.
        let rf = e.action(r).reads_from.unwrap();
        assert!(e.action(rf).value == 77 || e.action(rf).kind == K::Uninit);
    }

    #[test]
    fn test_bug_reporting() {
        let mut e = exec();
        assert!(!e.have_bug_reports());
        e.assert_bug("data race on x");
        assert!(e.have_bug_reports());
        assert!(e.has_asserted());
        assert_eq!(e.bugs()[0].to_string(), "data race on x");
    }

    #[test]
    fn test_restore_last_seq_num() {
        let mut e = exec();
        e.step(write(1, MemOrder::Relaxed, 0x10, 1));
        let before = e.action(*e.action_trace().last().unwrap()).seq;
        e.restore_last_seq_num();
        e.step(write(1, MemOrder::Relaxed, 0x10, 2));
        let after = e.action(*e.action_trace().last().unwrap()).seq;
        assert_eq!(before, after);
    }

    #[test]
    fn test_pthread_create_assigns_handle() {
        let mut e = exec();
        let create = executed(e.step(Action::new(
            K::PthreadCreate,
            MemOrder::Relaxed,
            1,
            Location(0x1000),
            0,
        )));
        let pid = e.action(create).value as u32;
        let child = e.action(create).thread_operand.unwrap();
        assert_eq!(e.get_pthread(pid), Some(child));
    }
}
