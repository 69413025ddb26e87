//! Kernel state and the per-computation automaton.
//!
//! State is a pure function of `(dirty, observe_count, dirty_input_count)`;
//! there is no stored state field. The four mutable fields are changed only
//! through the helpers here, which compute the before/after state and react:
//! aborting in-flight work or enqueueing the computation.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Weak;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::trace;

use crate::clock::{LogicalClock, Tick};
use crate::graph::{Computation, GraphStore, ObserverFn};
use crate::kernel::KernelConfig;
use crate::result::{CellResult, ComputationId};

/// The three-state automaton every computation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompState {
    /// Clean, or nobody is watching. Never has a running task.
    Idle,
    /// Dirty and watched, but blocked on dirty computed inputs.
    Pending,
    /// Dirty, watched, inputs settled. The single stable execution state.
    Ready,
}

pub fn classify(comp: &Computation) -> CompState {
    if !comp.dirty || comp.observe_count == 0 {
        CompState::Idle
    } else if comp.dirty_input_count > 0 {
        CompState::Pending
    } else {
        CompState::Ready
    }
}

/// Which field mutation drove a transition. Ready -> Idle aborts only when
/// driven by the observe count: losing `dirty` means the task just
/// succeeded and is entering cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Dirty,
    Observe,
    DirtyInputs,
}

/// A pending observer callback, delivered after the current mutation batch
/// releases the state borrow.
pub(crate) struct Notification {
    pub observer: ObserverFn,
    pub result: CellResult,
}

/// All mutable kernel state. Lives in `Rc<RefCell<..>>`; only the scheduler
/// thread touches it, and borrows are never held across an await.
pub(crate) struct KernelState {
    pub cfg: KernelConfig,
    pub clock: LogicalClock,
    pub store: GraphStore,
    /// FIFO of computations whose dispatch has not yet begun.
    pub ready: VecDeque<ComputationId>,
    pub ready_set: HashSet<ComputationId>,
    /// Bodies whose futures have not yet settled, aborting ones included.
    pub tasks_in_flight: usize,
    pub next_task_id: u64,
    pub next_observer_id: u64,
    /// A drain of the ready queue is already queued on the runtime.
    pub tick_scheduled: bool,
    pub idle_waiters: Vec<oneshot::Sender<()>>,
    pub notifications: Vec<Notification>,
    /// Self-handle for deferred scheduling from deep inside mutations.
    pub this: Weak<RefCell<KernelState>>,
}

impl KernelState {
    pub fn new(cfg: KernelConfig) -> Self {
        Self {
            cfg,
            clock: LogicalClock::new(),
            store: GraphStore::default(),
            ready: VecDeque::new(),
            ready_set: HashSet::new(),
            tasks_in_flight: 0,
            next_task_id: 0,
            next_observer_id: 0,
            tick_scheduled: false,
            idle_waiters: Vec::new(),
            notifications: Vec::new(),
            this: Weak::new(),
        }
    }

    /// Quiescence: nothing queued, nothing in flight, no drain pending.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.tasks_in_flight == 0 && !self.tick_scheduled
    }

    pub fn aborting_total(&self) -> usize {
        self.store
            .comps
            .values()
            .map(|c| c.aborting_tasks.len())
            .sum()
    }

    // ---- field mutation helpers (the only writers of the four fields) ----

    pub fn set_comp_dirty(&mut self, id: &str, value: bool) {
        let Some(comp) = self.store.comps.get_mut(id) else {
            return;
        };
        if comp.dirty == value {
            return;
        }
        let before = classify(comp);
        comp.dirty = value;
        self.transition(id, before, Trigger::Dirty);
    }

    pub fn add_comp_observe(&mut self, id: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let Some(comp) = self.store.comps.get_mut(id) else {
            return;
        };
        let before = classify(comp);
        comp.observe_count += delta;
        debug_assert!(comp.observe_count >= 0, "observe_count underflow on '{id}'");
        self.transition(id, before, Trigger::Observe);
    }

    pub fn add_comp_dirty_inputs(&mut self, id: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let Some(comp) = self.store.comps.get_mut(id) else {
            return;
        };
        let before = classify(comp);
        comp.dirty_input_count += delta;
        debug_assert!(
            comp.dirty_input_count >= 0,
            "dirty_input_count underflow on '{id}'"
        );
        self.transition(id, before, Trigger::DirtyInputs);
    }

    /// Raise `cause_at` (monotonic; lower values are ignored). A running
    /// task whose captured cause falls behind is superseded and aborted;
    /// dynamic attaches pre-bump the task so legitimate runtime access
    /// passes this check untouched.
    ///
    /// Returns whether the cause actually rose.
    pub fn raise_comp_cause(&mut self, id: &str, new_cause: Tick) -> bool {
        let Some(comp) = self.store.comps.get_mut(id) else {
            return false;
        };
        if new_cause <= comp.cause_at {
            return false;
        }
        comp.cause_at = new_cause;
        let superseded = comp
            .running_task
            .as_ref()
            .is_some_and(|task| task.cause_at < new_cause);
        if superseded {
            trace!(comp = id, cause = new_cause, "task superseded by cause raise");
            self.abort_running(id);
        }
        true
    }

    fn transition(&mut self, id: &str, before: CompState, trigger: Trigger) {
        let Some(comp) = self.store.comps.get(id) else {
            return;
        };
        let after = classify(comp);
        if before == after {
            // (Ready, task) -> (Ready, none) re-scheduling is handled where
            // the task is cleared.
            if after == CompState::Ready && comp.running_task.is_none() {
                self.enqueue_ready(id);
            }
            return;
        }
        trace!(comp = id, ?before, ?after, ?trigger, "state transition");
        match (before, after) {
            (CompState::Ready, CompState::Pending) => self.abort_running(id),
            (CompState::Ready, CompState::Idle) if trigger == Trigger::Observe => {
                // Nobody is waiting anymore; in-flight work would be wasted.
                self.abort_running(id)
            }
            (_, CompState::Ready) => {
                if self
                    .store
                    .comps
                    .get(id)
                    .is_some_and(|c| c.running_task.is_none())
                {
                    self.enqueue_ready(id);
                }
            }
            _ => {}
        }
    }

    /// Cancel the running task, if any: fire its signal, park it with the
    /// aborting set, and re-evaluate scheduling, because (Ready, task)
    /// becoming (Ready, none) is a fresh dispatch opportunity even though
    /// the state did not change.
    pub fn abort_running(&mut self, id: &str) {
        let Some(comp) = self.store.comps.get_mut(id) else {
            return;
        };
        let Some(task) = comp.running_task.take() else {
            return;
        };
        trace!(comp = id, task = task.id, "aborting running task");
        task.signal.abort();
        comp.aborting_tasks.push(task);
        if classify(comp) == CompState::Ready {
            self.enqueue_ready(id);
        }
    }

    /// FIFO enqueue, de-duplicated. Draining happens on the next tick.
    pub fn enqueue_ready(&mut self, id: &str) {
        if self.ready_set.insert(id.to_string()) {
            trace!(comp = id, "enqueued");
            self.ready.push_back(id.to_string());
        }
    }

    /// Queue current-result notifications for every observer of a variable.
    pub fn queue_notifications_for(&mut self, var_id: &str) {
        let pairs: Vec<(ObserverFn, CellResult)> = match self.store.any_var(var_id) {
            Some(var) => var
                .observers
                .values()
                .map(|obs| (obs.clone(), var.result.clone()))
                .collect(),
            None => return,
        };
        for (observer, result) in pairs {
            self.notifications.push(Notification { observer, result });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::body;
    use crate::graph::{Definition, TaskHandle};
    use crate::signal::AbortSignal;

    fn test_comp(id: &str) -> Computation {
        Computation::new(&Definition {
            id: id.to_string(),
            inputs: vec![],
            outputs: vec![format!("v{id}")],
            body: body(|_, _| async { Ok(Default::default()) }),
        })
    }

    fn state_with(comp: Computation) -> KernelState {
        let mut st = KernelState::new(KernelConfig::default());
        st.store.comps.insert(comp.id.clone(), comp);
        st
    }

    #[test]
    fn classification_table() {
        let mut comp = test_comp("c");
        // fresh: dirty, unobserved
        assert_eq!(classify(&comp), CompState::Idle);
        comp.observe_count = 1;
        assert_eq!(classify(&comp), CompState::Ready);
        comp.dirty_input_count = 2;
        assert_eq!(classify(&comp), CompState::Pending);
        comp.dirty = false;
        assert_eq!(classify(&comp), CompState::Idle);
    }

    #[test]
    fn becoming_ready_enqueues_once() {
        let mut st = state_with(test_comp("c"));
        st.add_comp_observe("c", 1);
        assert_eq!(st.ready.len(), 1);
        // A second transition into Ready does not duplicate the entry.
        st.add_comp_observe("c", 1);
        assert_eq!(st.ready.len(), 1);
    }

    #[test]
    fn dirty_input_blocks_and_unblocks() {
        let mut st = state_with(test_comp("c"));
        st.add_comp_dirty_inputs("c", 1);
        st.add_comp_observe("c", 1);
        assert!(st.ready.is_empty());
        st.add_comp_dirty_inputs("c", -1);
        assert_eq!(st.ready.len(), 1);
    }

    #[test]
    fn observe_drop_aborts_running_task() {
        let mut st = state_with(test_comp("c"));
        st.add_comp_observe("c", 1);
        let signal = AbortSignal::new();
        {
            let comp = st.store.comps.get_mut("c").unwrap();
            comp.running_task = Some(TaskHandle {
                id: 7,
                cause_at: comp.cause_at,
                signal: signal.clone(),
                accessed: Default::default(),
            });
        }
        st.add_comp_observe("c", -1);
        assert!(signal.is_aborted());
        let comp = st.store.comps.get("c").unwrap();
        assert!(comp.running_task.is_none());
        assert_eq!(comp.aborting_tasks.len(), 1);
    }

    #[test]
    fn clean_completion_does_not_abort() {
        let mut st = state_with(test_comp("c"));
        st.add_comp_observe("c", 1);
        let signal = AbortSignal::new();
        {
            let comp = st.store.comps.get_mut("c").unwrap();
            comp.running_task = Some(TaskHandle {
                id: 7,
                cause_at: comp.cause_at,
                signal: signal.clone(),
                accessed: Default::default(),
            });
        }
        // dirty -> false is the success-cleanup path; the task must survive.
        st.set_comp_dirty("c", false);
        assert!(!signal.is_aborted());
        assert!(st.store.comps.get("c").unwrap().running_task.is_some());
    }

    #[test]
    fn cause_raise_aborts_superseded_snapshot_only() {
        let mut st = state_with(test_comp("c"));
        st.add_comp_observe("c", 1);
        let signal = AbortSignal::new();
        {
            let comp = st.store.comps.get_mut("c").unwrap();
            comp.cause_at = 5;
            comp.running_task = Some(TaskHandle {
                id: 1,
                cause_at: 5,
                signal: signal.clone(),
                accessed: Default::default(),
            });
        }
        // Equal cause (pre-bumped dynamic attach): no abort.
        assert!(!st.raise_comp_cause("c", 5));
        assert!(!signal.is_aborted());
        // Higher cause: the snapshot is stale.
        assert!(st.raise_comp_cause("c", 6));
        assert!(signal.is_aborted());
    }

    #[test]
    fn cause_is_monotonic() {
        let mut st = state_with(test_comp("c"));
        assert!(st.raise_comp_cause("c", 4));
        assert!(!st.raise_comp_cause("c", 3));
        assert_eq!(st.store.comps.get("c").unwrap().cause_at, 4);
    }
}
