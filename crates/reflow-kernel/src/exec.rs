//! Scheduler and executor: ready-queue draining, bounded concurrency, body
//! execution, dynamic-dependency capture, and pull-mode evaluation.
//!
//! One conceptual scheduler loop serializes all kernel mutation. Bodies are
//! spawned on the current-thread runtime (`spawn_local`); between their
//! await points the kernel may run or abort other tasks. Draining is always
//! deferred to a fresh tick so mutation never re-enters the scheduler.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use indexmap::IndexSet;
use tracing::{debug, trace};

use crate::clock::Tick;
use crate::graph::TaskHandle;
use crate::result::{
    Aborted, CellResult, ComputationId, ExecError, FatalAccess, InvalidDynamicAccess,
    UninitializedAccess, Value,
};
use crate::signal::AbortSignal;
use crate::state::{classify, CompState, KernelState};

/// Values a body yields, keyed by declared output id. Every declared output
/// must be present.
pub type BodyOutputs = BTreeMap<String, Value>;
pub type BodyFuture = LocalBoxFuture<'static, anyhow::Result<BodyOutputs>>;
/// An async computation body: `(scope, abort) -> outputs`.
pub type BodyFn = Rc<dyn Fn(Scope, AbortSignal) -> BodyFuture>;

/// Wrap a plain async closure into a [`BodyFn`].
pub fn body<F, Fut>(f: F) -> BodyFn
where
    F: Fn(Scope, AbortSignal) -> Fut + 'static,
    Fut: std::future::Future<Output = anyhow::Result<BodyOutputs>> + 'static,
{
    Rc::new(move |scope, signal| f(scope, signal).boxed_local())
}

/// Convenience constructor for the common single-output body result.
pub fn one_output(name: impl Into<String>, value: Value) -> BodyOutputs {
    let mut map = BTreeMap::new();
    map.insert(name.into(), value);
    map
}

/// The object handed to a body for reading inputs.
///
/// Every access runs the full scope contract: cancellation check, await the
/// variable's clean state, then attach it as a runtime dependency. Access
/// outside the declared static inputs fails the body.
#[derive(Clone)]
pub struct Scope {
    state: Rc<RefCell<KernelState>>,
    comp_id: ComputationId,
    task_id: u64,
    signal: AbortSignal,
}

impl Scope {
    /// Read an input value, propagating upstream errors as errors.
    ///
    /// An upstream `Error` rethrows its error; `Fatal` and `Uninitialized`
    /// raise their own error kinds.
    pub async fn get(&self, name: &str) -> anyhow::Result<Value> {
        match self.fetch(name).await? {
            CellResult::Success(value) => Ok(value),
            CellResult::Error(err) => Err(err.to_anyhow()),
            CellResult::Fatal(err) => Err(anyhow::Error::new(FatalAccess {
                id: name.to_string(),
                error: err,
            })),
            CellResult::Uninitialized => Err(anyhow::Error::new(UninitializedAccess {
                id: name.to_string(),
            })),
        }
    }

    /// Read an input's full result without throwing on non-success.
    pub async fn get_result(&self, name: &str) -> anyhow::Result<CellResult> {
        self.fetch(name).await
    }

    async fn fetch(&self, name: &str) -> anyhow::Result<CellResult> {
        if self.signal.is_aborted() {
            return Err(Aborted.into());
        }
        let result = match evaluate(&self.state, name, &self.signal).await {
            Ok(result) => result,
            Err(EvalInterrupt::Aborted) => return Err(Aborted.into()),
            Err(EvalInterrupt::Unknown) => {
                return Err(anyhow!("input '{name}' is not defined"));
            }
        };
        if self.signal.is_aborted() {
            return Err(Aborted.into());
        }
        // Attach after awaiting: attaching first would inflate the dirty
        // input counter with a value that is about to become clean.
        let attached = {
            let mut st = self.state.borrow_mut();
            st.attach_runtime_input(&self.comp_id, self.task_id, name)
        };
        flush(&self.state);
        attached?;
        Ok(result)
    }
}

pub(crate) enum EvalInterrupt {
    Aborted,
    Unknown,
}

/// Await a variable's clean result.
///
/// Clean variables and sources resolve immediately; a `Fatal` cell counts
/// as clean. Otherwise the caller temporarily observes the variable (which
/// drives visibility scheduling upward) and waits for the clean cascade.
pub(crate) async fn evaluate(
    rc: &Rc<RefCell<KernelState>>,
    var_id: &str,
    signal: &AbortSignal,
) -> Result<CellResult, EvalInterrupt> {
    loop {
        let rx = {
            let mut st = rc.borrow_mut();
            if let Some(var) = st.store.vars.get(var_id) {
                if !var.dirty || var.producer.is_none() {
                    return Ok(var.result.clone());
                }
            } else if let Some(var) = st.store.problem_vars.get(var_id) {
                return Ok(var.result.clone());
            } else {
                return Err(EvalInterrupt::Unknown);
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            st.store
                .vars
                .get_mut(var_id)
                .expect("checked above")
                .waiters
                .push(tx);
            st.propagate_observe_count(var_id, 1);
            rx
        };
        flush(rc);
        let outcome = tokio::select! {
            delivered = rx => Some(delivered),
            _ = signal.cancelled() => None,
        };
        {
            let mut st = rc.borrow_mut();
            st.propagate_observe_count(var_id, -1);
        }
        flush(rc);
        match outcome {
            None => return Err(EvalInterrupt::Aborted),
            Some(Ok(result)) => return Ok(result),
            // The waiter was dropped (the variable moved or vanished);
            // re-inspect from the top.
            Some(Err(_)) => continue,
        }
    }
}

enum Outcome {
    Success(BodyOutputs),
    Error(anyhow::Error),
    Aborted,
}

pub(crate) struct PreparedTask {
    comp_id: ComputationId,
    task_id: u64,
    body: BodyFn,
    signal: AbortSignal,
}

/// Deliver queued observer notifications, schedule a drain when runnable
/// work is queued, and resolve idle waiters at quiescence. Called after
/// every mutation batch, with the state borrow released.
pub(crate) fn flush(rc: &Rc<RefCell<KernelState>>) {
    loop {
        let (notes, schedule, idle_waiters) = {
            let mut st = rc.borrow_mut();
            if st.cfg.assert_invariants {
                if let Err(violations) = crate::invariants::check(&st) {
                    panic!("kernel invariant violation:\n{}", violations.join("\n"));
                }
            }
            let notes = std::mem::take(&mut st.notifications);
            let mut schedule = false;
            if !st.ready.is_empty()
                && !st.tick_scheduled
                && st.tasks_in_flight < st.cfg.max_concurrent
            {
                st.tick_scheduled = true;
                schedule = true;
            }
            let idle_waiters = if notes.is_empty() && !schedule && st.is_idle() {
                std::mem::take(&mut st.idle_waiters)
            } else {
                Vec::new()
            };
            (notes, schedule, idle_waiters)
        };
        if schedule {
            let rc = rc.clone();
            tokio::task::spawn_local(async move {
                run_tick(rc);
            });
        }
        for waiter in idle_waiters {
            let _ = waiter.send(());
        }
        if notes.is_empty() {
            break;
        }
        for note in notes {
            deliver(&note);
        }
    }
}

fn deliver(note: &crate::state::Notification) {
    let observer = &note.observer;
    let result = &note.result;
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(result))).is_err() {
        tracing::error!("observer callback panicked; notification dropped");
    }
}

/// One scheduling tick: pull from the ready queue until the concurrency
/// bound is hit, then spawn the prepared bodies.
pub(crate) fn run_tick(rc: Rc<RefCell<KernelState>>) {
    let mut prepared = Vec::new();
    {
        let mut st = rc.borrow_mut();
        st.tick_scheduled = false;
        while st.tasks_in_flight < st.cfg.max_concurrent {
            let Some(id) = st.ready.pop_front() else {
                break;
            };
            st.ready_set.remove(&id);
            if let Some(task) = st.prepare_execution(&id) {
                prepared.push(task);
            }
        }
    }
    for task in prepared {
        spawn_body(&rc, task);
    }
    flush(&rc);
}

fn spawn_body(rc: &Rc<RefCell<KernelState>>, task: PreparedTask) {
    let scope = Scope {
        state: rc.clone(),
        comp_id: task.comp_id.clone(),
        task_id: task.task_id,
        signal: task.signal.clone(),
    };
    let fut = (task.body)(scope, task.signal.clone());
    let rc = rc.clone();
    tokio::task::spawn_local(async move {
        let settled = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
        // Final cancellation check on resume: a cancelled task never
        // commits, even if its body ignored the signal and resolved.
        let outcome = match settled {
            Err(payload) => Outcome::Error(anyhow!(
                "computation body panicked: {}",
                panic_message(payload.as_ref())
            )),
            Ok(Ok(outputs)) => {
                if task.signal.is_aborted() {
                    Outcome::Aborted
                } else {
                    Outcome::Success(outputs)
                }
            }
            Ok(Err(err)) => {
                if task.signal.is_aborted() || err.downcast_ref::<Aborted>().is_some() {
                    Outcome::Aborted
                } else {
                    Outcome::Error(err)
                }
            }
        };
        complete_task(&rc, &task.comp_id, task.task_id, outcome);
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn complete_task(rc: &Rc<RefCell<KernelState>>, comp_id: &str, task_id: u64, outcome: Outcome) {
    {
        let mut st = rc.borrow_mut();
        st.tasks_in_flight -= 1;
        if st.store.comps.contains_key(comp_id) {
            let is_current = st
                .store
                .comps
                .get(comp_id)
                .and_then(|c| c.running_task.as_ref())
                .is_some_and(|t| t.id == task_id);
            if is_current {
                let task = st
                    .store
                    .comps
                    .get_mut(comp_id)
                    .and_then(|c| c.running_task.take())
                    .expect("checked above");
                match outcome {
                    Outcome::Success(outputs) => st.commit_success(comp_id, &task, outputs),
                    Outcome::Error(err) => st.commit_error(comp_id, err),
                    Outcome::Aborted => {
                        // Cancelled mid-flight while still current: write
                        // nothing, stay dirty, the replacement reschedules.
                        trace!(comp = comp_id, task = task_id, "current task aborted");
                    }
                }
            } else if let Some(comp) = st.store.comps.get_mut(comp_id) {
                comp.aborting_tasks.retain(|t| t.id != task_id);
                trace!(comp = comp_id, task = task_id, "aborting task settled");
            }
            st.finalize_after_settle(comp_id);
        }
        // A computation removed or quarantined mid-flight just drops its
        // settling tasks.
    }
    flush(rc);
}

impl KernelState {
    /// Guard, input pruning, and task installation for one popped ready
    /// entry. Returns the prepared body when execution should proceed.
    pub(crate) fn prepare_execution(&mut self, id: &str) -> Option<PreparedTask> {
        let Some(comp) = self.store.comps.get(id) else {
            return None;
        };
        // The work may no longer be needed by the time the tick runs.
        if classify(comp) != CompState::Ready || comp.observe_count == 0 {
            return None;
        }
        if comp.running_task.is_some() {
            return None;
        }
        if self.cfg.abort_strategy == crate::kernel::AbortStrategy::Deferred
            && !comp.aborting_tasks.is_empty()
        {
            // Wait for the predecessor to settle; its completion re-queues.
            return None;
        }

        // Input pruning: nothing real changed since the last success.
        let current_max = self.max_runtime_input_value(id);
        let (input_version, outputs): (i64, Vec<String>) = {
            let comp = self.store.comps.get(id)?;
            (comp.input_version, comp.outputs.iter().cloned().collect())
        };
        if input_version > 0 && current_max <= input_version as Tick {
            debug!(comp = id, "input pruning: skipping execution");
            for output in outputs {
                self.clean_variable(&output, false);
            }
            self.set_comp_dirty(id, false);
            return None;
        }

        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let signal = AbortSignal::new();
        let comp = self.store.comps.get_mut(id)?;
        let body = comp.body.clone();
        comp.running_task = Some(TaskHandle {
            id: task_id,
            cause_at: comp.cause_at,
            signal: signal.clone(),
            accessed: IndexSet::new(),
        });
        self.tasks_in_flight += 1;
        debug!(comp = id, task = task_id, "starting body");
        Some(PreparedTask {
            comp_id: id.to_string(),
            task_id,
            body,
            signal,
        })
    }

    fn max_runtime_input_value(&self, comp_id: &str) -> Tick {
        let Some(comp) = self.store.comps.get(comp_id) else {
            return 0;
        };
        comp.runtime_inputs
            .iter()
            .filter_map(|i| self.store.vars.get(i))
            .map(|v| v.value_at)
            .max()
            .unwrap_or(0)
    }

    fn max_runtime_input_cause(&self, comp_id: &str) -> (Tick, Option<String>) {
        let Some(comp) = self.store.comps.get(comp_id) else {
            return (0, None);
        };
        let mut max_cause = 0;
        let mut through = None;
        for input in &comp.runtime_inputs {
            if let Some(var) = self.store.vars.get(input) {
                if var.cause_at > max_cause {
                    max_cause = var.cause_at;
                    through = Some(input.clone());
                }
            }
        }
        (max_cause, through)
    }

    /// Record a runtime access from a running body, attaching the variable
    /// as a dependency if this is its first touch this lifetime.
    pub(crate) fn attach_runtime_input(
        &mut self,
        comp_id: &str,
        task_id: u64,
        var_id: &str,
    ) -> anyhow::Result<()> {
        let (var_cause, var_dirty_computed, var_exists) = match self.store.any_var(var_id) {
            Some(var) => (var.cause_at, var.dirty && var.producer.is_some(), true),
            None => (0, false, false),
        };
        {
            let Some(comp) = self.store.comps.get_mut(comp_id) else {
                return Err(Aborted.into());
            };
            let Some(task) = comp.running_task.as_mut() else {
                return Err(Aborted.into());
            };
            if task.id != task_id {
                return Err(Aborted.into());
            }
            task.accessed.insert(var_id.to_string());
            if comp.runtime_inputs.contains(var_id) {
                return Ok(());
            }
            if !comp.static_inputs.contains(var_id) {
                return Err(InvalidDynamicAccess {
                    computation: comp_id.to_string(),
                    variable: var_id.to_string(),
                }
                .into());
            }
            if !var_exists {
                return Err(anyhow!("input '{var_id}' is not defined"));
            }
            // Pre-bump the task so the cause raise below reads as a
            // legitimate dynamic access, not supersession.
            let task = comp.running_task.as_mut().expect("checked above");
            if var_cause > task.cause_at {
                task.cause_at = var_cause;
            }
            comp.runtime_inputs.insert(var_id.to_string());
        }
        let observe_count = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.observe_count)
            .unwrap_or(0);
        if let Some(var) = self.store.any_var_mut(var_id) {
            var.dependents.insert(comp_id.to_string());
        }
        trace!(comp = comp_id, var = var_id, "dynamic input attached");
        self.propagate_observe_count(var_id, observe_count);
        self.propagate_cause_downward(comp_id, var_cause, Some(var_id), false);
        if var_dirty_computed {
            self.add_comp_dirty_inputs(comp_id, 1);
        }
        Ok(())
    }

    /// Success path of a settled body: write outputs, cascade clean
    /// propagation, and prune runtime inputs the run did not touch.
    pub(crate) fn commit_success(
        &mut self,
        comp_id: &str,
        task: &TaskHandle,
        outputs: BodyOutputs,
    ) {
        let declared: Vec<String> = match self.store.comps.get(comp_id) {
            Some(comp) => comp.outputs.iter().cloned().collect(),
            None => return,
        };
        for name in &declared {
            if !outputs.contains_key(name) {
                self.commit_error(comp_id, anyhow!("body did not produce output '{name}'"));
                return;
            }
        }
        for name in outputs.keys() {
            if !declared.iter().any(|d| d == name) {
                self.commit_error(comp_id, anyhow!("body produced undeclared output '{name}'"));
                return;
            }
        }

        let comp_cause = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.cause_at)
            .unwrap_or(0);
        let mut changed: Vec<(String, Value)> = Vec::new();
        let mut unchanged: Vec<String> = Vec::new();
        for (name, value) in outputs {
            let same = self
                .store
                .vars
                .get(&name)
                .map(|var| match &var.result {
                    CellResult::Success(old) => *old == value,
                    _ => false,
                })
                .unwrap_or(false);
            if same {
                unchanged.push(name);
            } else {
                changed.push((name, value));
            }
        }

        // One fresh tick shared by every changed output: downstream sees
        // the commit atomically.
        let tick = if changed.is_empty() {
            None
        } else {
            Some(self.clock.next())
        };
        for (name, value) in changed {
            if let Some(var) = self.store.vars.get_mut(&name) {
                var.result = CellResult::Success(value);
                var.value_at = tick.expect("tick allocated for changed outputs");
                var.cause_at = comp_cause;
            }
            self.clean_variable(&name, true);
        }
        for name in unchanged {
            if let Some(var) = self.store.vars.get_mut(&name) {
                var.cause_at = comp_cause;
            }
            self.clean_variable(&name, false);
        }

        // Runtime inputs the body did not touch this run detach entirely.
        let unused: Vec<String> = self
            .store
            .comps
            .get(comp_id)
            .map(|comp| {
                comp.runtime_inputs
                    .iter()
                    .filter(|i| !task.accessed.contains(*i))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let observe_count = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.observe_count)
            .unwrap_or(0);
        for input in unused {
            if let Some(comp) = self.store.comps.get_mut(comp_id) {
                comp.runtime_inputs.shift_remove(&input);
            }
            let dirty_computed = {
                match self.store.any_var_mut(&input) {
                    Some(var) => {
                        var.dependents.shift_remove(comp_id);
                        var.dirty && var.producer.is_some()
                    }
                    None => false,
                }
            };
            trace!(comp = comp_id, var = %input, "unused runtime input detached");
            self.propagate_observe_count(&input, -observe_count);
            if dirty_computed {
                self.add_comp_dirty_inputs(comp_id, -1);
            }
        }

        self.set_comp_dirty(comp_id, false);
        let input_version = self.max_runtime_input_value(comp_id) as i64;
        if let Some(comp) = self.store.comps.get_mut(comp_id) {
            comp.input_version = input_version;
        }
        debug!(comp = comp_id, tick = ?tick, "commit");
    }

    /// Error path: the failure becomes data on every output. Not retried
    /// until a real input change.
    pub(crate) fn commit_error(&mut self, comp_id: &str, err: anyhow::Error) {
        debug!(comp = comp_id, error = %err, "body failed");
        let exec_err = ExecError::new(err);
        let outputs: Vec<String> = match self.store.comps.get(comp_id) {
            Some(comp) => comp.outputs.iter().cloned().collect(),
            None => return,
        };
        let comp_cause = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.cause_at)
            .unwrap_or(0);
        // Fresh value tick so observers see the change.
        let tick = self.clock.next();
        for name in outputs {
            if let Some(var) = self.store.vars.get_mut(&name) {
                var.result = CellResult::Error(exec_err.clone());
                var.value_at = tick;
                var.cause_at = comp_cause;
            }
            self.clean_variable(&name, true);
        }
        self.set_comp_dirty(comp_id, false);
        let input_version = self.max_runtime_input_value(comp_id) as i64;
        if let Some(comp) = self.store.comps.get_mut(comp_id) {
            comp.input_version = input_version;
        }
    }

    /// Settlement epilogue: catch late upstream pushes that landed during
    /// the run, and surface the fresh (Ready, no-task) dispatch slot.
    pub(crate) fn finalize_after_settle(&mut self, comp_id: &str) {
        let Some(comp) = self.store.comps.get(comp_id) else {
            return;
        };
        if !comp.dirty {
            return;
        }
        let (max_cause, through) = self.max_runtime_input_cause(comp_id);
        let current = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.cause_at)
            .unwrap_or(0);
        if max_cause > current {
            self.propagate_cause_downward(comp_id, max_cause, through.as_deref(), false);
        }
        let ready_again = self
            .store
            .comps
            .get(comp_id)
            .is_some_and(|c| classify(c) == CompState::Ready && c.running_task.is_none());
        if ready_again {
            self.enqueue_ready(comp_id);
        }
    }
}
