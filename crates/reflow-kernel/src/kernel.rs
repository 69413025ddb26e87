//! Public facade: define/update/observe/get/peek operations routed onto the
//! kernel state, plus configuration and the status shapes they return.
//!
//! A [`Kernel`] is a cheap handle; clones share the same state. All
//! operations must run on the current-thread runtime inside a `LocalSet`
//! (bodies are spawned with `spawn_local`).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::Serialize;
use tracing::level_filters::LevelFilter;

use crate::clock::Tick;
use crate::error::KernelError;
use crate::exec::{evaluate, flush, BodyFn, EvalInterrupt};
use crate::graph::ObserverId;
use crate::problem::ProblemTrace;
use crate::result::{
    CellResult, ComputationId, FatalAccess, StructuralError, UninitializedAccess, Value,
    VariableId,
};
use crate::signal::AbortSignal;
use crate::state::{classify, CompState, KernelState, Notification};

/// How a superseded task hands its concurrency slot to the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortStrategy {
    /// Wait for the predecessor's future to settle before starting the
    /// successor.
    #[default]
    Deferred,
    /// Start the successor as soon as the predecessor's signal is set,
    /// relying on cooperative checks inside the body.
    Immediate,
}

/// Kernel-emitted log verbosity, consumed by [`Kernel::init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Error,
}

impl LogLevel {
    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Maximum bodies in flight at once.
    pub max_concurrent: usize,
    pub abort_strategy: AbortStrategy,
    pub log_level: LogLevel,
    /// Check every graph invariant after each mutation batch; violations
    /// panic with a report. Intended for tests and debugging.
    pub assert_invariants: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            abort_strategy: AbortStrategy::default(),
            log_level: LogLevel::default(),
            assert_invariants: false,
        }
    }
}

/// A source definition: an externally-written cell.
#[derive(Clone)]
pub struct SourceSpec {
    pub id: VariableId,
    pub initial_value: Option<Value>,
}

impl SourceSpec {
    pub fn new(id: impl Into<VariableId>) -> Self {
        Self {
            id: id.into(),
            initial_value: None,
        }
    }

    pub fn with_value(id: impl Into<VariableId>, value: Value) -> Self {
        Self {
            id: id.into(),
            initial_value: Some(value),
        }
    }
}

/// A computation definition: inputs, owned outputs, and an async body.
#[derive(Clone)]
pub struct ComputationSpec {
    pub id: ComputationId,
    pub inputs: Vec<VariableId>,
    pub outputs: Vec<VariableId>,
    pub body: BodyFn,
}

impl ComputationSpec {
    pub fn new<I, O>(id: impl Into<ComputationId>, inputs: I, outputs: O, body: BodyFn) -> Self
    where
        I: IntoIterator,
        I::Item: Into<VariableId>,
        O: IntoIterator,
        O::Item: Into<VariableId>,
    {
        Self {
            id: id.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefineOptions {
    pub allow_redefinition: bool,
}

impl DefineOptions {
    pub fn redefinition() -> Self {
        Self {
            allow_redefinition: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Problematic,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: VariableId,
    pub health: NodeHealth,
    pub problems: Vec<StructuralError>,
}

impl SourceStatus {
    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    pub(crate) fn healthy(id: &str) -> Self {
        Self {
            id: id.to_string(),
            health: NodeHealth::Healthy,
            problems: Vec::new(),
        }
    }

    pub(crate) fn problematic(id: &str, problem: StructuralError) -> Self {
        Self {
            id: id.to_string(),
            health: NodeHealth::Problematic,
            problems: vec![problem],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComputationStatus {
    pub id: ComputationId,
    pub health: NodeHealth,
    pub problems: Vec<StructuralError>,
    /// Outputs that went to the problem table under this definition.
    pub quarantined_outputs: Vec<VariableId>,
}

impl ComputationStatus {
    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    pub(crate) fn healthy(id: &str) -> Self {
        Self {
            id: id.to_string(),
            health: NodeHealth::Healthy,
            problems: Vec::new(),
            quarantined_outputs: Vec::new(),
        }
    }

    pub(crate) fn problematic(
        id: &str,
        problem: StructuralError,
        quarantined_outputs: Vec<VariableId>,
    ) -> Self {
        Self {
            id: id.to_string(),
            health: NodeHealth::Problematic,
            problems: vec![problem],
            quarantined_outputs,
        }
    }
}

/// Removal never throws; failures are reported here.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalStatus {
    pub id: String,
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Dependents that were quarantined (never cascade-deleted).
    pub marked_problematic: Vec<ComputationId>,
}

/// Side-effect-free view of one variable.
#[derive(Debug, Clone)]
pub struct PeekView {
    pub result: CellResult,
    pub is_dirty: bool,
}

/// Side-effect-free snapshot of one computation.
#[derive(Debug, Clone)]
pub struct ComputationSnapshot {
    pub id: ComputationId,
    pub health: NodeHealth,
    /// Present for healthy computations only.
    pub state: Option<CompState>,
    pub dirty: bool,
    pub observe_count: i64,
    pub dirty_input_count: i64,
    pub cause_at: Tick,
    pub input_version: i64,
    pub static_inputs: Vec<VariableId>,
    pub runtime_inputs: Vec<VariableId>,
    pub outputs: Vec<VariableId>,
    pub has_running_task: bool,
    pub aborting_tasks: usize,
    pub problem: Option<StructuralError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProblemVariableInfo {
    pub id: VariableId,
    pub producer: Option<ComputationId>,
    pub error: StructuralError,
}

/// Aggregate kernel health, the graph-level analogue of a heights report.
#[derive(Debug, Clone, Serialize)]
pub struct GraphHealth {
    pub variables: usize,
    pub computations: usize,
    pub problem_variables: usize,
    pub problem_computations: usize,
    pub ready_queue: usize,
    pub tasks_in_flight: usize,
    pub aborting_tasks: usize,
    pub is_idle: bool,
}

/// Handle to one observer registration. Detach with
/// [`Subscription::unsubscribe`]; dropping the handle does not detach.
pub struct Subscription {
    state: Weak<RefCell<KernelState>>,
    var_id: VariableId,
    observer_id: ObserverId,
    active: Cell<bool>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(rc) = self.state.upgrade() else {
            return;
        };
        {
            let mut st = rc.borrow_mut();
            let removed = st
                .store
                .any_var_mut(&self.var_id)
                .is_some_and(|var| var.observers.shift_remove(&self.observer_id).is_some());
            if removed {
                st.propagate_observe_count(&self.var_id, -1);
            } else if let Some(orphans) = st.store.orphaned_observers.get_mut(&self.var_id) {
                orphans.shift_remove(&self.observer_id);
                if orphans.is_empty() {
                    st.store.orphaned_observers.remove(&self.var_id);
                }
            }
        }
        flush(&rc);
    }
}

/// The reactive kernel: a dynamic DAG of source and computed cells with
/// glitch-free, cancellation-aware scheduling.
pub struct Kernel {
    state: Rc<RefCell<KernelState>>,
}

impl Clone for Kernel {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(cfg: KernelConfig) -> Self {
        let state = Rc::new(RefCell::new(KernelState::new(cfg)));
        state.borrow_mut().this = Rc::downgrade(&state);
        Self { state }
    }

    pub fn config(&self) -> KernelConfig {
        self.state.borrow().cfg.clone()
    }

    /// Install a process-global `tracing` subscriber honoring the
    /// configured log level. No-op if one is already installed.
    pub fn init_tracing(&self) {
        let level = self.state.borrow().cfg.log_level.as_filter();
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .try_init();
    }

    /// Define (or with `allow_redefinition`, redefine) a source cell.
    /// Never throws; structural issues come back in the status.
    pub fn define_source(&self, spec: SourceSpec, opts: DefineOptions) -> SourceStatus {
        let status = self.state.borrow_mut().define_source_inner(spec, opts);
        flush(&self.state);
        status
    }

    /// Define (or redefine) a computation. Ill-formed definitions are
    /// quarantined, reported in the status, and auto-recovered when the
    /// graph heals.
    pub fn define_computation(
        &self,
        spec: ComputationSpec,
        opts: DefineOptions,
    ) -> ComputationStatus {
        let status = self.state.borrow_mut().define_computation_inner(spec, opts);
        flush(&self.state);
        status
    }

    /// Write a source value. The cause clock advances even when the value
    /// is unchanged; downstream re-validates and prunes.
    pub fn update_source(&self, id: &str, value: Value) -> Result<(), KernelError> {
        let result = self.state.borrow_mut().update_source_inner(id, value);
        flush(&self.state);
        result
    }

    pub fn remove_source(&self, id: &str) -> RemovalStatus {
        let status = self.state.borrow_mut().remove_source_inner(id);
        flush(&self.state);
        status
    }

    pub fn remove_computation(&self, id: &str) -> RemovalStatus {
        let status = self.state.borrow_mut().remove_computation_inner(id);
        flush(&self.state);
        status
    }

    /// Attach an observer. If the variable is currently clean (a `Fatal`
    /// cell is also clean), the callback fires with the current result
    /// before this returns.
    pub fn observe(
        &self,
        id: &str,
        callback: impl Fn(&CellResult) + 'static,
    ) -> Result<Subscription, KernelError> {
        let observer_id = {
            let mut st = self.state.borrow_mut();
            if !st.store.var_exists(id) {
                return Err(KernelError::UnknownVariable(id.to_string()));
            }
            let observer_id = st.next_observer_id;
            st.next_observer_id += 1;
            let observer: crate::graph::ObserverFn = Rc::new(callback);
            let immediate = {
                let var = st.store.any_var_mut(id).expect("checked above");
                var.observers.insert(observer_id, observer.clone());
                if var.dirty {
                    None
                } else {
                    Some(var.result.clone())
                }
            };
            if let Some(result) = immediate {
                st.notifications.push(Notification { observer, result });
            }
            st.propagate_observe_count(id, 1);
            observer_id
        };
        flush(&self.state);
        Ok(Subscription {
            state: Rc::downgrade(&self.state),
            var_id: id.to_string(),
            observer_id,
            active: Cell::new(true),
        })
    }

    /// Await the clean result of a variable, driving any needed upstream
    /// work. Never throws for a known id.
    pub async fn get_value_result(&self, id: &str) -> Result<CellResult, KernelError> {
        let signal = AbortSignal::new();
        loop {
            match evaluate(&self.state, id, &signal).await {
                Ok(result) => return Ok(result),
                Err(EvalInterrupt::Unknown) => {
                    return Err(KernelError::UnknownVariable(id.to_string()))
                }
                Err(EvalInterrupt::Aborted) => continue,
            }
        }
    }

    /// Await the clean value of a variable. An `Error` result rethrows the
    /// body error, `Fatal` and `Uninitialized` raise their own kinds.
    pub async fn get_value(&self, id: &str) -> anyhow::Result<Value> {
        match self.get_value_result(id).await? {
            CellResult::Success(value) => Ok(value),
            CellResult::Error(err) => Err(err.to_anyhow()),
            CellResult::Fatal(err) => Err(anyhow::Error::new(FatalAccess {
                id: id.to_string(),
                error: err,
            })),
            CellResult::Uninitialized => Err(anyhow::Error::new(UninitializedAccess {
                id: id.to_string(),
            })),
        }
    }

    /// Current result and dirtiness, no side effects.
    pub fn peek(&self, id: &str) -> Result<PeekView, KernelError> {
        let st = self.state.borrow();
        let var = st
            .store
            .any_var(id)
            .ok_or_else(|| KernelError::UnknownVariable(id.to_string()))?;
        Ok(PeekView {
            result: var.result.clone(),
            is_dirty: var.dirty,
        })
    }

    /// Full state snapshot of one computation, no side effects.
    pub fn peek_computation(&self, id: &str) -> Result<ComputationSnapshot, KernelError> {
        let st = self.state.borrow();
        if let Some(comp) = st.store.comps.get(id) {
            return Ok(ComputationSnapshot {
                id: comp.id.clone(),
                health: NodeHealth::Healthy,
                state: Some(classify(comp)),
                dirty: comp.dirty,
                observe_count: comp.observe_count,
                dirty_input_count: comp.dirty_input_count,
                cause_at: comp.cause_at,
                input_version: comp.input_version,
                static_inputs: comp.static_inputs.iter().cloned().collect(),
                runtime_inputs: comp.runtime_inputs.iter().cloned().collect(),
                outputs: comp.outputs.iter().cloned().collect(),
                has_running_task: comp.running_task.is_some(),
                aborting_tasks: comp.aborting_tasks.len(),
                problem: None,
            });
        }
        if let Some(problem) = st.store.problem_comps.get(id) {
            return Ok(ComputationSnapshot {
                id: problem.id.clone(),
                health: NodeHealth::Problematic,
                state: None,
                dirty: false,
                observe_count: 0,
                dirty_input_count: 0,
                cause_at: 0,
                input_version: 0,
                static_inputs: problem.definition.inputs.clone(),
                runtime_inputs: Vec::new(),
                outputs: problem.definition.outputs.clone(),
                has_running_task: false,
                aborting_tasks: 0,
                problem: Some(problem.structural_error()),
            });
        }
        Err(KernelError::UnknownComputation(id.to_string()))
    }

    /// Resolves at the next quiescence: empty ready queue, nothing in
    /// flight, no pending tick.
    pub async fn wait_idle(&self) {
        let rx = {
            let mut st = self.state.borrow_mut();
            if st.is_idle() {
                None
            } else {
                let (tx, rx) = tokio::sync::oneshot::channel();
                st.idle_waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Pass-through wrapper: runs the future and propagates its error.
    /// There is no batching semantics; each mutation inside keeps its own
    /// clock tick.
    pub async fn with_transaction<T, Fut>(&self, fut: Fut) -> anyhow::Result<T>
    where
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        fut.await
    }

    /// Current problem reports, one per quarantined computation.
    pub fn problem_computations(&self) -> Vec<StructuralError> {
        let st = self.state.borrow();
        st.store
            .problem_comps
            .values()
            .map(|p| p.structural_error())
            .collect()
    }

    pub fn problem_variables(&self) -> Vec<ProblemVariableInfo> {
        let st = self.state.borrow();
        st.store
            .problem_vars
            .values()
            .map(|var| ProblemVariableInfo {
                id: var.id.clone(),
                producer: var.producer.clone(),
                error: match &var.result {
                    CellResult::Fatal(err) => err.clone(),
                    // Problem variables always carry Fatal; this arm is
                    // unreachable when the isolation invariant holds.
                    _ => StructuralError::invalid(
                        var.producer.clone().unwrap_or_default(),
                        "problem variable without fatal result",
                    ),
                },
            })
            .collect()
    }

    /// Walk a quarantined node's missing-input edges to its root causes.
    pub fn trace_problem_root(&self, id: &str) -> Option<ProblemTrace> {
        self.state.borrow().trace_problem_root(id)
    }

    pub fn graph_health(&self) -> GraphHealth {
        let st = self.state.borrow();
        GraphHealth {
            variables: st.store.vars.len(),
            computations: st.store.comps.len(),
            problem_variables: st.store.problem_vars.len(),
            problem_computations: st.store.problem_comps.len(),
            ready_queue: st.ready.len(),
            tasks_in_flight: st.tasks_in_flight,
            aborting_tasks: st.aborting_total(),
            is_idle: st.is_idle(),
        }
    }

    /// Run the full invariant audit once, regardless of configuration.
    pub fn check_invariants(&self) -> Result<(), KernelError> {
        let st = self.state.borrow();
        crate::invariants::check(&st)
            .map_err(|violations| KernelError::InvariantViolation(violations.join("; ")))
    }
}
