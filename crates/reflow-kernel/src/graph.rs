//! Graph storage: cells, computations, their quarantined twins, and the
//! indexes the propagation and repair engines walk.
//!
//! Pure bookkeeping; reactions to field changes live in the state machine.
//! Back-references are id strings, so the variable/computation
//! back-reference (producer vs. owned outputs) never forms an `Rc` cycle.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};

use crate::clock::Tick;
use crate::exec::BodyFn;
use crate::result::{CellResult, ComputationId, StructuralError, StructuralReason, VariableId};
use crate::signal::AbortSignal;

/// Handle identifying one registered observer callback.
pub type ObserverId = u64;
/// Observer callbacks are invoked synchronously from propagation sites; they
/// must be non-blocking, and a panic is caught and logged, never propagated.
pub type ObserverFn = std::rc::Rc<dyn Fn(&CellResult)>;

/// One named storage slot: a source (no producer) or the output of a
/// computation.
pub struct Variable {
    pub id: VariableId,
    pub result: CellResult,
    /// Time the value last changed. Zero iff the result is `Uninitialized`.
    pub value_at: Tick,
    /// Time an upstream perturbation last reached this cell. Non-decreasing.
    pub cause_at: Tick,
    pub dirty: bool,
    /// Owning computation; `None` marks a source. Sources are never dirty.
    pub producer: Option<ComputationId>,
    /// Consumers, healthy or quarantined. Edges are kept across the
    /// normal/problem boundary so repair can find its neighborhood.
    pub dependents: IndexSet<ComputationId>,
    pub observers: IndexMap<ObserverId, ObserverFn>,
    /// Recursive count of active observers reaching down through consumers.
    pub observe_count: i64,
    /// Pull-mode waiters resolved the next time this cell becomes clean.
    pub waiters: Vec<tokio::sync::oneshot::Sender<CellResult>>,
}

impl Variable {
    pub fn source(id: impl Into<VariableId>) -> Self {
        Self {
            id: id.into(),
            result: CellResult::Uninitialized,
            value_at: 0,
            cause_at: 0,
            dirty: false,
            producer: None,
            dependents: IndexSet::new(),
            observers: IndexMap::new(),
            observe_count: 0,
            waiters: Vec::new(),
        }
    }

    pub fn output(id: impl Into<VariableId>, producer: impl Into<ComputationId>) -> Self {
        let mut v = Self::source(id);
        v.producer = Some(producer.into());
        v
    }

    pub fn is_source(&self) -> bool {
        self.producer.is_none()
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("result", &self.result)
            .field("value_at", &self.value_at)
            .field("cause_at", &self.cause_at)
            .field("dirty", &self.dirty)
            .field("producer", &self.producer)
            .field("dependents", &self.dependents)
            .field("observers", &self.observers.len())
            .field("observe_count", &self.observe_count)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// In-flight (or settling) execution of one computation body.
pub struct TaskHandle {
    pub id: u64,
    /// Cause snapshot the body is based on. Dynamic attaches pre-bump this
    /// so legitimate runtime access is distinguishable from supersession.
    pub cause_at: Tick,
    pub signal: AbortSignal,
    /// Inputs touched so far by this execution; drives unused-input pruning.
    pub accessed: IndexSet<VariableId>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("cause_at", &self.cause_at)
            .field("aborted", &self.signal.is_aborted())
            .finish()
    }
}

/// The saved shape of a definition, kept so quarantined computations can be
/// rebuilt when their neighborhood heals.
#[derive(Clone)]
pub struct Definition {
    pub id: ComputationId,
    pub inputs: Vec<VariableId>,
    pub outputs: Vec<VariableId>,
    pub body: BodyFn,
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// A healthy unit mapping input cells to owned output cells via an async
/// body.
pub struct Computation {
    pub id: ComputationId,
    pub static_inputs: IndexSet<VariableId>,
    /// Inputs actually touched on the last successful execution; initialized
    /// to the static set until a run narrows it.
    pub runtime_inputs: IndexSet<VariableId>,
    pub outputs: IndexSet<VariableId>,
    pub body: BodyFn,
    pub dirty: bool,
    pub observe_count: i64,
    /// Computed runtime inputs currently dirty. Sources are excluded: they
    /// are clean immediately after their update.
    pub dirty_input_count: i64,
    pub cause_at: Tick,
    /// `max(value_at)` over runtime inputs at the last successful commit.
    /// Zero means never executed; negative forces re-execution.
    pub input_version: i64,
    pub running_task: Option<TaskHandle>,
    /// Cancelled tasks whose settlement has not yet run.
    pub aborting_tasks: Vec<TaskHandle>,
}

impl Computation {
    pub fn new(def: &Definition) -> Self {
        Self {
            id: def.id.clone(),
            static_inputs: def.inputs.iter().cloned().collect(),
            runtime_inputs: def.inputs.iter().cloned().collect(),
            outputs: def.outputs.iter().cloned().collect(),
            body: def.body.clone(),
            dirty: true,
            observe_count: 0,
            dirty_input_count: 0,
            cause_at: 0,
            input_version: 0,
            running_task: None,
            aborting_tasks: Vec::new(),
        }
    }

    pub fn definition(&self) -> Definition {
        Definition {
            id: self.id.clone(),
            inputs: self.static_inputs.iter().cloned().collect(),
            outputs: self.outputs.iter().cloned().collect(),
            body: self.body.clone(),
        }
    }
}

impl std::fmt::Debug for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computation")
            .field("id", &self.id)
            .field("static_inputs", &self.static_inputs)
            .field("runtime_inputs", &self.runtime_inputs)
            .field("outputs", &self.outputs)
            .field("dirty", &self.dirty)
            .field("observe_count", &self.observe_count)
            .field("dirty_input_count", &self.dirty_input_count)
            .field("cause_at", &self.cause_at)
            .field("input_version", &self.input_version)
            .field("running_task", &self.running_task)
            .field("aborting_tasks", &self.aborting_tasks.len())
            .finish()
    }
}

/// A quarantined computation: ill-formed at definition time or poisoned by
/// structural churn upstream, kept whole for recovery.
pub struct ProblemComputation {
    pub id: ComputationId,
    pub reason: StructuralReason,
    /// Inputs not currently available as healthy variables.
    pub missing_inputs: IndexSet<VariableId>,
    /// Output name -> current owner (`None` when a source owns it).
    pub conflicted_outputs: IndexMap<VariableId, Option<ComputationId>>,
    pub cycle: Vec<ComputationId>,
    pub invalid_detail: Option<String>,
    pub definition: Definition,
    /// Problem variables created for the non-conflicted outputs.
    pub outputs: IndexSet<VariableId>,
}

impl ProblemComputation {
    pub fn structural_error(&self) -> StructuralError {
        StructuralError {
            reason: self.reason,
            computation: self.id.clone(),
            missing_inputs: self.missing_inputs.iter().cloned().collect(),
            cycle: self.cycle.clone(),
            conflicts_with: self
                .conflicted_outputs
                .values()
                .find_map(|owner| owner.clone()),
            detail: self.invalid_detail.clone(),
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.missing_inputs.is_empty()
            && self.conflicted_outputs.is_empty()
            && self.cycle.is_empty()
            && self.invalid_detail.is_none()
    }
}

impl std::fmt::Debug for ProblemComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemComputation")
            .field("id", &self.id)
            .field("reason", &self.reason)
            .field("missing_inputs", &self.missing_inputs)
            .field("conflicted_outputs", &self.conflicted_outputs)
            .field("cycle", &self.cycle)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Owns every node and the indexes over them. No behavior beyond
/// bookkeeping; mutation with side-effects goes through the kernel state.
#[derive(Default)]
pub struct GraphStore {
    pub vars: IndexMap<VariableId, Variable>,
    pub comps: IndexMap<ComputationId, Computation>,
    pub problem_vars: IndexMap<VariableId, Variable>,
    pub problem_comps: IndexMap<ComputationId, ProblemComputation>,
    /// Output name -> owning computation (healthy or problem).
    pub producer_by_output: HashMap<VariableId, ComputationId>,
    /// Output name -> quarantined claimants in definition order; realizes
    /// first-win promotion when the owner goes away.
    pub output_waiters: IndexMap<VariableId, Vec<ComputationId>>,
    /// Observer sets that outlived their variable, keyed by the vacated id.
    /// Re-attached (and re-notified) if the name comes back.
    pub orphaned_observers: HashMap<VariableId, IndexMap<ObserverId, ObserverFn>>,
}

impl GraphStore {
    /// Look up a variable in the normal table, then the problem table.
    pub fn any_var(&self, id: &str) -> Option<&Variable> {
        self.vars.get(id).or_else(|| self.problem_vars.get(id))
    }

    pub fn any_var_mut(&mut self, id: &str) -> Option<&mut Variable> {
        if self.vars.contains_key(id) {
            self.vars.get_mut(id)
        } else {
            self.problem_vars.get_mut(id)
        }
    }

    pub fn var_exists(&self, id: &str) -> bool {
        self.vars.contains_key(id) || self.problem_vars.contains_key(id)
    }

    pub fn comp_exists(&self, id: &str) -> bool {
        self.comps.contains_key(id) || self.problem_comps.contains_key(id)
    }

    /// Register a quarantined claim on an output name.
    pub fn push_waiter(&mut self, output: &str, comp: &str) {
        let waiters = self.output_waiters.entry(output.to_string()).or_default();
        if !waiters.iter().any(|w| w == comp) {
            waiters.push(comp.to_string());
        }
    }

    /// Drop every waiter entry for a computation (it recovered or was
    /// removed).
    pub fn drop_waiter(&mut self, comp: &str) {
        for waiters in self.output_waiters.values_mut() {
            waiters.retain(|w| w != comp);
        }
        self.output_waiters.retain(|_, waiters| !waiters.is_empty());
    }

    /// Waiting claimants for an output name, in definition order.
    pub fn waiters_for(&self, output: &str) -> Vec<ComputationId> {
        self.output_waiters.get(output).cloned().unwrap_or_default()
    }

    /// Detect a cycle in the producer-to-consumer graph over every declared
    /// shape (healthy and quarantined), starting from `start`. When
    /// `override_shape` is given it stands in for `start`'s shape, which is
    /// how prospective definitions and redefinitions are probed before they
    /// are inserted.
    ///
    /// Returns the first back-edge path found: a sequence of computation ids
    /// closing the loop.
    pub fn detect_cycle_from(
        &self,
        start: &str,
        override_shape: Option<(&[VariableId], &[VariableId])>,
    ) -> Option<Vec<ComputationId>> {
        let mut shapes: HashMap<&str, (Vec<&str>, Vec<&str>)> = HashMap::new();
        for (id, comp) in &self.comps {
            shapes.insert(
                id.as_str(),
                (
                    comp.static_inputs.iter().map(String::as_str).collect(),
                    comp.outputs.iter().map(String::as_str).collect(),
                ),
            );
        }
        for (id, comp) in &self.problem_comps {
            shapes.insert(
                id.as_str(),
                (
                    comp.definition.inputs.iter().map(String::as_str).collect(),
                    comp.definition.outputs.iter().map(String::as_str).collect(),
                ),
            );
        }
        if let Some((inputs, outputs)) = override_shape {
            shapes.insert(
                start,
                (
                    inputs.iter().map(String::as_str).collect(),
                    outputs.iter().map(String::as_str).collect(),
                ),
            );
        }
        if !shapes.contains_key(start) {
            return None;
        }

        // input name -> consuming computations
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, (inputs, _)) in &shapes {
            for input in inputs {
                consumers.entry(*input).or_default().push(*id);
            }
        }

        fn successors<'a>(
            shapes: &HashMap<&'a str, (Vec<&'a str>, Vec<&'a str>)>,
            consumers: &HashMap<&'a str, Vec<&'a str>>,
            id: &str,
        ) -> Vec<&'a str> {
            let mut out = Vec::new();
            if let Some((_, outputs)) = shapes.get(id) {
                for output in outputs {
                    if let Some(found) = consumers.get(*output) {
                        out.extend(found.iter().copied());
                    }
                }
            }
            out
        }

        // DFS with a gray stack; the first edge back into the stack closes
        // the cycle.
        let mut gray: Vec<&str> = vec![start];
        let mut black: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut frames: Vec<(&str, Vec<&str>, usize)> =
            vec![(start, successors(&shapes, &consumers, start), 0)];
        loop {
            enum Step<'a> {
                Done(&'a str),
                Visit(&'a str),
            }
            let step = {
                let Some((node, succ, idx)) = frames.last_mut() else {
                    break;
                };
                if *idx >= succ.len() {
                    Step::Done(*node)
                } else {
                    let next = succ[*idx];
                    *idx += 1;
                    Step::Visit(next)
                }
            };
            match step {
                Step::Done(node) => {
                    black.insert(node);
                    gray.pop();
                    frames.pop();
                }
                Step::Visit(next) => {
                    if black.contains(next) {
                        continue;
                    }
                    if let Some(pos) = gray.iter().position(|n| *n == next) {
                        let mut cycle: Vec<ComputationId> =
                            gray[pos..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    gray.push(next);
                    let succ = successors(&shapes, &consumers, next);
                    frames.push((next, succ, 0));
                }
            }
        }
        None
    }
}
