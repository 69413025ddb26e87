//! Structural problem tracking and auto-recovery.
//!
//! Ill-formed definitions are quarantined into a mirror sub-DAG: their
//! outputs become problem variables carrying `Fatal`, and the computation
//! is parked whole (definition included) so it can be rebuilt the moment
//! its neighborhood heals. Dependent edges are kept across the
//! normal/problem boundary, which is what lets repair find newly-healthy
//! neighborhoods without a global scan.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::debug;

use crate::graph::{Definition, ProblemComputation, Variable};
use crate::result::{
    CellResult, ComputationId, StructuralError, StructuralReason, VariableId,
};
use crate::state::KernelState;

/// Outcome of probing a prospective definition against the current graph.
#[derive(Debug, Default)]
pub(crate) struct Classification {
    pub missing: IndexSet<VariableId>,
    pub conflicts: IndexMap<VariableId, Option<ComputationId>>,
    pub cycle: Vec<ComputationId>,
    pub invalid: Option<String>,
}

impl Classification {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty()
            && self.conflicts.is_empty()
            && self.cycle.is_empty()
            && self.invalid.is_none()
    }

    pub fn reason(&self) -> StructuralReason {
        if self.invalid.is_some() {
            StructuralReason::InvalidDefinition
        } else if !self.cycle.is_empty() {
            StructuralReason::CircularDependency
        } else if !self.conflicts.is_empty() {
            StructuralReason::DuplicateOutput
        } else {
            StructuralReason::MissingInput
        }
    }

    pub fn structural_error(&self, comp_id: &str) -> StructuralError {
        StructuralError {
            reason: self.reason(),
            computation: comp_id.to_string(),
            missing_inputs: self.missing.iter().cloned().collect(),
            cycle: self.cycle.clone(),
            conflicts_with: self.conflicts.values().find_map(|owner| owner.clone()),
            detail: self.invalid.clone(),
        }
    }
}

/// Root-cause walk result for a quarantined node.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemTrace {
    pub target: String,
    /// Every quarantined computation reached from the target, in visit
    /// order, target first.
    pub path: Vec<StructuralError>,
    /// The subset that cannot be explained by another quarantined node:
    /// truly absent inputs, duplicate claims, cycles, invalid definitions.
    pub roots: Vec<StructuralError>,
}

impl KernelState {
    /// Probe a definition: missing inputs, contested outputs, cycles, and
    /// shape validity. `redefining` ignores the named computation's own
    /// current ownerships.
    pub(crate) fn classify_definition(
        &self,
        def: &Definition,
        redefining: bool,
    ) -> Classification {
        let mut cls = Classification::default();
        if def.id.is_empty() {
            cls.invalid = Some("empty computation id".to_string());
        } else if def.outputs.is_empty() {
            cls.invalid = Some("a computation must declare at least one output".to_string());
        } else {
            let mut seen = IndexSet::new();
            for output in &def.outputs {
                if !seen.insert(output.clone()) {
                    cls.invalid = Some(format!("output '{output}' declared twice"));
                    break;
                }
            }
        }

        for input in &def.inputs {
            if !self.store.vars.contains_key(input) {
                cls.missing.insert(input.clone());
            }
        }

        for output in &def.outputs {
            match self.store.producer_by_output.get(output) {
                Some(owner) if redefining && owner == &def.id => {}
                Some(owner) => {
                    cls.conflicts.insert(output.clone(), Some(owner.clone()));
                }
                None => {
                    // A bare variable with no producer entry is a source.
                    if self.store.vars.contains_key(output) {
                        cls.conflicts.insert(output.clone(), None);
                    }
                }
            }
        }

        if cls.invalid.is_none() {
            if let Some(cycle) = self
                .store
                .detect_cycle_from(&def.id, Some((def.inputs.as_slice(), def.outputs.as_slice())))
            {
                cls.cycle = cycle;
            }
        }
        cls
    }

    /// Quarantine an ill-formed definition and report the problem.
    pub(crate) fn quarantine_definition(
        &mut self,
        def: Definition,
        cls: Classification,
    ) -> StructuralError {
        let err = cls.structural_error(&def.id);
        debug!(comp = %def.id, reason = ?err.reason, "definition quarantined");
        for output in &def.outputs {
            if cls.conflicts.contains_key(output) {
                // First-win: the existing producer keeps the name; we queue
                // for promotion should it ever be freed.
                self.store.push_waiter(output, &def.id);
                continue;
            }
            let mut var = Variable::output(output, &def.id);
            var.result = CellResult::Fatal(err.clone());
            // Problem comps already missing this name can now find it.
            let consumers: Vec<ComputationId> = self
                .store
                .problem_comps
                .iter()
                .filter(|(_, p)| p.definition.inputs.contains(output))
                .map(|(pid, _)| pid.clone())
                .collect();
            for consumer in consumers {
                var.dependents.insert(consumer);
            }
            self.store.producer_by_output.insert(output.clone(), def.id.clone());
            self.install_problem_variable(var);
        }
        for input in &def.inputs {
            if let Some(var) = self.store.any_var_mut(input) {
                var.dependents.insert(def.id.clone());
            }
        }
        let outputs: IndexSet<VariableId> = def
            .outputs
            .iter()
            .filter(|o| !cls.conflicts.contains_key(*o))
            .cloned()
            .collect();
        self.store.problem_comps.insert(
            def.id.clone(),
            ProblemComputation {
                id: def.id.clone(),
                reason: err.reason,
                missing_inputs: cls.missing,
                conflicted_outputs: cls.conflicts,
                cycle: cls.cycle,
                invalid_detail: cls.invalid,
                definition: def,
                outputs,
            },
        );
        err
    }

    /// Move a currently-healthy computation (and its outputs) into the
    /// problem tables. Triggered when an input variable vanished or turned
    /// fatal upstream; cascades recursively through healthy dependents.
    pub(crate) fn mark_computation_problem(&mut self, comp_id: &str) {
        if !self.store.comps.contains_key(comp_id) {
            return;
        }
        self.abort_running(comp_id);
        let comp = self
            .store
            .comps
            .shift_remove(comp_id)
            .expect("checked above");
        debug!(comp = comp_id, "marking computation problematic");
        let runtime_inputs: Vec<VariableId> = comp.runtime_inputs.iter().cloned().collect();
        let observe_count = comp.observe_count;
        let def = comp.definition();
        drop(comp);

        // Reverse observe-count propagation; dependent edges stay in place
        // so repair can find this node again.
        for input in &runtime_inputs {
            self.propagate_observe_count(input, -observe_count);
        }

        let missing: IndexSet<VariableId> = def
            .inputs
            .iter()
            .filter(|i| !self.store.vars.contains_key(*i))
            .cloned()
            .collect();
        let err = StructuralError::missing(comp_id, missing.iter().cloned().collect());

        let mut moved: Vec<(VariableId, Vec<ComputationId>)> = Vec::new();
        for output in &def.outputs {
            let Some(mut var) = self.store.vars.shift_remove(output) else {
                continue;
            };
            var.result = CellResult::Fatal(err.clone());
            var.dirty = false;
            var.value_at = 0;
            let waiters: Vec<_> = var.waiters.drain(..).collect();
            let deps: Vec<ComputationId> = var.dependents.iter().cloned().collect();
            self.store.problem_vars.insert(output.clone(), var);
            for waiter in waiters {
                let _ = waiter.send(CellResult::Fatal(err.clone()));
            }
            self.queue_notifications_for(output);
            moved.push((output.clone(), deps));
        }

        let outputs: IndexSet<VariableId> = def.outputs.iter().cloned().collect();
        self.store.problem_comps.insert(
            comp_id.to_string(),
            ProblemComputation {
                id: comp_id.to_string(),
                reason: StructuralReason::MissingInput,
                missing_inputs: missing,
                conflicted_outputs: IndexMap::new(),
                cycle: Vec::new(),
                invalid_detail: None,
                definition: def,
                outputs,
            },
        );

        for (output, deps) in moved {
            for dep in deps {
                if self.store.comps.contains_key(&dep) {
                    self.mark_computation_problem(&dep);
                } else if let Some(problem) = self.store.problem_comps.get_mut(&dep) {
                    if problem.reason == StructuralReason::MissingInput {
                        problem.missing_inputs.insert(output.clone());
                    }
                }
            }
        }
    }

    /// Try to bring one quarantined computation back: verifies the current
    /// tables, rehydrates outputs, rebuilds a fresh computation, and lets
    /// the repair loop cascade into its downstream.
    pub(crate) fn recover_computation(&mut self, comp_id: &str) -> bool {
        let def = {
            let Some(problem) = self.store.problem_comps.get(comp_id) else {
                return false;
            };
            if problem.invalid_detail.is_some() {
                return false;
            }
            problem.definition.clone()
        };
        if def
            .inputs
            .iter()
            .any(|i| !self.store.vars.contains_key(i))
        {
            return false;
        }
        for output in &def.outputs {
            match self.store.producer_by_output.get(output) {
                Some(owner) if owner != comp_id => return false,
                Some(_) => {}
                None => {
                    if self.store.vars.contains_key(output) {
                        return false;
                    }
                }
            }
        }
        if self
            .store
            .detect_cycle_from(comp_id, Some((def.inputs.as_slice(), def.outputs.as_slice())))
            .is_some()
        {
            return false;
        }

        debug!(comp = comp_id, "recovering computation");
        self.store.problem_comps.shift_remove(comp_id);
        self.store.drop_waiter(comp_id);
        for output in &def.outputs {
            if let Some(mut var) = self.store.problem_vars.shift_remove(output) {
                var.result = CellResult::Uninitialized;
                var.value_at = 0;
                var.dirty = true;
                self.store.vars.insert(output.clone(), var);
            } else {
                // Formerly conflicted; the name is free now and first-win
                // promotion hands it to us.
                let mut var = Variable::output(output, comp_id);
                var.dirty = true;
                self.install_variable(var);
            }
            self.store
                .producer_by_output
                .insert(output.clone(), comp_id.to_string());
        }
        self.install_computation(&def);
        true
    }

    /// Re-derive a quarantined node's problem report from the current
    /// tables: a broken cycle downgrades to missing-input, a formed cycle
    /// upgrades, freed names clear conflicts. Observers are re-notified
    /// when the fatal report changes.
    pub(crate) fn refresh_problem_reason(&mut self, comp_id: &str) {
        let (def, before) = {
            let Some(problem) = self.store.problem_comps.get(comp_id) else {
                return;
            };
            if problem.invalid_detail.is_some() {
                return;
            }
            (problem.definition.clone(), problem.structural_error())
        };
        let missing: IndexSet<VariableId> = def
            .inputs
            .iter()
            .filter(|i| !self.store.vars.contains_key(*i))
            .cloned()
            .collect();
        let mut conflicts: IndexMap<VariableId, Option<ComputationId>> = IndexMap::new();
        for output in &def.outputs {
            match self.store.producer_by_output.get(output) {
                Some(owner) if owner != comp_id => {
                    conflicts.insert(output.clone(), Some(owner.clone()));
                }
                Some(_) => {}
                None => {
                    if self.store.vars.contains_key(output) {
                        conflicts.insert(output.clone(), None);
                    }
                }
            }
        }
        let cycle = self
            .store
            .detect_cycle_from(comp_id, None)
            .unwrap_or_default();

        let (after, outputs) = {
            let Some(problem) = self.store.problem_comps.get_mut(comp_id) else {
                return;
            };
            problem.missing_inputs = missing;
            problem.conflicted_outputs = conflicts;
            problem.cycle = cycle;
            problem.reason = if !problem.cycle.is_empty() {
                StructuralReason::CircularDependency
            } else if !problem.conflicted_outputs.is_empty() {
                StructuralReason::DuplicateOutput
            } else {
                StructuralReason::MissingInput
            };
            (
                problem.structural_error(),
                problem.outputs.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if after != before {
            debug!(comp = comp_id, reason = ?after.reason, "problem report updated");
            for output in outputs {
                if let Some(var) = self.store.problem_vars.get_mut(&output) {
                    var.result = CellResult::Fatal(after.clone());
                }
                self.queue_notifications_for(&output);
            }
        }
    }

    /// The repair loop, run after every structural event: refresh every
    /// quarantined node against the current tables and recover the
    /// satisfied ones, repeating until a fixpoint, so recoveries cascade
    /// transitively. Quarantined nodes iterate in definition order, which
    /// realizes first-win promotion of freed output names.
    pub(crate) fn repair_after_structural_change(&mut self) {
        loop {
            let mut recovered_any = false;
            let ids: Vec<ComputationId> = self.store.problem_comps.keys().cloned().collect();
            for id in ids {
                if !self.store.problem_comps.contains_key(&id) {
                    continue;
                }
                self.refresh_problem_reason(&id);
                let satisfied = self
                    .store
                    .problem_comps
                    .get(&id)
                    .is_some_and(|p| p.is_satisfied());
                if satisfied && self.recover_computation(&id) {
                    recovered_any = true;
                }
            }
            if !recovered_any {
                break;
            }
        }
    }

    /// Walk missing-input edges from a quarantined node to its root causes.
    pub(crate) fn trace_problem_root(&self, id: &str) -> Option<ProblemTrace> {
        let start: ComputationId = if self.store.problem_comps.contains_key(id) {
            id.to_string()
        } else {
            self.store
                .problem_vars
                .get(id)
                .and_then(|v| v.producer.clone())?
        };
        let mut visited: IndexSet<ComputationId> = IndexSet::new();
        let mut stack = vec![start];
        let mut path = Vec::new();
        let mut roots = Vec::new();
        while let Some(comp_id) = stack.pop() {
            if !visited.insert(comp_id.clone()) {
                continue;
            }
            let Some(problem) = self.store.problem_comps.get(&comp_id) else {
                continue;
            };
            let err = problem.structural_error();
            let mut is_root = problem.reason != StructuralReason::MissingInput;
            if problem.reason == StructuralReason::MissingInput {
                // An input that is not even a problem variable is truly
                // absent: this node is (also) a root.
                is_root = problem
                    .missing_inputs
                    .iter()
                    .any(|m| !self.store.problem_vars.contains_key(m));
                for missing in &problem.missing_inputs {
                    if let Some(producer) = self
                        .store
                        .problem_vars
                        .get(missing)
                        .and_then(|v| v.producer.clone())
                    {
                        stack.push(producer);
                    }
                }
            }
            if is_root {
                roots.push(err.clone());
            }
            path.push(err);
        }
        if path.is_empty() {
            None
        } else {
            Some(ProblemTrace {
                target: id.to_string(),
                path,
                roots,
            })
        }
    }
}
