//! Graph lifecycle: installing, updating, redefining, and removing nodes.
//!
//! Every operation here is a structural event; each ends by running the
//! repair loop so quarantined neighborhoods recover as soon as they can.

use indexmap::IndexSet;
use tracing::debug;

use crate::graph::{Computation, Definition, Variable};
use crate::kernel::{
    ComputationSpec, ComputationStatus, DefineOptions, RemovalStatus, SourceSpec, SourceStatus,
};
use crate::error::KernelError;
use crate::result::{CellResult, ComputationId, StructuralError, Value, VariableId};
use crate::state::{classify, CompState, KernelState};

impl KernelState {
    /// Insert a fresh normal variable, re-attaching (and re-notifying) any
    /// observers orphaned by an earlier removal of the same name.
    pub(crate) fn install_variable(&mut self, mut var: Variable) {
        let id = var.id.clone();
        let orphans = self.store.orphaned_observers.remove(&id);
        let restored = orphans.as_ref().map(|o| o.len() as i64).unwrap_or(0);
        if let Some(orphans) = orphans {
            for (observer_id, observer) in orphans {
                var.observers.insert(observer_id, observer);
            }
        }
        self.store.vars.insert(id.clone(), var);
        if restored > 0 {
            self.propagate_observe_count(&id, restored);
            self.queue_notifications_for(&id);
        }
    }

    /// Same for a quarantined variable; the observe count stops at the
    /// problem boundary.
    pub(crate) fn install_problem_variable(&mut self, mut var: Variable) {
        let id = var.id.clone();
        let orphans = self.store.orphaned_observers.remove(&id);
        let restored = orphans.as_ref().map(|o| o.len() as i64).unwrap_or(0);
        if let Some(orphans) = orphans {
            for (observer_id, observer) in orphans {
                var.observers.insert(observer_id, observer);
            }
        }
        self.store.problem_vars.insert(id.clone(), var);
        if restored > 0 {
            self.propagate_observe_count(&id, restored);
        }
        // Observers attached to a quarantined name learn its fate at once.
        self.queue_notifications_for(&id);
    }

    /// Build and wire a healthy computation from its definition. Outputs
    /// must already be installed as normal variables owned by this id.
    pub(crate) fn install_computation(&mut self, def: &Definition) {
        let mut comp = Computation::new(def);
        let id = comp.id.clone();
        let input_cause = comp
            .static_inputs
            .iter()
            .filter_map(|i| self.store.vars.get(i))
            .map(|v| v.cause_at)
            .max()
            .unwrap_or(0);
        comp.cause_at = input_cause.max(self.clock.current());
        comp.dirty_input_count = comp
            .static_inputs
            .iter()
            .filter_map(|i| self.store.vars.get(i))
            .filter(|v| v.dirty && v.producer.is_some())
            .count() as i64;
        comp.observe_count = comp
            .outputs
            .iter()
            .filter_map(|o| self.store.vars.get(o))
            .map(|v| v.observe_count)
            .sum();
        let cause = comp.cause_at;
        let observe_count = comp.observe_count;
        let inputs: Vec<VariableId> = comp.static_inputs.iter().cloned().collect();
        let outputs: Vec<VariableId> = comp.outputs.iter().cloned().collect();
        self.store.comps.insert(id.clone(), comp);

        for output in &outputs {
            if let Some(var) = self.store.vars.get_mut(output) {
                var.cause_at = cause;
                var.dirty = true;
            }
        }
        for input in &inputs {
            if let Some(var) = self.store.any_var_mut(input) {
                var.dependents.insert(id.clone());
            }
        }
        if observe_count != 0 {
            for input in &inputs {
                self.propagate_observe_count(input, observe_count);
            }
        }
        let ready = self
            .store
            .comps
            .get(&id)
            .is_some_and(|c| classify(c) == CompState::Ready);
        if ready {
            self.enqueue_ready(&id);
        }
        debug!(comp = %id, cause, "computation installed");
    }

    // ---- sources ----

    pub(crate) fn define_source_inner(
        &mut self,
        spec: SourceSpec,
        opts: DefineOptions,
    ) -> SourceStatus {
        let id = spec.id.clone();
        if id.is_empty() {
            return SourceStatus::problematic(
                &id,
                StructuralError::invalid("", "empty source id"),
            );
        }
        if let Some(var) = self.store.vars.get(&id) {
            if let Some(producer) = var.producer.clone() {
                return SourceStatus::problematic(
                    &id,
                    StructuralError::invalid(
                        producer,
                        format!("'{id}' is owned by a computation"),
                    ),
                );
            }
            if !opts.allow_redefinition {
                return SourceStatus::problematic(
                    &id,
                    StructuralError::invalid(
                        "",
                        format!("source '{id}' already defined; pass allow_redefinition"),
                    ),
                );
            }
            return self.redefine_source(&id, spec.initial_value);
        }
        if let Some(owner) = self
            .store
            .problem_vars
            .get(&id)
            .and_then(|v| v.producer.clone())
        {
            return SourceStatus::problematic(
                &id,
                StructuralError::invalid(
                    owner,
                    format!("'{id}' is owned by a quarantined computation"),
                ),
            );
        }

        let mut var = Variable::source(&id);
        if let Some(value) = spec.initial_value {
            // Initial-value installation consumes one tick.
            let tick = self.clock.next();
            var.result = CellResult::Success(value);
            var.value_at = tick;
            var.cause_at = tick;
        }
        debug!(source = %id, "source defined");
        self.install_variable(var);
        self.repair_after_structural_change();
        SourceStatus::healthy(&id)
    }

    /// Source redefinition: the cause clock always advances (downstream
    /// re-validates and input-prunes); the value clock only on change.
    fn redefine_source(&mut self, id: &str, value: Option<Value>) -> SourceStatus {
        let tick = self.clock.next();
        let changed = {
            let var = self.store.vars.get_mut(id).expect("caller checked");
            let changed = match (&value, &var.result) {
                (Some(new), CellResult::Success(old)) => new != old,
                (Some(_), _) => true,
                (None, _) => false,
            };
            var.cause_at = tick;
            if changed {
                var.result = CellResult::Success(value.expect("changed implies value"));
                var.value_at = tick;
            }
            changed
        };
        debug!(source = id, tick, changed, "source redefined");
        if changed {
            self.queue_notifications_for(id);
        }
        let deps: Vec<ComputationId> = self
            .store
            .vars
            .get(id)
            .map(|v| v.dependents.iter().cloned().collect())
            .unwrap_or_default();
        for dep in deps {
            self.propagate_cause_downward(&dep, tick, Some(id), true);
        }
        self.repair_after_structural_change();
        SourceStatus::healthy(id)
    }

    pub(crate) fn update_source_inner(
        &mut self,
        id: &str,
        value: Value,
    ) -> Result<(), KernelError> {
        let was_uninitialized = {
            let Some(var) = self.store.vars.get(id) else {
                return Err(KernelError::UnknownVariable(id.to_string()));
            };
            if var.producer.is_some() {
                return Err(KernelError::NotASource(id.to_string()));
            }
            matches!(var.result, CellResult::Uninitialized)
        };

        // One tick whether or not the value changed: unchanged updates
        // still perturb downstream, which then input-prunes.
        let tick = self.clock.next();
        let changed = {
            let var = self.store.vars.get_mut(id).expect("checked above");
            let changed = match &var.result {
                CellResult::Success(old) => *old != value,
                _ => true,
            };
            var.cause_at = tick;
            if changed {
                var.result = CellResult::Success(value);
                var.value_at = tick;
            }
            changed
        };
        debug!(source = id, tick, changed, "source updated");
        if changed {
            // Sources are clean; observers see the change immediately.
            self.queue_notifications_for(id);
        }
        let deps: Vec<ComputationId> = self
            .store
            .vars
            .get(id)
            .map(|v| v.dependents.iter().cloned().collect())
            .unwrap_or_default();
        for dep in deps {
            self.propagate_cause_downward(&dep, tick, Some(id), true);
        }
        if was_uninitialized {
            self.repair_after_structural_change();
        }
        Ok(())
    }

    pub(crate) fn remove_source_inner(&mut self, id: &str) -> RemovalStatus {
        let is_source = match self.store.vars.get(id) {
            Some(var) => var.producer.is_none(),
            None => {
                return RemovalStatus {
                    id: id.to_string(),
                    removed: false,
                    detail: Some("not found".to_string()),
                    marked_problematic: Vec::new(),
                }
            }
        };
        if !is_source {
            return RemovalStatus {
                id: id.to_string(),
                removed: false,
                detail: Some("not a source".to_string()),
                marked_problematic: Vec::new(),
            };
        }
        let mut var = self.store.vars.shift_remove(id).expect("checked above");
        debug!(source = id, "source removed");
        if !var.observers.is_empty() {
            self.store
                .orphaned_observers
                .insert(id.to_string(), std::mem::take(&mut var.observers));
        }
        let deps: Vec<ComputationId> = var.dependents.iter().cloned().collect();
        drop(var); // pending pull waiters re-inspect and see the name gone

        let mut marked = Vec::new();
        for dep in deps {
            if self.store.comps.contains_key(&dep) {
                self.mark_computation_problem(&dep);
                marked.push(dep);
            }
        }
        self.repair_after_structural_change();
        RemovalStatus {
            id: id.to_string(),
            removed: true,
            detail: None,
            marked_problematic: marked,
        }
    }

    // ---- computations ----

    pub(crate) fn define_computation_inner(
        &mut self,
        spec: ComputationSpec,
        opts: DefineOptions,
    ) -> ComputationStatus {
        let mut seen = IndexSet::new();
        for input in spec.inputs {
            seen.insert(input);
        }
        let def = Definition {
            id: spec.id,
            inputs: seen.into_iter().collect(),
            outputs: spec.outputs,
            body: spec.body,
        };
        let id = def.id.clone();

        let exists = self.store.comp_exists(&id);
        if exists && !opts.allow_redefinition {
            return ComputationStatus::problematic(
                &id,
                StructuralError::invalid(
                    id.clone(),
                    format!("computation '{id}' already defined; pass allow_redefinition"),
                ),
                Vec::new(),
            );
        }
        if exists {
            return self.redefine_computation(def);
        }
        let status = self.define_computation_fresh(def);
        self.repair_after_structural_change();
        status
    }

    /// Classification and installation for an id not currently defined.
    fn define_computation_fresh(&mut self, def: Definition) -> ComputationStatus {
        let id = def.id.clone();
        let cls = self.classify_definition(&def, false);
        if cls.is_healthy() {
            for output in &def.outputs {
                let mut var = Variable::output(output, &id);
                var.dirty = true;
                self.install_variable(var);
                self.store
                    .producer_by_output
                    .insert(output.clone(), id.clone());
            }
            self.install_computation(&def);
            ComputationStatus::healthy(&id)
        } else {
            let quarantined: Vec<VariableId> = def
                .outputs
                .iter()
                .filter(|o| !cls.conflicts.contains_key(*o))
                .cloned()
                .collect();
            let err = self.quarantine_definition(def, cls);
            ComputationStatus::problematic(&id, err, quarantined)
        }
    }

    /// Redefinition with the flag set. A healthy-to-healthy rewrite with an
    /// unchanged output set updates in place; everything else runs the full
    /// replace cycle (remove, define anew, observers restored through the
    /// orphan table).
    fn redefine_computation(&mut self, def: Definition) -> ComputationStatus {
        let id = def.id.clone();
        debug!(comp = %id, "redefining computation");
        if let Some(existing) = self.store.comps.get(&id) {
            let new_outputs: IndexSet<VariableId> = def.outputs.iter().cloned().collect();
            let same_outputs = existing.outputs == new_outputs;
            if same_outputs {
                let cls = self.classify_definition(&def, true);
                if cls.is_healthy() {
                    return self.redefine_in_place(def);
                }
            }
        }
        self.remove_computation_inner(&id);
        let status = self.define_computation_fresh(def);
        self.repair_after_structural_change();
        status
    }

    /// The optimized normal-to-normal path: no node churn, no observer
    /// churn. Forces re-execution with a fresh clock tick.
    fn redefine_in_place(&mut self, def: Definition) -> ComputationStatus {
        let id = def.id.clone();
        self.abort_running(&id);
        let (old_inputs, observe_count) = {
            let comp = self.store.comps.get(&id).expect("caller checked");
            (
                comp.runtime_inputs
                    .iter()
                    .cloned()
                    .collect::<Vec<VariableId>>(),
                comp.observe_count,
            )
        };
        for input in &old_inputs {
            if let Some(var) = self.store.any_var_mut(input) {
                var.dependents.shift_remove(&id);
            }
            self.propagate_observe_count(input, -observe_count);
        }

        let new_inputs: IndexSet<VariableId> = def.inputs.iter().cloned().collect();
        let dirty_inputs = new_inputs
            .iter()
            .filter_map(|i| self.store.vars.get(i))
            .filter(|v| v.dirty && v.producer.is_some())
            .count() as i64;
        {
            let comp = self.store.comps.get_mut(&id).expect("caller checked");
            comp.static_inputs = new_inputs.clone();
            comp.runtime_inputs = new_inputs.clone();
            comp.body = def.body.clone();
            comp.input_version = -1; // force re-execution
            comp.dirty_input_count = dirty_inputs;
        }
        for input in &new_inputs {
            if let Some(var) = self.store.vars.get_mut(input) {
                var.dependents.insert(id.clone());
            }
        }
        for input in &new_inputs {
            self.propagate_observe_count(input, observe_count);
        }

        // Redefinition consumes one tick; outputs go dirty and the cause
        // cascades downstream.
        let tick = self.clock.next();
        self.propagate_cause_downward(&id, tick, None, false);
        self.repair_after_structural_change();
        ComputationStatus::healthy(&id)
    }

    pub(crate) fn remove_computation_inner(&mut self, id: &str) -> RemovalStatus {
        if self.store.comps.contains_key(id) {
            self.abort_running(id);
            let comp = self.store.comps.shift_remove(id).expect("checked above");
            debug!(comp = id, "computation removed");
            let observe_count = comp.observe_count;
            let runtime_inputs: Vec<VariableId> = comp.runtime_inputs.iter().cloned().collect();
            let static_inputs: Vec<VariableId> = comp.static_inputs.iter().cloned().collect();
            let outputs: Vec<VariableId> = comp.outputs.iter().cloned().collect();
            drop(comp); // settling tasks find the id gone and fall away

            for input in &runtime_inputs {
                self.propagate_observe_count(input, -observe_count);
            }
            for input in static_inputs.iter().chain(runtime_inputs.iter()) {
                if let Some(var) = self.store.any_var_mut(input) {
                    var.dependents.shift_remove(id);
                }
            }

            let mut marked = Vec::new();
            for output in &outputs {
                self.store.producer_by_output.remove(output);
                let Some(mut var) = self.store.vars.shift_remove(output) else {
                    continue;
                };
                if !var.observers.is_empty() {
                    self.store
                        .orphaned_observers
                        .insert(output.clone(), std::mem::take(&mut var.observers));
                }
                let deps: Vec<ComputationId> = var.dependents.iter().cloned().collect();
                drop(var);
                for dep in deps {
                    if self.store.comps.contains_key(&dep) {
                        self.mark_computation_problem(&dep);
                        marked.push(dep);
                    }
                }
            }
            self.repair_after_structural_change();
            return RemovalStatus {
                id: id.to_string(),
                removed: true,
                detail: None,
                marked_problematic: marked,
            };
        }

        if let Some(problem) = self.store.problem_comps.shift_remove(id) {
            debug!(comp = id, "quarantined computation removed");
            self.store.drop_waiter(id);
            for output in &problem.outputs {
                self.store.producer_by_output.remove(output);
                if let Some(mut var) = self.store.problem_vars.shift_remove(output) {
                    if !var.observers.is_empty() {
                        self.store
                            .orphaned_observers
                            .insert(output.clone(), std::mem::take(&mut var.observers));
                    }
                }
            }
            for input in &problem.definition.inputs {
                if let Some(var) = self.store.any_var_mut(input) {
                    var.dependents.shift_remove(id);
                }
            }
            self.repair_after_structural_change();
            return RemovalStatus {
                id: id.to_string(),
                removed: true,
                detail: None,
                marked_problematic: Vec::new(),
            };
        }

        RemovalStatus {
            id: id.to_string(),
            removed: false,
            detail: Some("not found".to_string()),
            marked_problematic: Vec::new(),
        }
    }
}
