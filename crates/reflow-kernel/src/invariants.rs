//! Quantified invariant audit, run after every mutation batch when
//! `assert_invariants` is set, or on demand from the facade.

use crate::result::CellResult;
use crate::state::{classify, CompState, KernelState};

/// Check every structural invariant the kernel promises at quiescence and
/// after each setter. Returns the full list of violations.
pub(crate) fn check(st: &KernelState) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    for (id, var) in &st.store.vars {
        if var.producer.is_none() && var.dirty {
            violations.push(format!("source '{id}' is dirty"));
        }
        let uninitialized = matches!(var.result, CellResult::Uninitialized);
        if (var.value_at == 0) != uninitialized {
            violations.push(format!(
                "variable '{id}': value_at={} inconsistent with result",
                var.value_at
            ));
        }
        if matches!(var.result, CellResult::Fatal(_)) {
            violations.push(format!("variable '{id}' carries Fatal outside quarantine"));
        }
        if var.observe_count < 0 {
            violations.push(format!("variable '{id}' has negative observe_count"));
        }
    }

    for (id, comp) in &st.store.comps {
        if !comp.runtime_inputs.is_subset(&comp.static_inputs) {
            violations.push(format!("computation '{id}': runtime inputs exceed static set"));
        }
        for input in &comp.runtime_inputs {
            if st.store.problem_vars.contains_key(input) {
                violations.push(format!(
                    "computation '{id}' consumes quarantined variable '{input}'"
                ));
            }
            if let Some(var) = st.store.vars.get(input) {
                if var.cause_at > comp.cause_at {
                    violations.push(format!(
                        "computation '{id}': cause_at {} behind input '{input}' at {}",
                        comp.cause_at, var.cause_at
                    ));
                }
            }
        }
        for output in &comp.outputs {
            if let Some(var) = st.store.vars.get(output) {
                if var.cause_at != comp.cause_at {
                    violations.push(format!(
                        "output '{output}': cause_at {} != computation '{id}' at {}",
                        var.cause_at, comp.cause_at
                    ));
                }
            } else {
                violations.push(format!("computation '{id}': output '{output}' missing"));
            }
        }
        let all_outputs_dirty = comp
            .outputs
            .iter()
            .all(|o| st.store.vars.get(o).is_some_and(|v| v.dirty));
        if comp.dirty != all_outputs_dirty {
            violations.push(format!(
                "computation '{id}': dirty={} but outputs disagree",
                comp.dirty
            ));
        }
        let expected_dirty_inputs = comp
            .runtime_inputs
            .iter()
            .filter_map(|i| st.store.vars.get(i))
            .filter(|v| v.producer.is_some() && v.dirty)
            .count() as i64;
        if comp.dirty_input_count != expected_dirty_inputs {
            violations.push(format!(
                "computation '{id}': dirty_input_count={} expected {}",
                comp.dirty_input_count, expected_dirty_inputs
            ));
        }
        if comp.observe_count < 0 {
            violations.push(format!("computation '{id}' has negative observe_count"));
        }
        if let Some(task) = &comp.running_task {
            if classify(comp) != CompState::Ready {
                violations.push(format!(
                    "computation '{id}': running task outside Ready state"
                ));
            }
            if comp.aborting_tasks.iter().any(|t| t.id == task.id) {
                violations.push(format!(
                    "computation '{id}': running task also listed as aborting"
                ));
            }
        }
        for task in &comp.aborting_tasks {
            if !task.signal.is_aborted() {
                violations.push(format!(
                    "computation '{id}': aborting task {} was never cancelled",
                    task.id
                ));
            }
        }
    }

    for (id, var) in &st.store.problem_vars {
        if !matches!(var.result, CellResult::Fatal(_)) {
            violations.push(format!("problem variable '{id}' does not carry Fatal"));
        }
        if var.dirty {
            violations.push(format!("problem variable '{id}' is dirty"));
        }
    }

    for id in &st.ready_set {
        if !st.ready.contains(id) {
            violations.push(format!("ready-set entry '{id}' missing from queue"));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
