//! Propagation primitives: downward dirty/cause, upward observe counts,
//! and the clean cascade that commits run.
//!
//! Both directions are synchronous and re-entrant; recursion depth is
//! bounded by graph depth.

use tracing::trace;

use crate::clock::Tick;
use crate::state::KernelState;

impl KernelState {
    /// Carry a perturbation down through one computation and its outputs.
    ///
    /// Called from source updates, clean->dirty edges of upstream variables
    /// (the recursion), dynamic-dependency attachment, and the late-cause
    /// re-check after a task settles. `source` is the input variable the
    /// perturbation arrived through (`None` for redefinition-style pushes
    /// that originate at the computation itself).
    ///
    /// `is_new_dirty` is distinct from whether `cause_at` rises: it fires
    /// the dirty-input counter only on the edge that converts a consumer's
    /// input from clean to dirty, which is what keeps the counter correct
    /// under diamond topologies.
    pub fn propagate_cause_downward(
        &mut self,
        comp_id: &str,
        new_cause: Tick,
        source: Option<&str>,
        is_new_dirty: bool,
    ) {
        // Quarantined computations carry no cause; they never execute.
        let Some(comp) = self.store.comps.get(comp_id) else {
            return;
        };
        if let Some(src_id) = source {
            if is_new_dirty && comp.runtime_inputs.contains(src_id) {
                // Sources are excluded: they are clean right after update.
                let dirty_computed = self
                    .store
                    .vars
                    .get(src_id)
                    .is_some_and(|v| v.dirty && v.producer.is_some());
                if dirty_computed {
                    self.add_comp_dirty_inputs(comp_id, 1);
                }
            }
        }

        // Monotonicity: propagation already at or past this point. The
        // raise also runs the supersession check against any running task.
        if !self.raise_comp_cause(comp_id, new_cause) {
            return;
        }
        self.set_comp_dirty(comp_id, true);

        let outputs: Vec<String> = self
            .store
            .comps
            .get(comp_id)
            .map(|c| c.outputs.iter().cloned().collect())
            .unwrap_or_default();
        for output in outputs {
            let Some((was_dirty, deps)) = ({
                self.store.vars.get_mut(&output).map(|v| {
                    let was_dirty = v.dirty;
                    if new_cause > v.cause_at {
                        v.cause_at = new_cause;
                    }
                    v.dirty = true;
                    let deps: Vec<String> = v.dependents.iter().cloned().collect();
                    (was_dirty, deps)
                })
            }) else {
                continue;
            };
            trace!(comp = comp_id, %output, cause = new_cause, "output dirtied");
            for dep in deps {
                self.propagate_cause_downward(&dep, new_cause, Some(&output), !was_dirty);
            }
        }
    }

    /// Carry an observer delta up through the consumer chain.
    ///
    /// Called by observe (+1), unobserve (-1), dynamic attach (+consumer
    /// count), and unused-input cleanup (-consumer count). A positive delta
    /// landing on a stale computation re-enters it through downward
    /// propagation so a newly-watched node catches up with missed upstream
    /// commits.
    pub fn propagate_observe_count(&mut self, var_id: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let producer = {
            let Some(var) = self.store.any_var_mut(var_id) else {
                return;
            };
            var.observe_count += delta;
            debug_assert!(var.observe_count >= 0, "observe_count underflow on '{var_id}'");
            var.producer.clone()
        };
        let Some(producer) = producer else {
            return;
        };
        // Quarantined producers never run; the count stops at the boundary.
        if !self.store.comps.contains_key(&producer) {
            return;
        }
        self.add_comp_observe(&producer, delta);
        let inputs: Vec<String> = self
            .store
            .comps
            .get(&producer)
            .map(|c| c.runtime_inputs.iter().cloned().collect())
            .unwrap_or_default();
        for input in &inputs {
            self.propagate_observe_count(input, delta);
        }
        if delta > 0 {
            self.reenter_if_stale(&producer);
        }
    }

    /// A clean computation whose inputs committed while it was unwatched is
    /// stale; push the missed cause through it so it re-enters Ready.
    fn reenter_if_stale(&mut self, comp_id: &str) {
        let Some(comp) = self.store.comps.get(comp_id) else {
            return;
        };
        if comp.dirty {
            return;
        }
        let mut max_value: Tick = 0;
        let mut max_cause: Tick = 0;
        let mut max_cause_input: Option<String> = None;
        for input in &comp.runtime_inputs {
            if let Some(var) = self.store.vars.get(input) {
                max_value = max_value.max(var.value_at);
                if var.cause_at > max_cause {
                    max_cause = var.cause_at;
                    max_cause_input = Some(input.clone());
                }
            }
        }
        let stale = comp.input_version >= 0
            && (comp.input_version as Tick) < max_value
            && max_cause > comp.cause_at;
        if stale {
            trace!(comp = comp_id, cause = max_cause, "stale on observe, re-entering");
            self.propagate_cause_downward(comp_id, max_cause, max_cause_input.as_deref(), false);
        }
    }

    /// Commit-side cascade: mark a variable clean, resolve pull waiters,
    /// notify observers when the value actually changed, and unblock
    /// dependent computations.
    pub fn clean_variable(&mut self, var_id: &str, value_changed: bool) {
        let Some((result, was_dirty, producer_some, deps, waiters)) = ({
            self.store.vars.get_mut(var_id).map(|v| {
                let was_dirty = v.dirty;
                v.dirty = false;
                let waiters: Vec<_> = v.waiters.drain(..).collect();
                let deps: Vec<String> = v.dependents.iter().cloned().collect();
                (v.result.clone(), was_dirty, v.producer.is_some(), deps, waiters)
            })
        }) else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        if value_changed {
            self.queue_notifications_for(var_id);
        }
        if was_dirty && producer_some {
            for dep in deps {
                let counts = self
                    .store
                    .comps
                    .get(&dep)
                    .is_some_and(|c| c.runtime_inputs.contains(var_id));
                if counts {
                    self.add_comp_dirty_inputs(&dep, -1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::body;
    use crate::graph::{Computation, Definition, Variable};
    use crate::kernel::KernelConfig;
    use crate::state::{classify, CompState, KernelState};

    fn noop_def(id: &str, inputs: &[&str], outputs: &[&str]) -> Definition {
        Definition {
            id: id.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            body: body(|_, _| async { Ok(Default::default()) }),
        }
    }

    /// x -> Y(vy) -> Z(vz), edges wired as after a first successful run.
    fn chain_state() -> KernelState {
        let mut st = KernelState::new(KernelConfig::default());
        let mut x = Variable::source("x");
        x.dependents.insert("Y".to_string());
        st.store.vars.insert("x".into(), x);

        let y = Computation::new(&noop_def("Y", &["x"], &["vy"]));
        let mut vy = Variable::output("vy", "Y");
        vy.dependents.insert("Z".to_string());
        st.store.comps.insert("Y".into(), y);
        st.store.vars.insert("vy".into(), vy);

        let z = Computation::new(&noop_def("Z", &["vy"], &["vz"]));
        let vz = Variable::output("vz", "Z");
        st.store.comps.insert("Z".into(), z);
        st.store.vars.insert("vz".into(), vz);

        // Pretend both ran once and are clean.
        for id in ["Y", "Z"] {
            let c = st.store.comps.get_mut(id).unwrap();
            c.dirty = false;
            c.input_version = 1;
        }
        for id in ["vy", "vz"] {
            let v = st.store.vars.get_mut(id).unwrap();
            v.dirty = false;
            v.value_at = 1;
        }
        st
    }

    #[test]
    fn downward_marks_whole_chain() {
        let mut st = chain_state();
        st.propagate_cause_downward("Y", 5, Some("x"), true);
        let y = st.store.comps.get("Y").unwrap();
        let z = st.store.comps.get("Z").unwrap();
        assert!(y.dirty && z.dirty);
        assert_eq!(y.cause_at, 5);
        assert_eq!(z.cause_at, 5);
        assert_eq!(st.store.vars.get("vy").unwrap().cause_at, 5);
        assert_eq!(st.store.vars.get("vz").unwrap().cause_at, 5);
        // vy is a computed input of Z and went clean -> dirty.
        assert_eq!(z.dirty_input_count, 1);
        // x is a source: never counted.
        assert_eq!(y.dirty_input_count, 0);
    }

    #[test]
    fn downward_is_idempotent_at_same_cause() {
        let mut st = chain_state();
        st.propagate_cause_downward("Y", 5, Some("x"), true);
        st.propagate_cause_downward("Y", 5, Some("x"), false);
        assert_eq!(st.store.comps.get("Z").unwrap().dirty_input_count, 1);
    }

    #[test]
    fn diamond_counts_each_converting_edge_once() {
        // a -> B(vb), a -> C(vc), D(vb, vc -> vd)
        let mut st = KernelState::new(KernelConfig::default());
        let mut a = Variable::source("a");
        a.dependents.insert("B".into());
        a.dependents.insert("C".into());
        st.store.vars.insert("a".into(), a);
        for (comp, out) in [("B", "vb"), ("C", "vc")] {
            let c = Computation::new(&noop_def(comp, &["a"], &[out]));
            let mut v = Variable::output(out, comp);
            v.dependents.insert("D".into());
            v.dirty = false;
            v.value_at = 1;
            st.store.comps.insert(comp.into(), c);
            st.store.vars.insert(out.into(), v);
        }
        let d = Computation::new(&noop_def("D", &["vb", "vc"], &["vd"]));
        st.store.comps.insert("D".into(), d);
        st.store.vars.insert("vd".into(), Variable::output("vd", "D"));
        for id in ["B", "C", "D"] {
            let c = st.store.comps.get_mut(id).unwrap();
            c.dirty = false;
            c.input_version = 1;
        }
        let vd = st.store.vars.get_mut("vd").unwrap();
        vd.dirty = false;
        vd.value_at = 1;

        st.propagate_cause_downward("B", 4, Some("a"), true);
        st.propagate_cause_downward("C", 4, Some("a"), true);
        let d = st.store.comps.get("D").unwrap();
        assert_eq!(d.dirty_input_count, 2);
        assert_eq!(classify(d), CompState::Idle); // unobserved

        // Cleaning both converging inputs unblocks D exactly once.
        let mut st2 = st;
        st2.add_comp_observe("D", 1);
        assert_eq!(classify(st2.store.comps.get("D").unwrap()), CompState::Pending);
        st2.clean_variable("vb", true);
        assert_eq!(st2.store.comps.get("D").unwrap().dirty_input_count, 1);
        st2.clean_variable("vc", true);
        let d = st2.store.comps.get("D").unwrap();
        assert_eq!(d.dirty_input_count, 0);
        assert_eq!(classify(d), CompState::Ready);
        assert_eq!(st2.ready.len(), 1);
    }

    #[test]
    fn observe_count_recurses_through_runtime_inputs() {
        let mut st = chain_state();
        st.propagate_observe_count("vz", 1);
        assert_eq!(st.store.vars.get("vz").unwrap().observe_count, 1);
        assert_eq!(st.store.comps.get("Z").unwrap().observe_count, 1);
        assert_eq!(st.store.vars.get("vy").unwrap().observe_count, 1);
        assert_eq!(st.store.comps.get("Y").unwrap().observe_count, 1);
        assert_eq!(st.store.vars.get("x").unwrap().observe_count, 1);

        st.propagate_observe_count("vz", -1);
        assert_eq!(st.store.vars.get("x").unwrap().observe_count, 0);
        assert_eq!(st.store.comps.get("Y").unwrap().observe_count, 0);
    }

    #[test]
    fn observing_a_stale_computation_reenters_ready() {
        let mut st = chain_state();
        // x committed at tick 3 while nothing watched; Y stayed clean with
        // input_version 1.
        {
            let x = st.store.vars.get_mut("x").unwrap();
            x.value_at = 3;
            x.cause_at = 3;
        }
        st.propagate_observe_count("vy", 1);
        let y = st.store.comps.get("Y").unwrap();
        assert!(y.dirty);
        assert_eq!(y.cause_at, 3);
        assert_eq!(classify(y), CompState::Ready);
    }

    #[test]
    fn clean_variable_resolves_waiters_without_notifying_on_unchanged() {
        let mut st = chain_state();
        st.propagate_cause_downward("Y", 5, Some("x"), true);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        st.store.vars.get_mut("vy").unwrap().waiters.push(tx);
        st.clean_variable("vy", false);
        assert!(rx.try_recv().is_ok());
        assert!(st.notifications.is_empty());
    }
}
