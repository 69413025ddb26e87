//! Push-pull propagation: chains, diamonds, pruning laws, and dynamic
//! dependency narrowing.

use reflow_kernel::{
    body, one_output, CellResult, ComputationSpec, DefineOptions, Kernel, KernelConfig,
    SourceSpec, Value,
};
use reflow_testkit::{
    as_int, counted, int, linear_body, run, sum_body, Recorder, RunCounter,
};

fn audited_kernel() -> Kernel {
    Kernel::with_config(KernelConfig {
        assert_invariants: true,
        ..KernelConfig::default()
    })
}

fn define_linear(
    kernel: &Kernel,
    id: &str,
    input: &str,
    output: &str,
    mul: i64,
    add: i64,
) -> RunCounter {
    let (body, runs) = counted(linear_body(output, input, mul, add));
    let status = kernel.define_computation(
        ComputationSpec::new(id, [input], [output], body),
        DefineOptions::default(),
    );
    assert!(status.is_healthy(), "{id} should define cleanly");
    runs
}

#[test]
fn chain_recomputes_exactly_once_per_update() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let y_runs = define_linear(&kernel, "Y", "x", "vy", 1, 1);
        let z_runs = define_linear(&kernel, "Z", "vy", "vz", 2, 0);

        let recorder = Recorder::new();
        let _sub = kernel.observe("vz", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(4)]);
        assert_eq!(y_runs.get(), 1);
        assert_eq!(z_runs.get(), 1);

        kernel.update_source("x", int(10)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(4), int(22)]);
        assert_eq!(y_runs.get(), 2);
        assert_eq!(z_runs.get(), 2);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn diamond_is_glitch_free() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("a", int(1)), DefineOptions::default());
        let b_runs = define_linear(&kernel, "B", "a", "vb", 2, 0);
        let c_runs = define_linear(&kernel, "C", "a", "vc", 1, 5);
        let (d_body, d_runs) = counted(sum_body("vd", &["vb", "vc"]));
        let status = kernel.define_computation(
            ComputationSpec::new("D", ["vb", "vc"], ["vd"], d_body),
            DefineOptions::default(),
        );
        assert!(status.is_healthy());

        let recorder = Recorder::new();
        let _sub = kernel.observe("vd", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(8)]);
        assert_eq!(d_runs.get(), 1);

        kernel.update_source("a", int(10)).unwrap();
        kernel.wait_idle().await;
        // One perturbation, one invocation of d after both branches commit.
        assert_eq!(recorder.successes(), vec![int(8), int(35)]);
        assert_eq!(b_runs.get(), 2);
        assert_eq!(c_runs.get(), 2);
        assert_eq!(d_runs.get(), 2);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn pull_evaluation_drives_upstream_without_observers() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(3)), DefineOptions::default());
        let y_runs = define_linear(&kernel, "Y", "x", "vy", 1, 1);
        let z_runs = define_linear(&kernel, "Z", "vy", "vz", 2, 0);

        let value = kernel.get_value("vz").await.unwrap();
        assert_eq!(as_int(&value), 8);
        assert_eq!(y_runs.get(), 1);
        assert_eq!(z_runs.get(), 1);

        // The temporary observation is gone; nothing re-runs on update.
        kernel.update_source("x", int(4)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(y_runs.get(), 1);
        assert_eq!(z_runs.get(), 1);

        // Pulling again catches up.
        let value = kernel.get_value("vz").await.unwrap();
        assert_eq!(as_int(&value), 10);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn liveness_pruning_never_runs_unobserved_work() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let y_runs = define_linear(&kernel, "Y", "x", "vy", 1, 0);
        kernel.update_source("x", int(2)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(y_runs.get(), 0);
        let view = kernel.peek("vy").unwrap();
        assert!(view.is_dirty);
        assert_eq!(view.result, CellResult::Uninitialized);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn output_pruning_suppresses_downstream_work_and_notifications() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(5)), DefineOptions::default());
        // vy ignores the input value: always 7.
        let y_runs = define_linear(&kernel, "Y", "x", "vy", 0, 7);
        let z_runs = define_linear(&kernel, "Z", "vy", "vz", 1, 1);

        let vy_recorder = Recorder::new();
        let vz_recorder = Recorder::new();
        let _s1 = kernel.observe("vy", vy_recorder.callback()).unwrap();
        let _s2 = kernel.observe("vz", vz_recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(vy_recorder.successes(), vec![int(7)]);
        assert_eq!(vz_recorder.successes(), vec![int(8)]);

        kernel.update_source("x", int(6)).unwrap();
        kernel.wait_idle().await;
        // Y re-ran but produced an equal value: no notification, and Z's
        // body was skipped entirely (input pruning downstream).
        assert_eq!(y_runs.get(), 2);
        assert_eq!(z_runs.get(), 1);
        assert_eq!(vy_recorder.len(), 1);
        assert_eq!(vz_recorder.len(), 1);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn unchanged_source_update_is_input_pruned() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let y_runs = define_linear(&kernel, "Y", "x", "vy", 1, 0);
        let recorder = Recorder::new();
        let _sub = kernel.observe("vy", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(y_runs.get(), 1);

        // Same value: the cause clock advances, the value clock does not,
        // and the body is skipped without running.
        kernel.update_source("x", int(1)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(y_runs.get(), 1);
        assert_eq!(recorder.len(), 1);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn dynamic_dependencies_narrow_and_reattach() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("s", int(1)), DefineOptions::default());
        kernel.define_source(SourceSpec::with_value("p", int(10)), DefineOptions::default());
        kernel.define_source(SourceSpec::with_value("q", int(20)), DefineOptions::default());

        // Reads p when s > 0, q otherwise.
        let picker = body(move |scope, _signal| async move {
            let s = scope.get("s").await?;
            let chosen = if s.as_i64().unwrap_or(0) > 0 {
                scope.get("p").await?
            } else {
                scope.get("q").await?
            };
            Ok(one_output("vp", chosen))
        });
        let (picker, runs) = counted(picker);
        let status = kernel.define_computation(
            ComputationSpec::new("P", ["s", "p", "q"], ["vp"], picker),
            DefineOptions::default(),
        );
        assert!(status.is_healthy());

        let recorder = Recorder::new();
        let _sub = kernel.observe("vp", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(10)]);
        assert_eq!(runs.get(), 1);

        // q was not touched on the last run: it detached, so updating it
        // does nothing.
        kernel.update_source("q", int(21)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 1);

        // Flipping the selector re-runs and dynamically re-attaches q.
        kernel.update_source("s", int(-1)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(10), int(21)]);
        assert_eq!(runs.get(), 2);

        // Now p is the detached one.
        kernel.update_source("p", int(11)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 2);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn observers_on_intermediate_cells_see_each_commit() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        define_linear(&kernel, "Y", "x", "vy", 3, 0);
        define_linear(&kernel, "Z", "vy", "vz", 1, 1);

        let vy_recorder = Recorder::new();
        let vz_recorder = Recorder::new();
        let _s1 = kernel.observe("vy", vy_recorder.callback()).unwrap();
        let _s2 = kernel.observe("vz", vz_recorder.callback()).unwrap();
        kernel.wait_idle().await;
        kernel.update_source("x", int(2)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(vy_recorder.successes(), vec![int(3), int(6)]);
        assert_eq!(vz_recorder.successes(), vec![int(4), int(7)]);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn multi_output_commits_share_one_value_tick() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(2)), DefineOptions::default());
        let twin = body(move |scope, _signal| async move {
            let x = scope.get("x").await?;
            let n = x.as_i64().unwrap_or(0);
            let mut outputs = one_output("double", Value::from(n * 2));
            outputs.insert("square".to_string(), Value::from(n * n));
            Ok(outputs)
        });
        let status = kernel.define_computation(
            ComputationSpec::new("T", ["x"], ["double", "square"], twin),
            DefineOptions::default(),
        );
        assert!(status.is_healthy());

        let d = kernel.get_value("double").await.unwrap();
        let s = kernel.get_value("square").await.unwrap();
        assert_eq!(as_int(&d), 4);
        assert_eq!(as_int(&s), 4);

        kernel.update_source("x", int(3)).unwrap();
        kernel.wait_idle().await;
        let d = kernel.get_value("double").await.unwrap();
        let s = kernel.get_value("square").await.unwrap();
        assert_eq!(as_int(&d), 6);
        assert_eq!(as_int(&s), 9);
        kernel.check_invariants().unwrap();
    });
}
