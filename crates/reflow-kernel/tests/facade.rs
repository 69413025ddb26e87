//! Facade semantics: observation, error propagation as data, redefinition,
//! peeks, removal statuses, and idle tracking.

use anyhow::anyhow;
use reflow_kernel::{
    body, one_output, CellResult, ComputationSpec, DefineOptions, Kernel, KernelConfig,
    KernelError, NodeHealth, SourceSpec,
};
use reflow_testkit::{
    as_int, counted, failing_body, int, linear_body, run, sum_body, Recorder,
};

fn audited_kernel() -> Kernel {
    Kernel::with_config(KernelConfig {
        assert_invariants: true,
        ..KernelConfig::default()
    })
}

#[test]
fn observing_a_clean_cell_fires_immediately() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(5)), DefineOptions::default());
        let recorder = Recorder::new();
        let _sub = kernel.observe("x", recorder.callback()).unwrap();
        // Before any scheduling happens the current result is delivered.
        assert_eq!(recorder.successes(), vec![int(5)]);

        // An uninitialized source is also clean.
        kernel.define_source(SourceSpec::new("y"), DefineOptions::default());
        let uninit = Recorder::new();
        let _sub2 = kernel.observe("y", uninit.callback()).unwrap();
        assert_eq!(uninit.results(), vec![CellResult::Uninitialized]);

        assert!(matches!(
            kernel.observe("nope", |_| {}),
            Err(KernelError::UnknownVariable(_))
        ));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn unsubscribe_stops_notifications() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let recorder = Recorder::new();
        let sub = kernel.observe("x", recorder.callback()).unwrap();
        kernel.update_source("x", int(2)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(1), int(2)]);

        sub.unsubscribe();
        kernel.update_source("x", int(3)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.len(), 2);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn body_errors_become_error_results_and_rethrow_downstream() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("F", ["x"], ["vf"], failing_body("boom")),
            DefineOptions::default(),
        );

        let result = kernel.get_value_result("vf").await.unwrap();
        assert!(matches!(result, CellResult::Error(_)));
        let err = kernel.get_value("vf").await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        // Downstream bodies reading the erroring cell fail with the same
        // error; it propagates as data, not as quarantine.
        kernel.define_computation(
            ComputationSpec::new("G", ["vf"], ["vg"], linear_body("vg", "vf", 1, 0)),
            DefineOptions::default(),
        );
        let result = kernel.get_value_result("vg").await.unwrap();
        assert!(matches!(result, CellResult::Error(_)));
        assert!(kernel.problem_computations().is_empty());

        // A catching body reads the full result instead and survives.
        let catcher = body(move |scope, _signal| async move {
            let upstream = scope.get_result("vf").await?;
            let fallback = match upstream {
                CellResult::Success(v) => v,
                _ => int(0),
            };
            Ok(one_output("vh", fallback))
        });
        kernel.define_computation(
            ComputationSpec::new("H", ["vf"], ["vh"], catcher),
            DefineOptions::default(),
        );
        assert_eq!(as_int(&kernel.get_value("vh").await.unwrap()), 0);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn errors_retry_only_on_real_input_change() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let flaky = body(move |scope, _signal| async move {
            let x = scope.get("x").await?;
            let n = x.as_i64().unwrap_or(0);
            if n < 0 {
                return Err(anyhow!("negative input"));
            }
            Ok(one_output("vy", int(n * 2)))
        });
        let (flaky, runs) = counted(flaky);
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], flaky),
            DefineOptions::default(),
        );
        let recorder = Recorder::new();
        let _sub = kernel.observe("vy", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(2)]);

        kernel.update_source("x", int(-1)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 2);
        assert!(matches!(recorder.last(), Some(CellResult::Error(_))));

        // An unchanged write does not re-run the failing body.
        kernel.update_source("x", int(-1)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 2);

        kernel.update_source("x", int(4)).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 3);
        assert_eq!(recorder.last(), Some(CellResult::Success(int(8))));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn reading_uninitialized_and_undeclared_inputs_fails_the_body() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::new("x"), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 0)),
            DefineOptions::default(),
        );
        let result = kernel.get_value_result("vy").await.unwrap();
        assert!(matches!(result, CellResult::Error(_)));

        // Undeclared access is invalid-dynamic-access, surfaced as a body
        // error naming the variable.
        kernel.define_source(SourceSpec::with_value("q", int(1)), DefineOptions::default());
        let sneaky = body(move |scope, _signal| async move {
            let q = scope.get("q").await?;
            Ok(one_output("vz", q))
        });
        kernel.define_computation(
            ComputationSpec::new("Z", ["x"], ["vz"], sneaky),
            DefineOptions::default(),
        );
        let err = kernel.get_value("vz").await.unwrap_err();
        assert!(err.to_string().contains("outside its declared inputs"));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn peek_has_no_side_effects() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let (probe, runs) = counted(linear_body("vy", "x", 1, 0));
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], probe),
            DefineOptions::default(),
        );

        let view = kernel.peek("vy").unwrap();
        assert!(view.is_dirty);
        assert_eq!(view.result, CellResult::Uninitialized);
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 0);

        let snapshot = kernel.peek_computation("Y").unwrap();
        assert_eq!(snapshot.health, NodeHealth::Healthy);
        assert!(snapshot.dirty);
        assert_eq!(snapshot.observe_count, 0);
        assert_eq!(snapshot.static_inputs, vec!["x".to_string()]);
        assert!(!snapshot.has_running_task);

        assert!(matches!(
            kernel.peek("ghost"),
            Err(KernelError::UnknownVariable(_))
        ));
        assert!(matches!(
            kernel.peek_computation("ghost"),
            Err(KernelError::UnknownComputation(_))
        ));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn update_source_rejects_unknown_and_computed_targets() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 0)),
            DefineOptions::default(),
        );
        assert!(matches!(
            kernel.update_source("ghost", int(1)),
            Err(KernelError::UnknownVariable(_))
        ));
        assert!(matches!(
            kernel.update_source("vy", int(1)),
            Err(KernelError::NotASource(_))
        ));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn definition_without_the_flag_never_clobbers() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let again = kernel.define_source(SourceSpec::with_value("x", int(9)), DefineOptions::default());
        assert_eq!(again.health, NodeHealth::Problematic);
        assert_eq!(as_int(&kernel.get_value("x").await.unwrap()), 1);

        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 0)),
            DefineOptions::default(),
        );
        let again = kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 5, 0)),
            DefineOptions::default(),
        );
        assert_eq!(again.health, NodeHealth::Problematic);
        assert_eq!(as_int(&kernel.get_value("vy").await.unwrap()), 1);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn in_place_redefinition_forces_a_rerun() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 1)),
            DefineOptions::default(),
        );
        let recorder = Recorder::new();
        let _sub = kernel.observe("vy", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(2)]);

        // Same outputs, new body: updates in place, observers kept.
        let status = kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 2)),
            DefineOptions::redefinition(),
        );
        assert!(status.is_healthy());
        kernel.wait_idle().await;
        assert_eq!(recorder.successes(), vec![int(2), int(3)]);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn source_redefinition_bumps_cause_but_not_value_when_unchanged() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let (probe, runs) = counted(linear_body("vy", "x", 1, 0));
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], probe),
            DefineOptions::default(),
        );
        let recorder = Recorder::new();
        let _sub = kernel.observe("vy", recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 1);

        // Unchanged value: downstream revalidates and prunes the run.
        let status =
            kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::redefinition());
        assert!(status.is_healthy());
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 1);
        assert_eq!(recorder.len(), 1);

        // Changed value recomputes.
        kernel.define_source(SourceSpec::with_value("x", int(2)), DefineOptions::redefinition());
        kernel.wait_idle().await;
        assert_eq!(runs.get(), 2);
        assert_eq!(recorder.successes(), vec![int(1), int(2)]);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn full_redefinition_replaces_outputs_and_renotifies() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 0)),
            DefineOptions::default(),
        );
        let vy_recorder = Recorder::new();
        let _sub = kernel.observe("vy", vy_recorder.callback()).unwrap();
        kernel.wait_idle().await;
        assert_eq!(vy_recorder.successes(), vec![int(1)]);

        // The new definition drops vy and produces vy2 instead; the vy
        // observer set is parked and the name's disappearance is visible
        // when it is re-claimed later.
        let status = kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy2"], linear_body("vy2", "x", 2, 0)),
            DefineOptions::redefinition(),
        );
        assert!(status.is_healthy());
        kernel.wait_idle().await;
        assert_eq!(as_int(&kernel.get_value("vy2").await.unwrap()), 2);
        assert!(matches!(
            kernel.peek("vy"),
            Err(KernelError::UnknownVariable(_))
        ));

        // A source re-creating the vacated name re-attaches the parked
        // observers and re-notifies them with its state.
        kernel.define_source(SourceSpec::with_value("vy", int(42)), DefineOptions::default());
        kernel.wait_idle().await;
        assert_eq!(vy_recorder.last(), Some(CellResult::Success(int(42))));
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn removal_statuses_never_throw() {
    run(async {
        let kernel = audited_kernel();
        let missing = kernel.remove_source("ghost");
        assert!(!missing.removed);
        assert_eq!(missing.detail.as_deref(), Some("not found"));

        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("Y", ["x"], ["vy"], linear_body("vy", "x", 1, 0)),
            DefineOptions::default(),
        );
        let wrong_kind = kernel.remove_source("vy");
        assert!(!wrong_kind.removed);
        assert_eq!(wrong_kind.detail.as_deref(), Some("not a source"));

        let gone = kernel.remove_computation("Y");
        assert!(gone.removed);
        let twice = kernel.remove_computation("Y");
        assert!(!twice.removed);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn with_transaction_is_a_pass_through() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        let inner = kernel.clone();
        let out = kernel
            .with_transaction(async move {
                inner.update_source("x", int(2))?;
                inner.update_source("x", int(3))?;
                Ok(as_int(&inner.get_value("x").await?))
            })
            .await
            .unwrap();
        assert_eq!(out, 3);

        let failed: anyhow::Result<()> = kernel
            .with_transaction(async { Err(anyhow!("rolled forward anyway")) })
            .await;
        assert!(failed.is_err());
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn wait_idle_resolves_immediately_when_quiescent() {
    run(async {
        let kernel = audited_kernel();
        kernel.wait_idle().await;
        kernel.define_source(SourceSpec::with_value("x", int(1)), DefineOptions::default());
        kernel.wait_idle().await;
        let health = kernel.graph_health();
        assert!(health.is_idle);
        assert_eq!(health.variables, 1);
        assert_eq!(health.tasks_in_flight, 0);
        kernel.check_invariants().unwrap();
    });
}

#[test]
fn diamond_pull_after_idle_sees_consistent_state() {
    run(async {
        let kernel = audited_kernel();
        kernel.define_source(SourceSpec::with_value("a", int(2)), DefineOptions::default());
        kernel.define_computation(
            ComputationSpec::new("B", ["a"], ["vb"], linear_body("vb", "a", 2, 0)),
            DefineOptions::default(),
        );
        kernel.define_computation(
            ComputationSpec::new("C", ["a"], ["vc"], linear_body("vc", "a", 1, 5)),
            DefineOptions::default(),
        );
        kernel.define_computation(
            ComputationSpec::new("D", ["vb", "vc"], ["vd"], sum_body("vd", &["vb", "vc"])),
            DefineOptions::default(),
        );
        assert_eq!(as_int(&kernel.get_value("vd").await.unwrap()), 11);
        kernel.update_source("a", int(3)).unwrap();
        assert_eq!(as_int(&kernel.get_value("vd").await.unwrap()), 14);
        kernel.check_invariants().unwrap();
    });
}
