//! Deterministic test harness for the reflow kernel.
//!
//! The kernel runs single-threaded inside a `LocalSet`; [`run`] and
//! [`run_paused`] bootstrap that context for tests. The rest is small
//! fixtures: observer recorders, invocation counters, and arithmetic
//! bodies the integration suites share.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use reflow_kernel::{body, one_output, Aborted, BodyFn, CellResult, Value};

/// Drive a future on a current-thread runtime inside a `LocalSet`.
pub fn run<F: Future>(fut: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build current-thread runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut)
}

/// Same, with tokio time paused: sleeps auto-advance deterministically, so
/// timing-sensitive cancellation scenarios are exact.
pub fn run_paused<F: Future>(fut: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("build paused runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut)
}

/// Records every observer notification for later assertions.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Rc<RefCell<Vec<CellResult>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&CellResult) + 'static {
        let seen = self.seen.clone();
        move |result| seen.borrow_mut().push(result.clone())
    }

    pub fn results(&self) -> Vec<CellResult> {
        self.seen.borrow().clone()
    }

    /// Only the successful values, in delivery order.
    pub fn successes(&self) -> Vec<Value> {
        self.seen
            .borrow()
            .iter()
            .filter_map(|r| r.success().cloned())
            .collect()
    }

    pub fn last(&self) -> Option<CellResult> {
        self.seen.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.seen.borrow_mut().clear();
    }
}

/// Counts body invocations; pair with [`counted`].
#[derive(Clone, Default)]
pub struct RunCounter(Rc<Cell<usize>>);

impl RunCounter {
    pub fn get(&self) -> usize {
        self.0.get()
    }
}

/// Wrap a body so every start (not completion) bumps the counter.
pub fn counted(inner: BodyFn) -> (BodyFn, RunCounter) {
    let counter = RunCounter::default();
    let shared = counter.clone();
    let wrapped: BodyFn = Rc::new(move |scope, signal| {
        shared.0.set(shared.0.get() + 1);
        inner(scope, signal)
    });
    (wrapped, counter)
}

pub fn int(value: i64) -> Value {
    Value::from(value)
}

pub fn as_int(value: &Value) -> i64 {
    value.as_i64().expect("integer value")
}

fn read_int(value: &Value, input: &str) -> anyhow::Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| anyhow!("expected integer in '{input}'"))
}

/// Body producing a constant.
pub fn const_body(output: &str, value: i64) -> BodyFn {
    let output = output.to_string();
    body(move |_scope, _signal| {
        let output = output.clone();
        async move { Ok(one_output(output, Value::from(value))) }
    })
}

/// Body computing `output = input * mul + add`.
pub fn linear_body(output: &str, input: &str, mul: i64, add: i64) -> BodyFn {
    let output = output.to_string();
    let input = input.to_string();
    body(move |scope, _signal| {
        let output = output.clone();
        let input = input.clone();
        async move {
            let value = scope.get(&input).await?;
            let n = read_int(&value, &input)?;
            Ok(one_output(output, Value::from(n * mul + add)))
        }
    })
}

/// Body summing integer inputs in the given order.
pub fn sum_body(output: &str, inputs: &[&str]) -> BodyFn {
    let output = output.to_string();
    let inputs: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
    body(move |scope, _signal| {
        let output = output.clone();
        let inputs = inputs.clone();
        async move {
            let mut total = 0;
            for input in &inputs {
                let value = scope.get(input).await?;
                total += read_int(&value, input)?;
            }
            Ok(one_output(output, Value::from(total)))
        }
    })
}

/// Body that cooperatively sleeps, then computes `output = input * mul`.
/// The sleep races the abort signal, so cancellation lands at the delay
/// boundary instead of after it.
pub fn delayed_linear_body(output: &str, input: &str, mul: i64, delay: Duration) -> BodyFn {
    let output = output.to_string();
    let input = input.to_string();
    body(move |scope, signal| {
        let output = output.clone();
        let input = input.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signal.cancelled() => return Err(Aborted.into()),
            }
            let value = scope.get(&input).await?;
            let n = read_int(&value, &input)?;
            Ok(one_output(output, Value::from(n * mul)))
        }
    })
}

/// Body that always fails with the given message.
pub fn failing_body(message: &str) -> BodyFn {
    let message = message.to_string();
    body(move |_scope, _signal| {
        let message = message.clone();
        async move { Err(anyhow!("{message}")) }
    })
}
