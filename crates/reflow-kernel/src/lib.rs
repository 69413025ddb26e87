//! Glitch-free push-pull reactive computation kernel.
//!
//! The kernel maintains a dynamic DAG of *source* and *computed* cells,
//! schedules asynchronous recomputation in response to source mutations and
//! observer activity, and guarantees each observer sees only
//! temporally-consistent results: over any diamond, one source perturbation
//! produces exactly one downstream recomputation, after every branch has
//! committed.
//!
//! Highlights:
//! - push-based dirty/cause propagation, pull-based (observer-driven)
//!   execution; unobserved work never runs
//! - cooperative cancellation: superseded in-flight bodies are aborted and
//!   rescheduled, never committed
//! - input/output pruning keeps recomputation minimal
//! - ill-formed definitions (missing inputs, duplicate outputs, cycles) are
//!   quarantined with `Fatal` results and auto-recover as the graph heals
//!
//! All operations run single-threaded on a current-thread tokio runtime
//! inside a `LocalSet`; bodies are plain async closures reading their
//! inputs through a [`Scope`].

pub mod clock;
pub mod error;
pub mod exec;
pub mod graph;
mod invariants;
pub mod kernel;
mod lifecycle;
pub mod problem;
mod propagate;
pub mod result;
pub mod signal;
pub mod state;

pub use clock::Tick;
pub use error::KernelError;
pub use exec::{body, one_output, BodyFn, BodyFuture, BodyOutputs, Scope};
pub use kernel::{
    AbortStrategy, ComputationSnapshot, ComputationSpec, ComputationStatus, DefineOptions,
    GraphHealth, Kernel, KernelConfig, LogLevel, NodeHealth, PeekView, ProblemVariableInfo,
    RemovalStatus, SourceSpec, SourceStatus, Subscription,
};
pub use problem::ProblemTrace;
pub use result::{
    Aborted, CellResult, ComputationId, ExecError, FatalAccess, InvalidDynamicAccess,
    StructuralError, StructuralReason, UninitializedAccess, Value, VariableId,
};
pub use signal::AbortSignal;
pub use state::CompState;
