use thiserror::Error;

/// Operational errors surfaced by the facade.
///
/// Structural problems (missing inputs, cycles, duplicate outputs) are never
/// errors: they are reported through define/removal statuses and quarantine.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("variable '{0}' not found")]
    UnknownVariable(String),
    #[error("computation '{0}' not found")]
    UnknownComputation(String),
    #[error("'{0}' is not a source variable")]
    NotASource(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
