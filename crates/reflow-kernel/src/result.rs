//! Cell results and the error taxonomy carried through the graph.
//!
//! Four orthogonal failure kinds flow through the kernel:
//! body errors become [`CellResult::Error`] data, cancellation is the
//! [`Aborted`] sentinel (swallowed, never stored), structural trouble is
//! [`CellResult::Fatal`] with a [`StructuralError`], and operational misuse
//! is `KernelError` on the facade.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// User value type. Deep structural equality is `PartialEq` on the JSON tree.
pub type Value = serde_json::Value;

/// Opaque variable identifier, globally unique per kernel.
pub type VariableId = String;
/// Opaque computation identifier, globally unique per kernel.
pub type ComputationId = String;

/// The tagged outcome stored in every cell.
#[derive(Debug, Clone)]
pub enum CellResult {
    Success(Value),
    Error(ExecError),
    Fatal(StructuralError),
    Uninitialized,
}

impl CellResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CellResult::Success(_))
    }

    pub fn success(&self) -> Option<&Value> {
        match self {
            CellResult::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CellResult::Fatal(_))
    }
}

impl PartialEq for CellResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellResult::Success(a), CellResult::Success(b)) => a == b,
            (CellResult::Error(a), CellResult::Error(b)) => Arc::ptr_eq(&a.0, &b.0),
            (CellResult::Fatal(a), CellResult::Fatal(b)) => a == b,
            (CellResult::Uninitialized, CellResult::Uninitialized) => true,
            _ => false,
        }
    }
}

/// A body failure, cloneable so one failure fans out to every output and
/// observer of the failing computation.
#[derive(Clone)]
pub struct ExecError(Arc<anyhow::Error>);

impl ExecError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Rethrow as a fresh `anyhow::Error` (used by the scope proxy so
    /// downstream bodies can `?` or catch it).
    pub fn to_anyhow(&self) -> anyhow::Error {
        anyhow::Error::new(self.clone())
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecError({:#})", self.0)
    }
}

impl std::error::Error for ExecError {}

/// Why a definition was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructuralReason {
    MissingInput,
    CircularDependency,
    InvalidDefinition,
    DuplicateOutput,
}

/// Details of an ill-formed definition, carried by [`CellResult::Fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuralError {
    pub reason: StructuralReason,
    /// The offending computation.
    pub computation: ComputationId,
    /// Inputs not (or no longer) available as healthy variables.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_inputs: Vec<VariableId>,
    /// Producer-to-consumer path closing the cycle, when cyclic.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycle: Vec<ComputationId>,
    /// The earlier-defined owner of a contested output, when duplicated.
    /// `None` together with reason `DuplicateOutput` means a source
    /// variable owns the name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts_with: Option<ComputationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StructuralError {
    pub fn missing(computation: impl Into<ComputationId>, missing: Vec<VariableId>) -> Self {
        Self {
            reason: StructuralReason::MissingInput,
            computation: computation.into(),
            missing_inputs: missing,
            cycle: Vec::new(),
            conflicts_with: None,
            detail: None,
        }
    }

    pub fn cyclic(computation: impl Into<ComputationId>, cycle: Vec<ComputationId>) -> Self {
        Self {
            reason: StructuralReason::CircularDependency,
            computation: computation.into(),
            missing_inputs: Vec::new(),
            cycle,
            conflicts_with: None,
            detail: None,
        }
    }

    pub fn duplicate(
        computation: impl Into<ComputationId>,
        owner: Option<ComputationId>,
    ) -> Self {
        Self {
            reason: StructuralReason::DuplicateOutput,
            computation: computation.into(),
            missing_inputs: Vec::new(),
            cycle: Vec::new(),
            conflicts_with: owner,
            detail: None,
        }
    }

    pub fn invalid(computation: impl Into<ComputationId>, detail: impl Into<String>) -> Self {
        Self {
            reason: StructuralReason::InvalidDefinition,
            computation: computation.into(),
            missing_inputs: Vec::new(),
            cycle: Vec::new(),
            conflicts_with: None,
            detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            StructuralReason::MissingInput => write!(
                f,
                "computation '{}' is missing inputs [{}]",
                self.computation,
                self.missing_inputs.join(", ")
            ),
            StructuralReason::CircularDependency => write!(
                f,
                "computation '{}' is part of a dependency cycle [{}]",
                self.computation,
                self.cycle.join(" -> ")
            ),
            StructuralReason::DuplicateOutput => match &self.conflicts_with {
                Some(owner) => write!(
                    f,
                    "computation '{}' declares an output already owned by '{owner}'",
                    self.computation
                ),
                None => write!(
                    f,
                    "computation '{}' declares an output already owned by a source",
                    self.computation
                ),
            },
            StructuralReason::InvalidDefinition => write!(
                f,
                "computation '{}' has an invalid definition: {}",
                self.computation,
                self.detail.as_deref().unwrap_or("unspecified")
            ),
        }
    }
}

/// Cancellation sentinel. Bodies and the scope proxy raise it through the
/// `anyhow` channel; the kernel swallows it and reschedules. It is never a
/// user-visible `Error` result.
#[derive(Debug, Clone, Copy, Error)]
#[error("aborted")]
pub struct Aborted;

/// Raised into the failing body when it touches a variable outside its
/// declared inputs.
#[derive(Debug, Clone, Error)]
#[error("computation '{computation}' accessed '{variable}' outside its declared inputs")]
pub struct InvalidDynamicAccess {
    pub computation: ComputationId,
    pub variable: VariableId,
}

/// `get_value` rendition of a `Fatal` result.
#[derive(Debug, Clone, Error)]
#[error("variable '{id}' is structurally broken: {error}")]
pub struct FatalAccess {
    pub id: VariableId,
    pub error: StructuralError,
}

/// `get_value` rendition of an `Uninitialized` result.
#[derive(Debug, Clone, Error)]
#[error("variable '{id}' is uninitialized")]
pub struct UninitializedAccess {
    pub id: VariableId,
}
