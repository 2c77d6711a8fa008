//! Engine error taxonomy.
//!
//! `EngineError` is what engine entry points return. `FunctionError` and
//! `StepError` are what user-written function bodies and step handlers
//! return; both convert from `EngineError` so nested engine calls compose
//! with `?`.

use strata_types::error::RepositoryError;
use strata_types::node::NodeId;
use strata_types::process::{ErrorInfo, ErrorKind};

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed inputs; the process is sealed FAILED and never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The external calculation failed.
    #[error("calculation {process_id} failed: {message}")]
    ExternalExecution { process_id: NodeId, message: String },

    /// A graph or record write failed; the record keeps its pre-write state.
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("output '{label}' already emitted by {process_id}")]
    DuplicateOutput { process_id: NodeId, label: String },

    #[error("step '{step}' of {process_id} failed: {message}")]
    StepFailed {
        process_id: NodeId,
        step: String,
        message: String,
    },

    #[error("unknown chain: {0}")]
    UnknownChain(String),

    #[error("chain '{chain}' has no step '{step}'")]
    UnknownStep { chain: String, step: String },

    #[error("process not found: {0}")]
    ProcessNotFound(NodeId),

    /// Lost a compare-and-set race on the process record.
    #[error("process {0} was updated concurrently")]
    Conflict(NodeId),

    /// A process this call depends on reached FAILED.
    #[error("process {process_id} failed: {error}")]
    Failed { process_id: NodeId, error: ErrorInfo },
}

impl EngineError {
    /// Whether the error leaves the process untouched and retryable.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Conflict(_))
    }

    /// The record-level error a process is sealed with for this failure.
    pub fn error_info(&self) -> ErrorInfo {
        let kind = match self {
            EngineError::Validation(_)
            | EngineError::UnknownChain(_)
            | EngineError::UnknownStep { .. } => ErrorKind::Validation,
            EngineError::ExternalExecution { .. } => ErrorKind::ExternalExecution,
            EngineError::Persistence(_) | EngineError::Conflict(_) => ErrorKind::Persistence,
            EngineError::DuplicateOutput { .. } => ErrorKind::DuplicateOutput,
            EngineError::StepFailed { .. }
            | EngineError::ProcessNotFound(_)
            | EngineError::Failed { .. } => ErrorKind::StepFailed,
        };
        ErrorInfo::new(kind, self.to_string())
    }
}

/// Error returned by a function body.
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("{0}")]
    Failed(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl FunctionError {
    pub fn failed(message: impl Into<String>) -> Self {
        FunctionError::Failed(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FunctionError::Engine(e) if e.is_transient())
    }

    pub fn error_info(&self) -> ErrorInfo {
        match self {
            FunctionError::Validation(_) => ErrorInfo::new(ErrorKind::Validation, self.to_string()),
            FunctionError::Engine(e) => e.error_info(),
            FunctionError::Failed(_) | FunctionError::Serde(_) => {
                ErrorInfo::new(ErrorKind::StepFailed, self.to_string())
            }
        }
    }
}

/// Error returned by a chain step handler.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    Failed(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Engine(e) if e.is_transient())
    }

    pub fn error_info(&self) -> ErrorInfo {
        match self {
            StepError::Validation(_) => ErrorInfo::new(ErrorKind::Validation, self.to_string()),
            StepError::Engine(e) => e.error_info(),
            StepError::Failed(_) | StepError::Serde(_) => {
                ErrorInfo::new(ErrorKind::StepFailed, self.to_string())
            }
        }
    }
}
