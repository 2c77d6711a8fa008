//! Process records: the execution bookkeeping attached to PROCESS nodes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::node::{NodeId, NodeKind};

// ---------------------------------------------------------------------------
// Kind and status
// ---------------------------------------------------------------------------

/// Which kind of callable a process record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Function,
    Chain,
    Calculation,
}

impl ProcessKind {
    pub fn node_kind(&self) -> NodeKind {
        match self {
            ProcessKind::Function => NodeKind::FunctionProcess,
            ProcessKind::Chain => NodeKind::ChainProcess,
            ProcessKind::Calculation => NodeKind::CalculationProcess,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Function => "function",
            ProcessKind::Chain => "chain",
            ProcessKind::Calculation => "calculation",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" => Ok(ProcessKind::Function),
            "chain" => Ok(ProcessKind::Chain),
            "calculation" => Ok(ProcessKind::Calculation),
            other => Err(format!("invalid process kind: '{other}'")),
        }
    }
}

/// Lifecycle of a process: CREATED -> RUNNING -> WAITING -> FINISHED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Created,
    Running,
    Waiting,
    Finished,
    Failed,
}

impl ProcessStatus {
    /// FINISHED and FAILED are terminal; a record in either is sealed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Finished | ProcessStatus::Failed)
    }

    /// Whether the engine may move a record from `self` to `next`.
    pub fn can_transition_to(&self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, next) {
            (Created, Running) | (Created, Failed) => true,
            (Running, Running) | (Running, Waiting) | (Running, Finished) | (Running, Failed) => {
                true
            }
            (Waiting, Running) | (Waiting, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Created => "created",
            ProcessStatus::Running => "running",
            ProcessStatus::Waiting => "waiting",
            ProcessStatus::Finished => "finished",
            ProcessStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(ProcessStatus::Created),
            "running" => Ok(ProcessStatus::Running),
            "waiting" => Ok(ProcessStatus::Waiting),
            "finished" => Ok(ProcessStatus::Finished),
            "failed" => Ok(ProcessStatus::Failed),
            other => Err(format!("invalid process status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors recorded on failed processes
// ---------------------------------------------------------------------------

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed inputs; never retried.
    Validation,
    /// The external calculation failed.
    ExternalExecution,
    /// A graph or context write failed.
    Persistence,
    /// An output label was emitted twice.
    DuplicateOutput,
    /// A step or function body returned an error.
    StepFailed,
    /// The process was running when its worker died and cannot be resumed.
    Interrupted,
}

/// Error payload stored on a FAILED process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Suspension state
// ---------------------------------------------------------------------------

/// What a chain does when one of the futures it waits on fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the chain with the sub-process error.
    #[default]
    FailFast,
    /// Resolve the entry to `ContextValue::Failed` and let the next step decide.
    Tolerate,
}

/// The futures registered at the chain's current suspension point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitState {
    /// Context names registered by the most recent `WaitFor`.
    pub names: Vec<String>,
    #[serde(default)]
    pub policy: FailurePolicy,
}

// ---------------------------------------------------------------------------
// Process record
// ---------------------------------------------------------------------------

/// Execution metadata for one process node.
///
/// Mutable only while non-terminal. Every persisted update bumps `revision`,
/// which the repository uses for compare-and-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Same id as the PROCESS node.
    pub id: NodeId,
    pub kind: ProcessKind,
    /// Name of the function, chain, or calculation code.
    pub label: String,
    pub status: ProcessStatus,
    /// Chain context; empty for functions and calculations.
    #[serde(default)]
    pub context: ProcessContext,
    /// Cursor into the chain outline.
    #[serde(default)]
    pub next_step_index: usize,
    /// Futures registered at the current suspension, if WAITING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitState>,
    /// Backend job id for calculations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// A fresh CREATED record for the process node `id`.
    pub fn new(id: NodeId, kind: ProcessKind, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            label: label.into(),
            status: ProcessStatus::Created,
            context: ProcessContext::new(),
            next_step_index: 0,
            waiting_on: None,
            job_id: None,
            error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Process ids this record is currently waiting on.
    pub fn pending_processes(&self) -> Vec<NodeId> {
        self.context
            .values()
            .filter_map(|entry| entry.pending_process())
            .collect()
    }
}

/// Filter for listing process records.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub status: Option<ProcessStatus>,
    pub kind: Option<ProcessKind>,
    pub limit: Option<u32>,
}

impl ProcessFilter {
    pub fn status(status: ProcessStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: ProcessKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        self.status.is_none_or(|s| s == record.status) && self.kind.is_none_or(|k| k == record.kind)
    }
}
