use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::node::NodeId;

use crate::function::Arguments;

/// What a step asks the engine to run: code name plus DATA node inputs.
#[derive(Debug, Clone)]
pub struct CalculationSpec {
    pub code: String,
    pub inputs: Arguments,
    /// Backend-specific options (resources, scheduler hints).
    pub options: Value,
}

impl CalculationSpec {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            inputs: Arguments::new(),
            options: Value::Null,
        }
    }

    pub fn input(mut self, name: impl Into<String>, node: NodeId) -> Self {
        self.inputs.push(name, node);
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// What a backend receives: input values resolved from the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub process_id: NodeId,
    pub code: String,
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub options: Value,
}

/// Backend-assigned job handle, persisted on the process record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished { outputs: BTreeMap<String, Value> },
    Failed { message: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished { .. } | JobState::Failed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CalculationError {
    #[error("unknown calculation code: {0}")]
    UnknownCode(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("submission failed: {0}")]
    Submit(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A system that runs calculations out of process.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// For dynamic dispatch, see [`BoxCalculationBackend`](super::BoxCalculationBackend).
pub trait CalculationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start a job. Must not block until the job finishes.
    fn submit(
        &self,
        request: &CalculationRequest,
    ) -> impl std::future::Future<Output = Result<JobId, CalculationError>> + Send;

    /// Report the current state of a job.
    fn poll(
        &self,
        job: &JobId,
    ) -> impl std::future::Future<Output = Result<JobState, CalculationError>> + Send;
}

/// Backend for engines that only run functions and chains.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

impl CalculationBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn submit(&self, request: &CalculationRequest) -> Result<JobId, CalculationError> {
        Err(CalculationError::UnknownCode(request.code.clone()))
    }

    async fn poll(&self, job: &JobId) -> Result<JobState, CalculationError> {
        Err(CalculationError::JobNotFound(job.0.clone()))
    }
}
