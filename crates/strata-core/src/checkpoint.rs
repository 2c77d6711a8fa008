//! Durable checkpoint manager for process records.
//!
//! Wraps `ProvenanceRepository` with the record-level operations the engine
//! needs: create, status transitions, context saves, and recovery scans.
//! Every write is a compare-and-set on the record revision, so a worker that
//! lost a race finds out at its next checkpoint instead of overwriting the
//! winner.

use std::sync::Arc;

use chrono::Utc;
use strata_types::context::ProcessContext;
use strata_types::error::RepositoryError;
use strata_types::node::NodeId;
use strata_types::process::{
    ErrorInfo, ProcessFilter, ProcessKind, ProcessRecord, ProcessStatus,
};

use crate::error::EngineError;
use crate::repository::ProvenanceRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists process record transitions.
///
/// Generic over `R: ProvenanceRepository` so it works with any storage
/// backend (SQLite, in-memory). The in-memory `ProcessRecord` handed to a
/// method is only updated after the write succeeded.
pub struct CheckpointManager<R: ProvenanceRepository> {
    repo: Arc<R>,
    max_context_bytes: usize,
}

impl<R: ProvenanceRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, max_context_bytes: usize) -> Self {
        Self {
            repo,
            max_context_bytes,
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist a new record.
    pub async fn create(&self, record: &ProcessRecord) -> Result<(), CheckpointError> {
        self.repo
            .insert_process(record)
            .await
            .map_err(|e| CheckpointError::from_repository(record.id, e))?;
        tracing::debug!(
            process_id = %record.id,
            kind = %record.kind,
            status = %record.status,
            "created process record"
        );
        Ok(())
    }

    /// Load the persisted record.
    pub async fn load(&self, id: NodeId) -> Result<ProcessRecord, CheckpointError> {
        self.repo
            .get_process(&id)
            .await
            .map_err(CheckpointError::Repository)?
            .ok_or(CheckpointError::ProcessNotFound(id))
    }

    /// Write `record` as-is (same status), e.g. after a step mutated the
    /// context and advanced the cursor.
    pub async fn save(&self, record: &mut ProcessRecord) -> Result<(), CheckpointError> {
        let next = record.clone();
        self.write(record, next).await
    }

    /// Move `record` to `status` and persist.
    pub async fn transition(
        &self,
        record: &mut ProcessRecord,
        status: ProcessStatus,
    ) -> Result<(), CheckpointError> {
        if !record.status.can_transition_to(status) {
            return Err(CheckpointError::InvalidTransition {
                process_id: record.id,
                from: record.status,
                to: status,
            });
        }
        let mut next = record.clone();
        next.status = status;
        self.write(record, next).await
    }

    /// Seal `record` FINISHED, or FAILED with `error`.
    pub async fn seal(
        &self,
        record: &mut ProcessRecord,
        error: Option<ErrorInfo>,
    ) -> Result<(), CheckpointError> {
        let status = if error.is_some() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Finished
        };
        if !record.status.can_transition_to(status) {
            return Err(CheckpointError::InvalidTransition {
                process_id: record.id,
                from: record.status,
                to: status,
            });
        }
        let mut next = record.clone();
        next.status = status;
        next.error = error;
        next.waiting_on = None;
        self.write(record, next).await?;
        tracing::info!(process_id = %record.id, status = %status, "process sealed");
        Ok(())
    }

    /// Replace the context and persist it in the same write as the status.
    pub async fn save_context(
        &self,
        record: &mut ProcessRecord,
        context: ProcessContext,
    ) -> Result<(), CheckpointError> {
        let mut next = record.clone();
        next.context = context;
        self.write(record, next).await
    }

    /// The context as last persisted, not as any in-memory copy holds it.
    pub async fn load_context(&self, id: NodeId) -> Result<ProcessContext, CheckpointError> {
        Ok(self.load(id).await?.context)
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Records left RUNNING, i.e. whose driver may have died.
    pub async fn list_running(&self) -> Result<Vec<ProcessRecord>, CheckpointError> {
        self.list(ProcessFilter::status(ProcessStatus::Running)).await
    }

    /// Chains suspended on futures.
    pub async fn list_waiting(&self) -> Result<Vec<ProcessRecord>, CheckpointError> {
        self.list(ProcessFilter::status(ProcessStatus::Waiting).with_kind(ProcessKind::Chain))
            .await
    }

    pub async fn list(&self, filter: ProcessFilter) -> Result<Vec<ProcessRecord>, CheckpointError> {
        self.repo
            .list_processes(&filter)
            .await
            .map_err(CheckpointError::Repository)
    }

    async fn write(
        &self,
        record: &mut ProcessRecord,
        mut next: ProcessRecord,
    ) -> Result<(), CheckpointError> {
        let size = serde_json::to_vec(&next.context)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > self.max_context_bytes {
            return Err(CheckpointError::ContextTooLarge {
                process_id: next.id,
                size,
                max: self.max_context_bytes,
            });
        }

        next.updated_at = Utc::now();
        let revision = self
            .repo
            .update_process(&next)
            .await
            .map_err(|e| CheckpointError::from_repository(next.id, e))?;
        next.revision = revision;

        tracing::debug!(
            process_id = %next.id,
            status = %next.status,
            next_step_index = next.next_step_index,
            revision,
            "checkpointed process"
        );
        *record = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(RepositoryError),

    #[error("process not found: {0}")]
    ProcessNotFound(NodeId),

    /// The stored revision moved, or the record was sealed, since it was loaded.
    #[error("process {0} was updated concurrently")]
    Conflict(NodeId),

    #[error("invalid transition for {process_id}: {from} -> {to}")]
    InvalidTransition {
        process_id: NodeId,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("context of {process_id} is {size} bytes, over the {max} byte limit")]
    ContextTooLarge {
        process_id: NodeId,
        size: usize,
        max: usize,
    },
}

impl CheckpointError {
    fn from_repository(id: NodeId, err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(_) => CheckpointError::Conflict(id),
            RepositoryError::NotFound => CheckpointError::ProcessNotFound(id),
            other => CheckpointError::Repository(other),
        }
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        let message = err.to_string();
        match err {
            CheckpointError::Repository(e) => EngineError::Persistence(e),
            CheckpointError::ProcessNotFound(id) => EngineError::ProcessNotFound(id),
            CheckpointError::Conflict(id) => EngineError::Conflict(id),
            CheckpointError::InvalidTransition { process_id, .. } => {
                EngineError::Conflict(process_id)
            }
            CheckpointError::ContextTooLarge { process_id, .. } => EngineError::StepFailed {
                process_id,
                step: String::new(),
                message,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
