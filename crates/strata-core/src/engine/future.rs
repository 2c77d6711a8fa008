use serde::{Deserialize, Serialize};
use strata_types::node::{NodeId, Outputs};
use strata_types::process::{ErrorInfo, ProcessKind, ProcessStatus};

use super::Engine;
use crate::error::EngineError;
use crate::repository::ProvenanceRepository;

/// Handle to a process's eventual outputs.
///
/// Only the id is held; every query reads the persisted record, so a future
/// stays valid across restarts and can be passed between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessFuture {
    pub process_id: NodeId,
    pub kind: ProcessKind,
}

impl ProcessFuture {
    pub fn new(process_id: NodeId, kind: ProcessKind) -> Self {
        Self { process_id, kind }
    }

    pub fn function(process_id: NodeId) -> Self {
        Self::new(process_id, ProcessKind::Function)
    }

    pub fn chain(process_id: NodeId) -> Self {
        Self::new(process_id, ProcessKind::Chain)
    }

    pub fn calculation(process_id: NodeId) -> Self {
        Self::new(process_id, ProcessKind::Calculation)
    }

    pub async fn status<R: ProvenanceRepository + 'static>(
        &self,
        engine: &Engine<R>,
    ) -> Result<ProcessStatus, EngineError> {
        Ok(engine.checkpoints().load(self.process_id).await?.status)
    }

    /// FINISHED or FAILED.
    pub async fn is_finished<R: ProvenanceRepository + 'static>(
        &self,
        engine: &Engine<R>,
    ) -> Result<bool, EngineError> {
        Ok(self.status(engine).await?.is_terminal())
    }

    /// Result set so far (complete once FINISHED).
    pub async fn outputs<R: ProvenanceRepository + 'static>(
        &self,
        engine: &Engine<R>,
    ) -> Result<Outputs, EngineError> {
        Ok(engine.graph().results(self.process_id).await?)
    }

    /// Recorded error, if the process FAILED.
    pub async fn error<R: ProvenanceRepository + 'static>(
        &self,
        engine: &Engine<R>,
    ) -> Result<Option<ErrorInfo>, EngineError> {
        Ok(engine.checkpoints().load(self.process_id).await?.error)
    }

    /// Block until terminal; see [`Engine::wait`].
    pub async fn wait<R: ProvenanceRepository + 'static>(
        &self,
        engine: &Engine<R>,
    ) -> Result<ProcessResult, EngineError> {
        engine.wait(self).await
    }
}

/// Outputs of a process that FINISHED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub process_id: NodeId,
    pub outputs: Outputs,
}
