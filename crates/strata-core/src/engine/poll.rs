//! Polling, calculation completion, and crash recovery.

use futures_util::future::BoxFuture;
use strata_types::node::NodeId;
use strata_types::process::{
    ErrorInfo, ErrorKind, ProcessFilter, ProcessKind, ProcessRecord, ProcessStatus,
};

use super::Engine;
use crate::calculation::{CalculationError, JobId, JobState};
use crate::error::EngineError;
use crate::function::{ReturnValue, attach_result};
use crate::repository::ProvenanceRepository;

impl<R: ProvenanceRepository + 'static> Engine<R> {
    /// Advance `process_id` as far as it can go right now.
    ///
    /// Calculations are checked with the backend; a waiting chain first
    /// polls everything it waits on, then tries to resume. Losing a race to
    /// another worker is not an error: the current status is returned.
    pub fn poll(&self, process_id: NodeId) -> BoxFuture<'_, Result<ProcessStatus, EngineError>> {
        Box::pin(async move {
            let record = self.checkpoints.load(process_id).await?;
            if record.is_sealed() {
                return Ok(record.status);
            }

            let outcome = match (record.kind, record.status) {
                (ProcessKind::Calculation, _) => self.poll_calculation(record).await,
                (ProcessKind::Chain, ProcessStatus::Waiting) => {
                    for target in record.pending_processes() {
                        self.poll(target).await?;
                    }
                    self.resume(process_id).await
                }
                (ProcessKind::Chain, ProcessStatus::Created) => self.resume(process_id).await,
                (_, status) => Ok(status),
            };

            match outcome {
                Err(EngineError::Conflict(id)) => self.current_status(id).await,
                other => other,
            }
        })
    }

    async fn poll_calculation(&self, record: ProcessRecord) -> Result<ProcessStatus, EngineError> {
        let Some(job_id) = record.job_id.clone().map(JobId) else {
            return Ok(record.status);
        };

        let state = match self.backend.poll(&job_id).await {
            Ok(state) => state,
            Err(CalculationError::JobNotFound(job)) => JobState::Failed {
                message: format!("backend lost job {job}"),
            },
            Err(err) => {
                tracing::warn!(
                    process_id = %record.id,
                    job_id = %job_id,
                    error = %err,
                    "calculation poll failed"
                );
                return Ok(record.status);
            }
        };

        match state {
            JobState::Queued | JobState::Running => Ok(record.status),
            JobState::Failed { message } => {
                let mut record = record;
                self.seal_failed(&mut record, ErrorInfo::new(ErrorKind::ExternalExecution, message))
                    .await
            }
            JobState::Finished { outputs } => {
                // Claim first so only one poller materializes the outputs.
                let mut claimed = record;
                self.checkpoints.save(&mut claimed).await?;

                let existing = self.graph.results(claimed.id).await?;
                for (label, value) in outputs {
                    if existing.contains(&label) {
                        continue;
                    }
                    attach_result(&self.graph, claimed.id, &label, ReturnValue::Value(value))
                        .await?;
                }
                tracing::info!(process_id = %claimed.id, job_id = %job_id, "calculation finished");
                self.seal_finished(&mut claimed).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler support
    // -----------------------------------------------------------------------

    /// Waiting chains whose current suspension includes `process_id`.
    pub async fn waiters_of(&self, process_id: NodeId) -> Result<Vec<NodeId>, EngineError> {
        Ok(self
            .checkpoints
            .list_waiting()
            .await?
            .into_iter()
            .filter(|r| r.pending_processes().contains(&process_id))
            .map(|r| r.id)
            .collect())
    }

    /// Processes a scheduler should keep polling: running calculations,
    /// waiting chains, and chains not started yet.
    pub async fn unfinished(&self) -> Result<Vec<NodeId>, EngineError> {
        let mut ids = Vec::new();
        let running = ProcessFilter::status(ProcessStatus::Running).with_kind(ProcessKind::Calculation);
        let created = ProcessFilter::status(ProcessStatus::Created).with_kind(ProcessKind::Chain);
        ids.extend(self.checkpoints.list(running).await?.into_iter().map(|r| r.id));
        ids.extend(self.checkpoints.list_waiting().await?.into_iter().map(|r| r.id));
        ids.extend(self.checkpoints.list(created).await?.into_iter().map(|r| r.id));
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Pick up processes whose worker died. Call once at startup, before
    /// any other engine on the same store starts driving.
    ///
    /// RUNNING chains re-run the step at their persisted cursor with the
    /// persisted context. RUNNING functions cannot resume and are sealed
    /// FAILED (`Interrupted`), as are calculations that never reached the
    /// backend. Returns the chains that were re-driven.
    pub async fn recover(&self) -> Result<Vec<NodeId>, EngineError> {
        let mut recovered = Vec::new();

        for record in self.checkpoints.list_running().await? {
            match record.kind {
                ProcessKind::Chain => {
                    let chain = match self.chains.get(&record.label) {
                        Ok(chain) => chain,
                        Err(err) => {
                            tracing::warn!(
                                process_id = %record.id,
                                error = %err,
                                "cannot recover chain that is not registered"
                            );
                            continue;
                        }
                    };
                    let id = record.id;
                    tracing::info!(
                        process_id = %id,
                        next_step_index = record.next_step_index,
                        "recovering chain"
                    );
                    match self.drive(chain, record, true).await {
                        Ok(_) => recovered.push(id),
                        Err(err) => {
                            tracing::warn!(process_id = %id, error = %err, "chain recovery failed")
                        }
                    }
                }
                ProcessKind::Function => {
                    let mut record = record;
                    self.interrupt(&mut record).await?;
                }
                ProcessKind::Calculation if record.job_id.is_none() => {
                    let mut record = record;
                    self.interrupt(&mut record).await?;
                }
                ProcessKind::Calculation => {}
            }
        }

        let orphaned = ProcessFilter::status(ProcessStatus::Created).with_kind(ProcessKind::Calculation);
        for mut record in self.checkpoints.list(orphaned).await? {
            self.interrupt(&mut record).await?;
        }

        Ok(recovered)
    }

    async fn interrupt(&self, record: &mut ProcessRecord) -> Result<(), EngineError> {
        let error = ErrorInfo::new(
            ErrorKind::Interrupted,
            format!("worker stopped while {} '{}' was running", record.kind, record.label),
        );
        match self.seal_failed(record, error).await {
            Ok(_) | Err(EngineError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
