//! The chain engine: launches functions, chains, and calculations, drives
//! chains step by step, and resumes them when their futures resolve.
//!
//! # Execution flow
//!
//! 1. `run` / `submit` create a CHAIN_PROCESS node and a CREATED record,
//!    link the inputs, and validate them.
//! 2. The first scheduling step moves the record to RUNNING and drives the
//!    outline from `next_step_index`.
//! 3. Each step gets a context rebuilt from the persisted record; after it
//!    returns, the context and cursor are checkpointed (compare-and-set).
//! 4. `WaitFor` checkpoints the pending futures and parks the chain in
//!    WAITING. `resume` (called by `run`'s polling loop or by the daemon)
//!    resolves the futures in place and continues with the next step.
//! 5. The outline running out, or `Done`, seals FINISHED; an unrecovered
//!    step error seals FAILED.

mod driver;
mod future;
mod poll;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use strata_types::config::EngineConfig;
use strata_types::event::ProcessEvent;
use strata_types::node::{EdgeKind, NodeId, NodeKind};
use strata_types::process::{
    ErrorInfo, ErrorKind, ProcessKind, ProcessRecord, ProcessStatus,
};

use crate::calculation::{
    BoxCalculationBackend, CalculationBackend, CalculationRequest, CalculationSpec,
    DisabledBackend,
};
use crate::chain::{ChainRegistry, WorkChain};
use crate::checkpoint::CheckpointManager;
use crate::error::EngineError;
use crate::event::EventBus;
use crate::function::{Arguments, Invocation, WorkFunction, invoke_function, link_inputs};
use crate::provenance::ProvenanceGraph;
use crate::repository::ProvenanceRepository;

pub use future::{ProcessFuture, ProcessResult};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs and resumes processes against one provenance store.
///
/// Holds no per-process state in memory: everything a later `resume` needs
/// is in the store, so any engine over the same store (with the same chains
/// registered) can pick up where another left off.
pub struct Engine<R: ProvenanceRepository + 'static> {
    graph: ProvenanceGraph<R>,
    checkpoints: CheckpointManager<R>,
    chains: ChainRegistry<R>,
    backend: BoxCalculationBackend,
    events: EventBus,
    config: EngineConfig,
}

impl<R: ProvenanceRepository + 'static> Engine<R> {
    /// An engine with no calculation backend.
    pub fn new(repo: R, config: EngineConfig) -> Self {
        Self::from_shared(Arc::new(repo), config)
    }

    /// An engine over a store that other engines (or a CLI) also hold.
    pub fn from_shared(repo: Arc<R>, config: EngineConfig) -> Self {
        Self {
            graph: ProvenanceGraph::from_shared(Arc::clone(&repo)),
            checkpoints: CheckpointManager::new(repo, config.max_context_bytes),
            chains: ChainRegistry::new(),
            backend: BoxCalculationBackend::new(DisabledBackend),
            events: EventBus::default(),
            config,
        }
    }

    pub fn with_backend<B: CalculationBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = BoxCalculationBackend::new(backend);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Register a chain so it can be started and resumed by name.
    pub fn register<C: WorkChain>(&self, chain: C) -> Result<(), EngineError> {
        self.chains.register(chain)
    }

    pub fn graph(&self) -> &ProvenanceGraph<R> {
        &self.graph
    }

    pub fn checkpoints(&self) -> &CheckpointManager<R> {
        &self.checkpoints
    }

    pub fn chains(&self) -> &ChainRegistry<R> {
        &self.chains
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Run a function to completion and return its outputs, or the error it
    /// was sealed with.
    pub async fn run_function<F: WorkFunction>(
        &self,
        function: &F,
        args: &Arguments,
    ) -> Result<ProcessResult, EngineError> {
        self.invoke_as(None, function, args).await?.into_result()
    }

    /// Run a function and return a future for it; a body error stays on the
    /// record instead of being returned.
    pub async fn submit_function<F: WorkFunction>(
        &self,
        function: &F,
        args: &Arguments,
    ) -> Result<ProcessFuture, EngineError> {
        let invocation = self.invoke_as(None, function, args).await?;
        Ok(ProcessFuture::function(invocation.process_id))
    }

    pub(crate) async fn invoke_as<F: WorkFunction>(
        &self,
        caller: Option<NodeId>,
        function: &F,
        args: &Arguments,
    ) -> Result<Invocation, EngineError> {
        invoke_function(
            &self.graph,
            &self.checkpoints,
            &self.events,
            caller,
            function,
            args,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Chains
    // -----------------------------------------------------------------------

    /// Run a registered chain on the calling task, polling through every
    /// suspension, and return its outputs. A chain that ends FAILED comes
    /// back as `EngineError::Failed`.
    pub async fn run(&self, name: &str, inputs: Arguments) -> Result<ProcessResult, EngineError> {
        let process_id = self.start_chain(name, &inputs, None).await?;
        self.resume(process_id).await?;
        self.wait(&ProcessFuture::chain(process_id)).await
    }

    /// Start a registered chain, drive it to its first suspension (or to
    /// the end), and hand it to the scheduler.
    pub async fn submit(&self, name: &str, inputs: Arguments) -> Result<ProcessFuture, EngineError> {
        self.submit_as(None, name, inputs).await
    }

    pub(crate) async fn submit_as(
        &self,
        caller: Option<NodeId>,
        name: &str,
        inputs: Arguments,
    ) -> Result<ProcessFuture, EngineError> {
        let process_id = self.start_chain(name, &inputs, caller).await?;
        if let Err(err) = self.resume(process_id).await {
            if !err.is_transient() {
                return Err(err);
            }
            tracing::warn!(
                process_id = %process_id,
                error = %err,
                "first scheduling step did not complete, leaving it to the scheduler"
            );
        }
        self.events.publish(ProcessEvent::Submitted { process_id });
        Ok(ProcessFuture::chain(process_id))
    }

    /// Block until `future` is terminal, polling with exponential backoff.
    ///
    /// Each poll advances whatever the future depends on (calculations,
    /// waiting sub-chains), so `wait` makes progress without a daemon.
    pub async fn wait(&self, future: &ProcessFuture) -> Result<ProcessResult, EngineError> {
        let mut delay = self.config.poll_interval();
        let mut last = None;
        loop {
            let status = self.poll(future.process_id).await?;
            if status.is_terminal() {
                return self.result(future.process_id).await;
            }
            if last != Some(status) {
                delay = self.config.poll_interval();
                last = Some(status);
            }
            tokio::time::sleep(delay).await;
            delay = self.config.next_poll_interval(delay);
        }
    }

    /// Outputs of a FINISHED process, or the error of a FAILED one.
    pub async fn result(&self, process_id: NodeId) -> Result<ProcessResult, EngineError> {
        let record = self.checkpoints.load(process_id).await?;
        match record.status {
            ProcessStatus::Finished => Ok(ProcessResult {
                process_id,
                outputs: self.graph.results(process_id).await?,
            }),
            ProcessStatus::Failed => Err(EngineError::Failed {
                process_id,
                error: record
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(ErrorKind::StepFailed, "no error recorded")),
            }),
            status => Err(EngineError::Validation(format!(
                "process {process_id} is {status}, not terminal"
            ))),
        }
    }

    /// Create a CREATED chain record with its CALL and INPUT edges.
    ///
    /// Malformed inputs seal the record FAILED right away; the id is still
    /// returned so the failure is visible through its future.
    pub(crate) async fn start_chain(
        &self,
        name: &str,
        inputs: &Arguments,
        caller: Option<NodeId>,
    ) -> Result<NodeId, EngineError> {
        let chain = self.chains.get(name)?;
        let process_id = self
            .graph
            .create_node(NodeKind::ChainProcess, name, Value::Null)
            .await?;
        let mut record = ProcessRecord::new(process_id, ProcessKind::Chain, name);
        self.checkpoints.create(&record).await?;
        if let Some(caller) = caller {
            self.graph
                .create_edge(caller, process_id, EdgeKind::Call, name)
                .await?;
        }
        self.events.publish(ProcessEvent::Created {
            process_id,
            kind: ProcessKind::Chain,
            label: name.to_string(),
            caller,
        });
        tracing::info!(process_id = %process_id, chain = name, "chain created");

        let checked = match link_inputs(&self.graph, process_id, inputs).await {
            Ok(()) => chain.validate(inputs).map_err(EngineError::Validation),
            Err(err) => Err(err),
        };
        if let Err(err) = checked {
            if err.is_transient() {
                return Err(err);
            }
            self.seal_failed(&mut record, err.error_info()).await?;
        }
        Ok(process_id)
    }

    // -----------------------------------------------------------------------
    // Calculations
    // -----------------------------------------------------------------------

    /// Record a CALCULATION_PROCESS and hand it to the backend.
    ///
    /// A rejected submission seals the record FAILED with
    /// `ExternalExecution`; the future is returned either way.
    pub async fn submit_calculation(
        &self,
        spec: CalculationSpec,
    ) -> Result<ProcessFuture, EngineError> {
        self.start_calculation(spec, None).await
    }

    pub(crate) async fn start_calculation(
        &self,
        spec: CalculationSpec,
        caller: Option<NodeId>,
    ) -> Result<ProcessFuture, EngineError> {
        let process_id = self
            .graph
            .create_node(NodeKind::CalculationProcess, &spec.code, spec.options.clone())
            .await?;
        let mut record = ProcessRecord::new(process_id, ProcessKind::Calculation, &spec.code);
        self.checkpoints.create(&record).await?;
        if let Some(caller) = caller {
            self.graph
                .create_edge(caller, process_id, EdgeKind::Call, &spec.code)
                .await?;
        }
        self.events.publish(ProcessEvent::Created {
            process_id,
            kind: ProcessKind::Calculation,
            label: spec.code.clone(),
            caller,
        });
        let future = ProcessFuture::calculation(process_id);

        if let Err(err) = link_inputs(&self.graph, process_id, &spec.inputs).await {
            if err.is_transient() {
                return Err(err);
            }
            self.seal_failed(&mut record, err.error_info()).await?;
            return Ok(future);
        }

        let mut inputs = BTreeMap::new();
        for (name, node_id) in spec.inputs.iter() {
            inputs.insert(name.to_string(), self.graph.value(node_id).await?);
        }
        let request = CalculationRequest {
            process_id,
            code: spec.code.clone(),
            inputs,
            options: spec.options,
        };

        match self.backend.submit(&request).await {
            Ok(job) => {
                record.job_id = Some(job.0.clone());
                self.checkpoints
                    .transition(&mut record, ProcessStatus::Running)
                    .await?;
                tracing::info!(
                    process_id = %process_id,
                    code = %spec.code,
                    job_id = %job,
                    backend = self.backend.name(),
                    "calculation submitted"
                );
            }
            Err(err) => {
                let info = ErrorInfo::new(ErrorKind::ExternalExecution, err.to_string());
                self.seal_failed(&mut record, info).await?;
            }
        }
        Ok(future)
    }

    // -----------------------------------------------------------------------
    // Sealing helpers
    // -----------------------------------------------------------------------

    pub(crate) async fn seal_failed(
        &self,
        record: &mut ProcessRecord,
        error: ErrorInfo,
    ) -> Result<ProcessStatus, EngineError> {
        tracing::warn!(
            process_id = %record.id,
            kind = %record.kind,
            error = %error,
            "process failed"
        );
        self.checkpoints.seal(record, Some(error)).await?;
        self.events.publish(ProcessEvent::Sealed {
            process_id: record.id,
            status: ProcessStatus::Failed,
        });
        Ok(ProcessStatus::Failed)
    }

    pub(crate) async fn seal_finished(
        &self,
        record: &mut ProcessRecord,
    ) -> Result<ProcessStatus, EngineError> {
        self.checkpoints.seal(record, None).await?;
        self.events.publish(ProcessEvent::Sealed {
            process_id: record.id,
            status: ProcessStatus::Finished,
        });
        Ok(ProcessStatus::Finished)
    }
}
