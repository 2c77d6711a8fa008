//! The view a step handler gets of its chain.
//!
//! A `StepContext` is rebuilt from the persisted record before every step:
//! inputs come from the chain's INPUT edges, the context from the last
//! checkpoint. Mutations are written back by the engine after the handler
//! returns; graph writes (emit, nested calls) happen immediately.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strata_types::context::{ContextEntry, ContextValue, ProcessContext};
use strata_types::node::{NodeId, Outputs};
use strata_types::process::ErrorInfo;

use crate::calculation::CalculationSpec;
use crate::engine::{Engine, ProcessFuture, ProcessResult};
use crate::error::{EngineError, StepError};
use crate::function::{Arguments, ReturnValue, WorkFunction, attach_result};
use crate::repository::ProvenanceRepository;

pub struct StepContext<'a, R: ProvenanceRepository + 'static> {
    engine: &'a Engine<R>,
    process_id: NodeId,
    step: String,
    index: usize,
    inputs: Arguments,
    context: ProcessContext,
    replay: bool,
}

impl<'a, R: ProvenanceRepository + 'static> StepContext<'a, R> {
    pub(crate) fn new(
        engine: &'a Engine<R>,
        process_id: NodeId,
        step: String,
        index: usize,
        inputs: Arguments,
        context: ProcessContext,
        replay: bool,
    ) -> Self {
        Self {
            engine,
            process_id,
            step,
            index,
            inputs,
            context,
            replay,
        }
    }

    pub(crate) fn into_context(self) -> ProcessContext {
        self.context
    }

    /// The CHAIN_PROCESS node this step belongs to.
    pub fn process_id(&self) -> NodeId {
        self.process_id
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// True when this step may already have run once before a crash.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    pub fn inputs(&self) -> &Arguments {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Result<NodeId, StepError> {
        self.inputs
            .get(name)
            .ok_or_else(|| StepError::Validation(format!("missing input '{name}'")))
    }

    /// Payload of the named input.
    pub async fn input_value(&self, name: &str) -> Result<Value, StepError> {
        let id = self.input(name)?;
        self.value(id).await
    }

    /// Payload of any DATA node.
    pub async fn value(&self, id: NodeId) -> Result<Value, StepError> {
        Ok(self
            .engine
            .graph()
            .value(id)
            .await
            .map_err(EngineError::from)?)
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    pub fn get(&self, name: &str) -> Option<&ContextEntry> {
        self.context.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.context.contains_key(name)
    }

    /// Store a plain value under `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Serialize) -> Result<(), StepError> {
        let value = serde_json::to_value(value)?;
        self.context.insert(
            name.into(),
            ContextEntry::Resolved {
                value: ContextValue::Json { value },
            },
        );
        Ok(())
    }

    /// Store a reference to a DATA node under `name`.
    pub fn set_node(&mut self, name: impl Into<String>, id: NodeId) {
        self.context.insert(
            name.into(),
            ContextEntry::Resolved {
                value: ContextValue::Node { id },
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<ContextEntry> {
        self.context.remove(name)
    }

    fn resolved(&self, name: &str) -> Result<&ContextValue, StepError> {
        match self.context.get(name) {
            Some(ContextEntry::Resolved { value }) => Ok(value),
            Some(ContextEntry::Pending { process_id }) => Err(StepError::failed(format!(
                "context entry '{name}' is still pending on {process_id}"
            ))),
            None => Err(StepError::failed(format!("no context entry '{name}'"))),
        }
    }

    /// Plain value stored with `set`, deserialized.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, StepError> {
        match self.resolved(name)? {
            ContextValue::Json { value } => Ok(serde_json::from_value(value.clone())?),
            _ => Err(StepError::failed(format!(
                "context entry '{name}' is not a plain value"
            ))),
        }
    }

    /// Node reference stored with `set_node`.
    pub fn node(&self, name: &str) -> Result<NodeId, StepError> {
        match self.resolved(name)? {
            ContextValue::Node { id } => Ok(*id),
            _ => Err(StepError::failed(format!(
                "context entry '{name}' is not a node reference"
            ))),
        }
    }

    /// Result set of the future that resolved into `name`.
    pub fn outputs_of(&self, name: &str) -> Result<&Outputs, StepError> {
        match self.resolved(name)? {
            ContextValue::Outputs { outputs, .. } => Ok(outputs),
            ContextValue::Failed { process_id, error } => Err(StepError::failed(format!(
                "future '{name}' ({process_id}) failed: {error}"
            ))),
            _ => Err(StepError::failed(format!(
                "context entry '{name}' is not a future result"
            ))),
        }
    }

    /// One labeled output of the future that resolved into `name`.
    pub fn output_of(&self, name: &str, label: &str) -> Result<NodeId, StepError> {
        self.outputs_of(name)?.get(label).ok_or_else(|| {
            StepError::failed(format!("future '{name}' has no output '{label}'"))
        })
    }

    /// Payload of one labeled output of a resolved future.
    pub async fn output_value(&self, name: &str, label: &str) -> Result<Value, StepError> {
        let id = self.output_of(name, label)?;
        self.value(id).await
    }

    /// Error of a future that failed under a tolerant wait.
    pub fn failure_of(&self, name: &str) -> Option<&ErrorInfo> {
        match self.context.get(name) {
            Some(ContextEntry::Resolved {
                value: ContextValue::Failed { error, .. },
            }) => Some(error),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Sub-processes
    // -----------------------------------------------------------------------

    /// Run a function now, linked to this chain by a CALL edge.
    pub async fn invoke<F: WorkFunction>(
        &self,
        function: &F,
        args: &Arguments,
    ) -> Result<ProcessResult, EngineError> {
        self.engine
            .invoke_as(Some(self.process_id), function, args)
            .await?
            .into_result()
    }

    /// Run a function now and hand back a future for it, so it can be
    /// awaited alongside calculations in a `WaitFor`.
    pub async fn submit_function<F: WorkFunction>(
        &self,
        function: &F,
        args: &Arguments,
    ) -> Result<ProcessFuture, EngineError> {
        let invocation = self
            .engine
            .invoke_as(Some(self.process_id), function, args)
            .await?;
        Ok(ProcessFuture::function(invocation.process_id))
    }

    /// Submit an external calculation.
    pub async fn submit_calculation(
        &self,
        spec: CalculationSpec,
    ) -> Result<ProcessFuture, EngineError> {
        self.engine
            .start_calculation(spec, Some(self.process_id))
            .await
    }

    /// Submit a registered chain as a sub-process.
    pub async fn submit_chain(
        &self,
        name: &str,
        inputs: Arguments,
    ) -> Result<ProcessFuture, EngineError> {
        self.engine
            .submit_as(Some(self.process_id), name, inputs)
            .await
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Add `label` to this chain's outputs.
    ///
    /// The edge is written immediately. A label already emitted by this
    /// chain is `DuplicateOutput`; earlier emissions stay in place. When the
    /// step is a replay after a crash, re-emitting the identical value
    /// returns the existing node instead.
    pub async fn emit(
        &mut self,
        label: &str,
        value: impl Into<ReturnValue>,
    ) -> Result<NodeId, EngineError> {
        let value = value.into();
        let graph = self.engine.graph();
        if let Some(existing) = graph.results(self.process_id).await?.get(label) {
            if self.replay && self.same_value(existing, &value).await? {
                tracing::debug!(
                    process_id = %self.process_id,
                    label,
                    "replayed emit matched existing output"
                );
                return Ok(existing);
            }
            return Err(EngineError::DuplicateOutput {
                process_id: self.process_id,
                label: label.to_string(),
            });
        }

        let node = attach_result(graph, self.process_id, label, value).await?;
        tracing::debug!(
            process_id = %self.process_id,
            step = %self.step,
            label,
            node_id = %node,
            "emitted output"
        );
        Ok(node)
    }

    async fn same_value(&self, existing: NodeId, value: &ReturnValue) -> Result<bool, EngineError> {
        Ok(match value {
            ReturnValue::Node(id) => *id == existing,
            ReturnValue::Value(v) => self.engine.graph().value(existing).await? == *v,
        })
    }
}
