use std::collections::HashSet;

use futures_util::future::BoxFuture;
use serde_json::Value;
use strata_types::error::RepositoryError;
use strata_types::event::ProcessEvent;
use strata_types::node::{EdgeKind, NodeId, NodeKind, Outputs};
use strata_types::process::{ErrorInfo, ErrorKind, ProcessKind, ProcessRecord, ProcessStatus};

use super::{Arguments, ReturnValue, Returns, WorkFunction};
use crate::checkpoint::CheckpointManager;
use crate::engine::ProcessResult;
use crate::error::{EngineError, FunctionError};
use crate::event::EventBus;
use crate::provenance::ProvenanceGraph;
use crate::repository::ProvenanceRepository;

/// What a function body sees while it runs.
pub struct CallContext<'a, R: ProvenanceRepository> {
    graph: &'a ProvenanceGraph<R>,
    checkpoints: &'a CheckpointManager<R>,
    events: &'a EventBus,
    process_id: NodeId,
}

impl<'a, R: ProvenanceRepository + 'static> CallContext<'a, R> {
    /// The FUNCTION_PROCESS node this body runs as.
    pub fn process_id(&self) -> NodeId {
        self.process_id
    }

    pub fn graph(&self) -> &ProvenanceGraph<R> {
        self.graph
    }

    /// Payload of a DATA node.
    pub async fn value(&self, id: NodeId) -> Result<Value, FunctionError> {
        Ok(self.graph.value(id).await.map_err(EngineError::from)?)
    }

    /// Payload of the named argument.
    pub async fn arg(&self, args: &Arguments, name: &str) -> Result<Value, FunctionError> {
        let id = args.require(name)?;
        self.value(id).await
    }

    /// Run a nested function, linked to this one by a CALL edge.
    pub async fn invoke<F: WorkFunction>(
        &self,
        function: &F,
        args: &Arguments,
    ) -> Result<ProcessResult, EngineError> {
        invoke_function(
            self.graph,
            self.checkpoints,
            self.events,
            Some(self.process_id),
            function,
            args,
        )
        .await?
        .into_result()
    }
}

/// Outcome of one recorded function call.
#[derive(Debug)]
pub(crate) struct Invocation {
    pub process_id: NodeId,
    pub outcome: Result<Outputs, ErrorInfo>,
}

impl Invocation {
    pub fn into_result(self) -> Result<ProcessResult, EngineError> {
        match self.outcome {
            Ok(outputs) => Ok(ProcessResult {
                process_id: self.process_id,
                outputs,
            }),
            Err(error) => Err(EngineError::Failed {
                process_id: self.process_id,
                error,
            }),
        }
    }
}

/// Run `function` as a FUNCTION_PROCESS.
///
/// A body error seals the process FAILED and comes back as a failed
/// `Invocation`. Only storage failures are returned as `Err`. Boxed so that
/// nested calls can recurse through `CallContext::invoke`.
pub(crate) fn invoke_function<'a, R, F>(
    graph: &'a ProvenanceGraph<R>,
    checkpoints: &'a CheckpointManager<R>,
    events: &'a EventBus,
    caller: Option<NodeId>,
    function: &'a F,
    args: &'a Arguments,
) -> BoxFuture<'a, Result<Invocation, EngineError>>
where
    R: ProvenanceRepository + 'static,
    F: WorkFunction,
{
    Box::pin(async move {
        let name = function.name();
        let process_id = graph
            .create_node(NodeKind::FunctionProcess, name, Value::Null)
            .await?;
        let mut record = ProcessRecord::new(process_id, ProcessKind::Function, name);
        record.status = ProcessStatus::Running;
        checkpoints.create(&record).await?;
        if let Some(caller) = caller {
            graph
                .create_edge(caller, process_id, EdgeKind::Call, name)
                .await?;
        }
        events.publish(ProcessEvent::Created {
            process_id,
            kind: ProcessKind::Function,
            label: name.to_string(),
            caller,
        });
        tracing::debug!(process_id = %process_id, function = name, "invoking function");

        let result = async {
            link_inputs(graph, process_id, args).await?;
            function.validate(args).map_err(FunctionError::Validation)?;

            let ctx = CallContext {
                graph,
                checkpoints,
                events,
                process_id,
            };
            let returns = function.call(&ctx, args).await?;
            check_returns(graph, process_id, &returns).await?;

            let mut outputs = Outputs::new();
            for (label, value) in returns {
                let node = attach_result(graph, process_id, &label, value).await?;
                outputs.insert(label, node);
            }
            Ok::<_, FunctionError>(outputs)
        }
        .await;

        match result {
            Ok(outputs) => {
                checkpoints.seal(&mut record, None).await?;
                events.publish(ProcessEvent::Sealed {
                    process_id,
                    status: ProcessStatus::Finished,
                });
                Ok(Invocation {
                    process_id,
                    outcome: Ok(outputs),
                })
            }
            Err(FunctionError::Engine(err)) if err.is_transient() => {
                // A function cannot be resumed, so record the failure if the
                // store lets us and hand the storage error back.
                let info = ErrorInfo::new(ErrorKind::Persistence, err.to_string());
                if checkpoints.seal(&mut record, Some(info)).await.is_ok() {
                    events.publish(ProcessEvent::Sealed {
                        process_id,
                        status: ProcessStatus::Failed,
                    });
                }
                Err(err)
            }
            Err(err) => {
                let info = err.error_info();
                tracing::warn!(
                    process_id = %process_id,
                    function = name,
                    error = %info,
                    "function failed"
                );
                checkpoints.seal(&mut record, Some(info.clone())).await?;
                events.publish(ProcessEvent::Sealed {
                    process_id,
                    status: ProcessStatus::Failed,
                });
                Ok(Invocation {
                    process_id,
                    outcome: Err(info),
                })
            }
        }
    })
}

/// INPUT edges in argument order. Every argument must be an existing DATA node.
pub(crate) async fn link_inputs<R: ProvenanceRepository>(
    graph: &ProvenanceGraph<R>,
    process_id: NodeId,
    args: &Arguments,
) -> Result<(), EngineError> {
    for (name, node_id) in args.iter() {
        match graph.repo().get_node(&node_id).await? {
            Some(node) if node.kind == NodeKind::Data => {}
            Some(node) => {
                return Err(EngineError::Validation(format!(
                    "argument '{name}' is a {} node, not data",
                    node.kind
                )));
            }
            None => {
                return Err(EngineError::Validation(format!(
                    "argument '{name}' refers to missing node {node_id}"
                )));
            }
        }
        graph
            .create_edge(node_id, process_id, EdgeKind::Input, name)
            .await?;
    }
    Ok(())
}

/// Reject a result set before anything is written: labels must be unique
/// and every returned node must be an existing DATA node.
async fn check_returns<R: ProvenanceRepository>(
    graph: &ProvenanceGraph<R>,
    process_id: NodeId,
    returns: &Returns,
) -> Result<(), EngineError> {
    let mut seen = HashSet::with_capacity(returns.len());
    for (label, value) in returns.iter() {
        if !seen.insert(label) {
            return Err(EngineError::DuplicateOutput {
                process_id,
                label: label.to_string(),
            });
        }
        if let ReturnValue::Node(node_id) = value {
            require_data_node(graph, label, *node_id).await?;
        }
    }
    Ok(())
}

async fn require_data_node<R: ProvenanceRepository>(
    graph: &ProvenanceGraph<R>,
    label: &str,
    node_id: NodeId,
) -> Result<(), EngineError> {
    let node = graph.repo().get_node(&node_id).await?.ok_or_else(|| {
        EngineError::Validation(format!("result '{label}' refers to missing node {node_id}"))
    })?;
    if node.kind != NodeKind::Data {
        return Err(EngineError::Validation(format!(
            "result '{label}' is a {} node, not data",
            node.kind
        )));
    }
    Ok(())
}

/// Link one result of `process_id` under `label`.
///
/// Fresh values become DATA nodes with an OUTPUT edge; existing DATA nodes
/// get a RETURN edge. A label already in use is `DuplicateOutput`.
pub(crate) async fn attach_result<R: ProvenanceRepository>(
    graph: &ProvenanceGraph<R>,
    process_id: NodeId,
    label: &str,
    value: ReturnValue,
) -> Result<NodeId, EngineError> {
    let (node_id, kind) = match value {
        ReturnValue::Value(value) => (graph.store(value).await?, EdgeKind::Output),
        ReturnValue::Node(node_id) => {
            require_data_node(graph, label, node_id).await?;
            (node_id, EdgeKind::Return)
        }
    };

    match graph.create_edge(process_id, node_id, kind, label).await {
        Ok(()) => Ok(node_id),
        Err(RepositoryError::Conflict(_)) => Err(EngineError::DuplicateOutput {
            process_id,
            label: label.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}
