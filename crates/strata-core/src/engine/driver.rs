//! The step loop and the resume entry point.

use std::sync::Arc;
use std::time::Instant;

use strata_types::context::{ContextEntry, ContextValue};
use strata_types::event::ProcessEvent;
use strata_types::node::NodeId;
use strata_types::process::{
    ErrorInfo, ErrorKind, FailurePolicy, ProcessKind, ProcessRecord, ProcessStatus, WaitState,
};

use super::Engine;
use crate::chain::{DynChain, StepContext, StepResult};
use crate::checkpoint::CheckpointError;
use crate::error::{EngineError, StepError};
use crate::function::Arguments;
use crate::repository::ProvenanceRepository;

impl<R: ProvenanceRepository + 'static> Engine<R> {
    /// Re-enter a process. This is the single entry point the daemon calls.
    ///
    /// - CREATED chain: first scheduling step.
    /// - WAITING chain: if every future of the current suspension is
    ///   terminal, resolve them in place and continue with the next step;
    ///   otherwise nothing happens. Under fail-fast a single failed future
    ///   fails the chain even while others are still running.
    /// - WAITING chain parked after a failed checkpoint: re-run the step at
    ///   the cursor as a replay.
    /// - Anything else: no-op returning the current status.
    ///
    /// Safe to call concurrently and repeatedly for the same id: the
    /// transition into RUNNING is a compare-and-set, and a caller that loses
    /// it returns without running a step.
    pub async fn resume(&self, process_id: NodeId) -> Result<ProcessStatus, EngineError> {
        let record = self.checkpoints.load(process_id).await?;
        match (record.kind, record.status) {
            (ProcessKind::Chain, ProcessStatus::Created) => self.start_driving(record).await,
            (ProcessKind::Chain, ProcessStatus::Waiting) => self.resume_waiting(record).await,
            (_, status) => {
                tracing::trace!(process_id = %process_id, status = %status, "resume is a no-op");
                Ok(status)
            }
        }
    }

    async fn start_driving(&self, record: ProcessRecord) -> Result<ProcessStatus, EngineError> {
        let chain = self.chains.get(&record.label)?;
        let mut claimed = record;
        claimed.next_step_index = 0;
        match self
            .checkpoints
            .transition(&mut claimed, ProcessStatus::Running)
            .await
        {
            Ok(()) => {}
            Err(CheckpointError::Conflict(id)) => return self.current_status(id).await,
            Err(err) => return Err(err.into()),
        }
        tracing::info!(process_id = %claimed.id, chain = %claimed.label, "chain started");
        self.drive(chain, claimed, false).await
    }

    async fn resume_waiting(&self, record: ProcessRecord) -> Result<ProcessStatus, EngineError> {
        let chain = self.chains.get(&record.label)?;
        let wait = record.waiting_on.clone().unwrap_or_default();
        // Parked after a failed checkpoint: the step at the cursor may have
        // emitted before the write failed.
        let replay = wait.names.is_empty();

        let mut resolved = Vec::with_capacity(wait.names.len());
        let mut pending = None;
        for name in &wait.names {
            let Some(target) = record.context.get(name).and_then(ContextEntry::pending_process)
            else {
                continue;
            };
            let target_record = self.checkpoints.load(target).await?;
            let value = match target_record.status {
                ProcessStatus::Finished => ContextValue::Outputs {
                    process_id: target,
                    outputs: self.graph.results(target).await?,
                },
                ProcessStatus::Failed => ContextValue::Failed {
                    process_id: target,
                    error: target_record.error.unwrap_or_else(|| {
                        ErrorInfo::new(ErrorKind::StepFailed, "sub-process failed")
                    }),
                },
                status => {
                    pending.get_or_insert((target, status));
                    continue;
                }
            };
            resolved.push((name.clone(), value));
        }

        if wait.policy == FailurePolicy::FailFast {
            let failed = resolved.iter().find_map(|(name, value)| match value {
                ContextValue::Failed { process_id, error } => Some(ErrorInfo::new(
                    error.kind,
                    format!("future '{name}' ({process_id}) failed: {}", error.message),
                )),
                _ => None,
            });
            if let Some(error) = failed {
                let mut record = record;
                return match self.seal_failed(&mut record, error).await {
                    Err(EngineError::Conflict(id)) => self.current_status(id).await,
                    other => other,
                };
            }
        }

        if let Some((target, status)) = pending {
            tracing::debug!(
                process_id = %record.id,
                waiting_on = %target,
                status = %status,
                "future not resolved yet"
            );
            return Ok(ProcessStatus::Waiting);
        }

        let mut claimed = record.clone();
        for (name, value) in resolved {
            claimed
                .context
                .insert(name, ContextEntry::Resolved { value });
        }
        claimed.waiting_on = None;
        match self
            .checkpoints
            .transition(&mut claimed, ProcessStatus::Running)
            .await
        {
            Ok(()) => {}
            Err(CheckpointError::Conflict(id)) => {
                tracing::debug!(process_id = %id, "another worker resumed this chain");
                return self.current_status(id).await;
            }
            Err(CheckpointError::ContextTooLarge { .. }) => {
                let error = ErrorInfo::new(
                    ErrorKind::StepFailed,
                    "resolved futures push the context over its size limit",
                );
                let mut record = record;
                return self.seal_failed(&mut record, error).await;
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(
            process_id = %claimed.id,
            next_step_index = claimed.next_step_index,
            replay,
            "chain resumed"
        );
        self.drive(chain, claimed, replay).await
    }

    /// Run steps from `record.next_step_index` until the chain suspends,
    /// finishes, or fails. `record` must be RUNNING and freshly persisted.
    ///
    /// On a failed checkpoint write the chain is parked back in WAITING at
    /// its last persisted state, so a later `resume` continues from there.
    pub(super) async fn drive(
        &self,
        chain: Arc<dyn DynChain<R>>,
        mut record: ProcessRecord,
        mut replay: bool,
    ) -> Result<ProcessStatus, EngineError> {
        let outline = chain.outline();
        let inputs: Arguments = match self.graph.arguments(record.id).await {
            Ok(args) => args.into_iter().collect(),
            Err(err) => {
                self.park(&record).await;
                return Err(err.into());
            }
        };

        loop {
            let index = record.next_step_index;
            let Some(step) = outline.get(index).map(str::to_string) else {
                return self.seal_finished(&mut record).await;
            };

            self.events.publish(ProcessEvent::StepStarted {
                process_id: record.id,
                step: step.clone(),
                index,
            });
            tracing::debug!(process_id = %record.id, step = %step, index, "running step");
            let started = Instant::now();

            let mut ctx = StepContext::new(
                self,
                record.id,
                step.clone(),
                index,
                inputs.clone(),
                record.context.clone(),
                replay,
            );
            let outcome = chain.run_step_boxed(&step, &mut ctx).await;
            let context = ctx.into_context();
            replay = false;

            let result = match outcome {
                Ok(result) => result,
                Err(err) if err.is_transient() => {
                    self.park(&record).await;
                    return Err(step_engine_error(record.id, &step, err));
                }
                Err(err) => {
                    let info = err.error_info();
                    let error = ErrorInfo::new(
                        info.kind,
                        format!("step '{step}' failed: {}", info.message),
                    );
                    return self.seal_failed(&mut record, error).await;
                }
            };

            let mut next = record.clone();
            next.context = context;
            next.next_step_index = index + 1;

            let (status, awaiting) = match result {
                StepResult::WaitFor(wait) if !wait.is_empty() => {
                    let mut names = Vec::with_capacity(wait.futures().len());
                    let mut awaiting = Vec::with_capacity(wait.futures().len());
                    for (name, future) in wait.futures() {
                        next.context.insert(
                            name.clone(),
                            ContextEntry::Pending {
                                process_id: future.process_id,
                            },
                        );
                        names.push(name.clone());
                        awaiting.push(future.process_id);
                    }
                    next.waiting_on = Some(WaitState {
                        names,
                        policy: wait.policy(),
                    });
                    (ProcessStatus::Waiting, awaiting)
                }
                StepResult::Done => (ProcessStatus::Finished, Vec::new()),
                StepResult::Continue | StepResult::WaitFor(_) => {
                    if next.next_step_index >= outline.len() {
                        (ProcessStatus::Finished, Vec::new())
                    } else {
                        (ProcessStatus::Running, Vec::new())
                    }
                }
            };

            let write = match status {
                ProcessStatus::Finished => self.checkpoints.seal(&mut next, None).await,
                ProcessStatus::Waiting => {
                    self.checkpoints
                        .transition(&mut next, ProcessStatus::Waiting)
                        .await
                }
                _ => self.checkpoints.save(&mut next).await,
            };
            match write {
                Ok(()) => {}
                Err(err @ CheckpointError::ContextTooLarge { .. }) => {
                    let error =
                        ErrorInfo::new(ErrorKind::StepFailed, format!("step '{step}': {err}"));
                    return self.seal_failed(&mut record, error).await;
                }
                Err(CheckpointError::Conflict(id)) => {
                    tracing::warn!(process_id = %id, step = %step, "lost ownership of chain");
                    return Err(EngineError::Conflict(id));
                }
                Err(err) => {
                    self.park(&record).await;
                    return Err(err.into());
                }
            }
            record = next;

            self.events.publish(ProcessEvent::StepCompleted {
                process_id: record.id,
                step: step.clone(),
                index,
                duration_ms: started.elapsed().as_millis() as u64,
            });

            match status {
                ProcessStatus::Finished => {
                    self.events.publish(ProcessEvent::Sealed {
                        process_id: record.id,
                        status,
                    });
                    return Ok(status);
                }
                ProcessStatus::Waiting => {
                    tracing::info!(
                        process_id = %record.id,
                        step = %step,
                        futures = awaiting.len(),
                        "chain waiting"
                    );
                    self.events.publish(ProcessEvent::Waiting {
                        process_id: record.id,
                        awaiting,
                    });
                    return Ok(status);
                }
                _ => tokio::task::yield_now().await,
            }
        }
    }

    /// Best-effort: move a RUNNING chain whose checkpoint failed back to
    /// WAITING with nothing to wait for, at its last persisted state.
    async fn park(&self, record: &ProcessRecord) {
        let mut parked = record.clone();
        parked.waiting_on = Some(WaitState::default());
        match self
            .checkpoints
            .transition(&mut parked, ProcessStatus::Waiting)
            .await
        {
            Ok(()) => tracing::debug!(
                process_id = %record.id,
                next_step_index = record.next_step_index,
                "parked chain after failed checkpoint"
            ),
            Err(err) => tracing::warn!(
                process_id = %record.id,
                error = %err,
                "could not park chain, leaving it for recovery"
            ),
        }
    }

    pub(super) async fn current_status(&self, id: NodeId) -> Result<ProcessStatus, EngineError> {
        Ok(self.checkpoints.load(id).await?.status)
    }
}

fn step_engine_error(process_id: NodeId, step: &str, err: StepError) -> EngineError {
    match err {
        StepError::Engine(err) => err,
        other => EngineError::StepFailed {
            process_id,
            step: step.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use strata_types::node::EdgeKind;

    use super::*;
    use crate::provenance::Walk;
    use strata_types::error::RepositoryError;

    use crate::testing::{
        CombineChain, DoubleEmitChain, EmitChain, FlakyRepo, ParentChain, ReplayChain, Repo,
        ScriptedBackend, TolerantChain, engine, fast_config,
    };

    fn backend() -> ScriptedBackend {
        ScriptedBackend::new()
            .returns("f1", json!({ "value": 3 }))
            .returns("f2", json!({ "value": 4 }))
            .fails("broken", "segfault in step 3")
    }

    #[tokio::test]
    async fn combine_scenario_finishes_with_single_output() {
        let engine = engine().with_backend(backend());
        engine.register(CombineChain).unwrap();

        let result = engine.run("combine", Arguments::new()).await.unwrap();
        let labels: Vec<_> = result.outputs.labels().collect();
        assert_eq!(labels, vec!["result"]);
        let node = result.outputs.get("result").unwrap();
        assert_eq!(engine.graph().value(node).await.unwrap(), json!(7));

        let callees = engine.graph().callees(result.process_id).await.unwrap();
        assert_eq!(callees.len(), 2);
        let mut codes = Vec::new();
        for id in &callees {
            let record = engine.checkpoints().load(*id).await.unwrap();
            assert_eq!(record.kind, ProcessKind::Calculation);
            assert_eq!(record.status, ProcessStatus::Finished);
            codes.push(record.label);
        }
        assert_eq!(codes, vec!["f1", "f2"]);

        let record = engine.checkpoints().load(result.process_id).await.unwrap();
        assert_eq!(record.status, ProcessStatus::Finished);
        assert!(record.waiting_on.is_none());
        assert!(engine.graph().node(result.process_id).await.unwrap().sealed);
    }

    #[tokio::test]
    async fn provenance_of_a_finished_chain_is_acyclic() {
        let engine = engine().with_backend(backend());
        engine.register(CombineChain).unwrap();
        let result = engine.run("combine", Arguments::new()).await.unwrap();

        let lineage = engine
            .graph()
            .subgraph(result.process_id, 8, Walk::Both)
            .await
            .unwrap();
        assert!(lineage.is_acyclic());
        // chain, two calculations, three data nodes
        assert_eq!(lineage.node_count(), 6);
    }

    #[tokio::test]
    async fn resume_waits_for_every_future() {
        let backend = backend();
        backend.hold("f2");
        let engine = engine().with_backend(backend.clone());
        engine.register(CombineChain).unwrap();

        let future = engine.submit("combine", Arguments::new()).await.unwrap();
        assert_eq!(future.status(&engine).await.unwrap(), ProcessStatus::Waiting);

        // f1 finishes on this poll, f2 is held.
        assert_eq!(
            engine.poll(future.process_id).await.unwrap(),
            ProcessStatus::Waiting
        );
        let record = engine.checkpoints().load(future.process_id).await.unwrap();
        assert_eq!(record.next_step_index, 1);
        assert_eq!(record.pending_processes().len(), 2);
        assert!(engine.graph().results(future.process_id).await.unwrap().is_empty());

        backend.release("f2");
        let result = future.wait(&engine).await.unwrap();
        let node = result.outputs.get("result").unwrap();
        assert_eq!(engine.graph().value(node).await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn resume_is_a_no_op_once_sealed() {
        let engine = engine().with_backend(backend());
        engine.register(CombineChain).unwrap();
        let result = engine.run("combine", Arguments::new()).await.unwrap();
        let before = engine.checkpoints().load(result.process_id).await.unwrap();

        assert_eq!(
            engine.resume(result.process_id).await.unwrap(),
            ProcessStatus::Finished
        );
        let after = engine.checkpoints().load(result.process_id).await.unwrap();
        assert_eq!(before.revision, after.revision);
    }

    #[tokio::test]
    async fn concurrent_resumes_run_the_next_step_once() {
        let engine = engine().with_backend(backend());
        engine.register(CombineChain).unwrap();
        let future = engine.submit("combine", Arguments::new()).await.unwrap();
        for child in engine.graph().callees(future.process_id).await.unwrap() {
            engine.poll(child).await.unwrap();
        }

        let (a, b) = tokio::join!(
            engine.resume(future.process_id),
            engine.resume(future.process_id)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(
            future.status(&engine).await.unwrap(),
            ProcessStatus::Finished
        );
        assert_eq!(future.outputs(&engine).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_emit_fails_the_chain_and_keeps_the_first() {
        let engine = engine();
        engine.register(DoubleEmitChain).unwrap();

        let err = engine.run("double_emit", Arguments::new()).await.unwrap_err();
        let EngineError::Failed { process_id, error } = err else {
            panic!("expected a failed chain, got {err:?}");
        };
        assert_eq!(error.kind, ErrorKind::DuplicateOutput);

        let outputs = engine.graph().results(process_id).await.unwrap();
        assert_eq!(outputs.len(), 1);
        let first = outputs.get("result").unwrap();
        assert_eq!(engine.graph().value(first).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn failed_future_fails_the_chain_by_default() {
        let engine = engine().with_backend(backend());
        engine.register(TolerantChain { tolerate: false }).unwrap();

        let err = engine.run("strict", Arguments::new()).await.unwrap_err();
        let EngineError::Failed { error, .. } = err else {
            panic!("expected a failed chain, got {err:?}");
        };
        assert_eq!(error.kind, ErrorKind::ExternalExecution);
        assert!(error.message.contains("future 'bad'"));
        assert!(error.message.contains("segfault"));
    }

    #[tokio::test]
    async fn tolerant_wait_hands_the_failure_to_the_next_step() {
        let engine = engine().with_backend(backend());
        engine.register(TolerantChain { tolerate: true }).unwrap();

        let result = engine.run("tolerant", Arguments::new()).await.unwrap();
        let flag = result.outputs.get("bad_failed").unwrap();
        assert_eq!(engine.graph().value(flag).await.unwrap(), json!(true));

        // The calculation's node is handed back, not copied.
        let value = result.outputs.get("value").unwrap();
        let links = engine.graph().get_outputs(result.process_id).await.unwrap();
        let link = links.iter().find(|l| l.label == "value").unwrap();
        assert_eq!(link.kind, EdgeKind::Return);
        assert_ne!(
            engine.graph().producer(value).await.unwrap(),
            Some(result.process_id)
        );
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected_before_anything_is_recorded() {
        let engine = engine();
        let err = engine.run("missing", Arguments::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownChain(name) if name == "missing"));
        assert_eq!(engine.graph().repo().node_count(), 0);
    }

    #[tokio::test]
    async fn invalid_inputs_seal_the_chain_failed() {
        let engine = engine();
        engine.register(ReplayChain::default()).unwrap();

        let err = engine.run("replay", Arguments::new()).await.unwrap_err();
        let EngineError::Failed { process_id, error } = err else {
            panic!("expected a failed chain, got {err:?}");
        };
        assert_eq!(error.kind, ErrorKind::Validation);
        let record = engine.checkpoints().load(process_id).await.unwrap();
        assert_eq!(record.status, ProcessStatus::Failed);
        assert_eq!(record.next_step_index, 0);
    }

    #[tokio::test]
    async fn sub_chain_result_is_returned_by_the_parent() {
        let engine = engine().with_backend(backend());
        engine.register(CombineChain).unwrap();
        engine.register(ParentChain).unwrap();

        let result = engine.run("parent", Arguments::new()).await.unwrap();
        let node = result.outputs.get("result").unwrap();
        assert_eq!(engine.graph().value(node).await.unwrap(), json!(7));

        let callees = engine.graph().callees(result.process_id).await.unwrap();
        assert_eq!(callees.len(), 1);
        let child = engine.checkpoints().load(callees[0]).await.unwrap();
        assert_eq!(child.kind, ProcessKind::Chain);
        assert_eq!(child.label, "combine");
        assert_eq!(engine.graph().results(child.id).await.unwrap().get("result"), Some(node));
    }

    #[tokio::test]
    async fn recovered_chain_replays_the_interrupted_step() {
        let repo = Arc::new(Repo::new());
        let n = {
            let graph = crate::provenance::ProvenanceGraph::from_shared(Arc::clone(&repo));
            graph.store(json!(4)).await.unwrap()
        };

        // First worker dies inside `scale`, after its emit.
        let crashing = ReplayChain::default();
        crashing.crash.store(true, Ordering::SeqCst);
        let first = Arc::new(Engine::from_shared(Arc::clone(&repo), fast_config()));
        first.register(crashing.clone()).unwrap();
        let task = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.run("replay", Arguments::new().with("n", n)).await })
        };
        crashing.reached.notified().await;
        task.abort();
        let _ = task.await;

        let running = first.checkpoints().list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        let process_id = running[0].id;
        assert_eq!(running[0].next_step_index, 1);
        let scaled_before = first.graph().results(process_id).await.unwrap().get("scaled");
        assert!(scaled_before.is_some());

        // A fresh worker over the same store picks it up.
        let second = Engine::from_shared(Arc::clone(&repo), fast_config());
        let chain = ReplayChain::default();
        second.register(chain.clone()).unwrap();
        let recovered = second.recover().await.unwrap();
        assert_eq!(recovered, vec![process_id]);
        assert_eq!(chain.scale_runs.load(Ordering::SeqCst), 1);

        let result = second.result(process_id).await.unwrap();
        assert_eq!(result.outputs.get("scaled"), scaled_before);

        // Same values as an uninterrupted run.
        let clean = engine();
        clean.register(ReplayChain::default()).unwrap();
        let n = clean.graph().store(json!(4)).await.unwrap();
        let expected = clean.run("replay", Arguments::new().with("n", n)).await.unwrap();
        for label in ["scaled", "next"] {
            let got = second.graph().value(result.outputs.get(label).unwrap()).await.unwrap();
            let want = clean.graph().value(expected.outputs.get(label).unwrap()).await.unwrap();
            assert_eq!(got, want, "output {label}");
        }
    }

    #[tokio::test]
    async fn failed_future_fails_the_chain_while_others_still_run() {
        let backend = backend();
        backend.hold("f1");
        let engine = engine().with_backend(backend.clone());
        engine.register(TolerantChain { tolerate: false }).unwrap();

        let future = engine.submit("strict", Arguments::new()).await.unwrap();
        assert_eq!(
            engine.poll(future.process_id).await.unwrap(),
            ProcessStatus::Failed
        );

        let record = engine.checkpoints().load(future.process_id).await.unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ExternalExecution);
        assert!(error.message.contains("future 'bad'"));

        // The held calculation is untouched and still running.
        let callees = engine.graph().callees(future.process_id).await.unwrap();
        let held = engine.checkpoints().load(callees[0]).await.unwrap();
        assert_eq!(held.label, "f1");
        assert!(!held.status.is_terminal());
    }

    #[tokio::test]
    async fn parked_chain_replays_its_step_on_resume() {
        // Update 1 claims the chain, update 2 checkpoints the `emit` step.
        let engine = Engine::new(FlakyRepo::failing_update(2), fast_config());
        engine.register(EmitChain).unwrap();

        let err = engine.run("emit", Arguments::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(RepositoryError::Connection)));

        let parked = engine.checkpoints().list_waiting().await.unwrap();
        assert_eq!(parked.len(), 1);
        let process_id = parked[0].id;
        assert_eq!(parked[0].next_step_index, 0);
        assert!(parked[0].waiting_on.as_ref().unwrap().names.is_empty());
        let a = engine.graph().results(process_id).await.unwrap().get("a");
        assert!(a.is_some());

        assert_eq!(
            engine.resume(process_id).await.unwrap(),
            ProcessStatus::Finished
        );
        let outputs = engine.graph().results(process_id).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.get("a"), a);
        let b = outputs.get("b").unwrap();
        assert_eq!(engine.graph().value(b).await.unwrap(), json!(2));
    }
}
