//! Shared fixtures for the engine tests: an in-memory harness, a handful of
//! work functions and chains, and a calculation backend driven by scripts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::{Value, json};
use strata_types::config::EngineConfig;
use strata_types::error::RepositoryError;
use strata_types::node::{Edge, Node, NodeId};
use strata_types::process::{ProcessFilter, ProcessRecord};
use tokio::sync::Notify;

use crate::calculation::{
    CalculationBackend, CalculationError, CalculationRequest, CalculationSpec, JobId, JobState,
};
use crate::chain::{Outline, StepContext, StepResult, WaitFor, WorkChain};
use crate::checkpoint::CheckpointManager;
use crate::engine::Engine;
use crate::error::{FunctionError, StepError};
use crate::event::EventBus;
use crate::function::{Arguments, CallContext, ReturnValue, Returns, WorkFunction};
use crate::provenance::ProvenanceGraph;
use crate::repository::{InMemoryProvenanceRepository, ProvenanceRepository};

pub type Repo = InMemoryProvenanceRepository;

pub struct Harness {
    pub graph: ProvenanceGraph<Repo>,
    pub checkpoints: CheckpointManager<Repo>,
    pub events: EventBus,
}

pub fn harness() -> Harness {
    let repo = Arc::new(Repo::new());
    Harness {
        graph: ProvenanceGraph::from_shared(Arc::clone(&repo)),
        checkpoints: CheckpointManager::new(repo, EngineConfig::default().max_context_bytes),
        events: EventBus::default(),
    }
}

/// Engine config that polls fast enough for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 1,
        max_poll_interval_ms: 5,
        sweep_interval_ms: 10,
        ..Default::default()
    }
}

pub fn engine() -> Engine<Repo> {
    Engine::new(Repo::new(), fast_config())
}

fn number(value: &Value) -> Result<i64, FunctionError> {
    value
        .as_i64()
        .ok_or_else(|| FunctionError::Validation(format!("expected an integer, got {value}")))
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

pub struct Add;

impl WorkFunction for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn validate(&self, args: &Arguments) -> Result<(), String> {
        for name in ["x", "y"] {
            if args.get(name).is_none() {
                return Err(format!("missing argument '{name}'"));
            }
        }
        Ok(())
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        ctx: &CallContext<'_, R>,
        args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        let x = number(&ctx.arg(args, "x").await?)?;
        let y = number(&ctx.arg(args, "y").await?)?;
        Ok(Returns::new().with("sum", json!(x + y)))
    }
}

pub struct Double;

impl WorkFunction for Double {
    fn name(&self) -> &str {
        "double"
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        ctx: &CallContext<'_, R>,
        args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        let value = number(&ctx.arg(args, "value").await?)?;
        Ok(Returns::new().with("result", json!(value * 2)))
    }
}

pub struct Boom;

impl WorkFunction for Boom {
    fn name(&self) -> &str {
        "boom"
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        _ctx: &CallContext<'_, R>,
        _args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        Err(FunctionError::failed("boom"))
    }
}

/// Returns a good value followed by a bad one: a dangling node reference,
/// or with `duplicate` set, a positional label that collides with `"1"`.
pub struct BadReturns {
    pub duplicate: bool,
}

impl WorkFunction for BadReturns {
    fn name(&self) -> &str {
        "bad_returns"
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        _ctx: &CallContext<'_, R>,
        _args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        if self.duplicate {
            let mut returns = Returns::new().with("1", json!(1));
            returns.push(json!(2));
            Ok(returns)
        } else {
            Ok(Returns::new()
                .with("ok", json!(1))
                .with("dangling", NodeId::new()))
        }
    }
}

/// `2a + 2b`, built from nested `double` and `add` calls. Returns the inner
/// sum node instead of creating a new one.
pub struct SumOfDoubles;

impl WorkFunction for SumOfDoubles {
    fn name(&self) -> &str {
        "sum_of_doubles"
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        ctx: &CallContext<'_, R>,
        args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        let mut doubled = Vec::with_capacity(2);
        for name in ["a", "b"] {
            let input = args.require(name)?;
            let result = ctx
                .invoke(&Double, &Arguments::new().with("value", input))
                .await?;
            let node = result
                .outputs
                .get("result")
                .ok_or_else(|| FunctionError::failed("double returned no result"))?;
            doubled.push(node);
        }
        let sum = ctx
            .invoke(
                &Add,
                &Arguments::new().with("x", doubled[0]).with("y", doubled[1]),
            )
            .await?;
        let total = sum
            .outputs
            .get("sum")
            .ok_or_else(|| FunctionError::failed("add returned no sum"))?;
        Ok(Returns::new().with("total", ReturnValue::Node(total)))
    }
}

/// Scale every number of `structure` by `factor`.
pub struct Rescale;

impl WorkFunction for Rescale {
    fn name(&self) -> &str {
        "rescale"
    }

    async fn call<R: ProvenanceRepository + 'static>(
        &self,
        ctx: &CallContext<'_, R>,
        args: &Arguments,
    ) -> Result<Returns, FunctionError> {
        let structure = ctx.arg(args, "structure").await?;
        let factor = ctx
            .arg(args, "factor")
            .await?
            .as_f64()
            .ok_or_else(|| FunctionError::Validation("factor must be a number".to_string()))?;
        let cell = structure["cell"]
            .as_array()
            .ok_or_else(|| FunctionError::Validation("structure has no cell".to_string()))?
            .iter()
            .map(|v| v.as_f64().map(|x| x * factor))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FunctionError::Validation("cell must be numeric".to_string()))?;
        Ok(Returns::single(json!({ "cell": cell })))
    }
}

// ---------------------------------------------------------------------------
// Calculation backend
// ---------------------------------------------------------------------------

type Script = Arc<dyn Fn(&BTreeMap<String, Value>) -> JobState + Send + Sync>;

struct Job {
    code: String,
    polls_left: usize,
    outcome: JobState,
}

#[derive(Default)]
struct ScriptedInner {
    scripts: DashMap<String, (usize, Script)>,
    held: DashMap<String, ()>,
    jobs: DashMap<String, Job>,
    next_id: AtomicU64,
    submitted: AtomicUsize,
}

/// Backend whose jobs resolve from per-code closures after a fixed number of
/// polls. Codes can be held in RUNNING until released.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    inner: Arc<ScriptedInner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs for `code` finish with `outputs` on their first poll.
    pub fn returns(self, code: &str, outputs: Value) -> Self {
        self.script(code, 0, move |_| JobState::Finished {
            outputs: outputs
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        })
    }

    /// Jobs for `code` fail with `message`.
    pub fn fails(self, code: &str, message: &str) -> Self {
        let message = message.to_string();
        self.script(code, 0, move |_| JobState::Failed {
            message: message.clone(),
        })
    }

    pub fn script(
        self,
        code: &str,
        polls: usize,
        run: impl Fn(&BTreeMap<String, Value>) -> JobState + Send + Sync + 'static,
    ) -> Self {
        self.inner
            .scripts
            .insert(code.to_string(), (polls, Arc::new(run)));
        self
    }

    pub fn hold(&self, code: &str) {
        self.inner.held.insert(code.to_string(), ());
    }

    pub fn release(&self, code: &str) {
        self.inner.held.remove(code);
    }

    pub fn submitted(&self) -> usize {
        self.inner.submitted.load(Ordering::SeqCst)
    }
}

impl CalculationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &CalculationRequest) -> Result<JobId, CalculationError> {
        let (polls, run) = self
            .inner
            .scripts
            .get(&request.code)
            .map(|s| (s.0, Arc::clone(&s.1)))
            .ok_or_else(|| CalculationError::UnknownCode(request.code.clone()))?;
        let id = format!("job-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.jobs.insert(
            id.clone(),
            Job {
                code: request.code.clone(),
                polls_left: polls,
                outcome: run(&request.inputs),
            },
        );
        self.inner.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(JobId(id))
    }

    async fn poll(&self, job: &JobId) -> Result<JobState, CalculationError> {
        let mut entry = self
            .inner
            .jobs
            .get_mut(&job.0)
            .ok_or_else(|| CalculationError::JobNotFound(job.0.clone()))?;
        if self.inner.held.contains_key(&entry.code) {
            return Ok(JobState::Running);
        }
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(JobState::Running);
        }
        Ok(entry.outcome.clone())
    }
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// `[submit, combine]`: wait on calculations `f1` and `f2`, then emit the
/// sum of their `value` outputs as `result`.
pub struct CombineChain;

impl WorkChain for CombineChain {
    fn name(&self) -> &str {
        "combine"
    }

    fn outline(&self) -> Outline {
        Outline::new(["submit", "combine"])
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        match step {
            "submit" => {
                let x = ctx.submit_calculation(CalculationSpec::new("f1")).await?;
                let y = ctx.submit_calculation(CalculationSpec::new("f2")).await?;
                Ok(StepResult::WaitFor(WaitFor::new().on("x", x).on("y", y)))
            }
            "combine" => {
                let x = ctx.output_value("x", "value").await?;
                let y = ctx.output_value("y", "value").await?;
                let sum = x.as_i64().unwrap_or_default() + y.as_i64().unwrap_or_default();
                ctx.emit("result", json!(sum)).await?;
                Ok(StepResult::Continue)
            }
            other => Err(StepError::failed(format!("unknown step {other}"))),
        }
    }
}

/// Waits on calculation `ok` and `bad`; with `tolerate` set the second step
/// records which one failed.
pub struct TolerantChain {
    pub tolerate: bool,
}

impl WorkChain for TolerantChain {
    fn name(&self) -> &str {
        if self.tolerate { "tolerant" } else { "strict" }
    }

    fn outline(&self) -> Outline {
        Outline::new(["submit", "inspect"])
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        match step {
            "submit" => {
                let ok = ctx.submit_calculation(CalculationSpec::new("f1")).await?;
                let bad = ctx.submit_calculation(CalculationSpec::new("broken")).await?;
                let wait = WaitFor::new().on("ok", ok).on("bad", bad);
                Ok(StepResult::WaitFor(if self.tolerate {
                    wait.tolerate_failures()
                } else {
                    wait
                }))
            }
            _ => {
                let failed = ctx.failure_of("bad").is_some();
                ctx.emit("bad_failed", json!(failed)).await?;
                let ok = ctx.output_of("ok", "value")?;
                ctx.emit("value", ok).await?;
                Ok(StepResult::Done)
            }
        }
    }
}

/// Emits `result` twice in one step.
pub struct DoubleEmitChain;

impl WorkChain for DoubleEmitChain {
    fn name(&self) -> &str {
        "double_emit"
    }

    fn outline(&self) -> Outline {
        Outline::new(["emit"])
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        _step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        ctx.emit("result", json!(1)).await?;
        ctx.emit("result", json!(2)).await?;
        Ok(StepResult::Continue)
    }
}

/// `[load, scale, finish]` over input `n`. With `crash` set, `scale` emits
/// its output, signals `reached`, and then never returns.
#[derive(Clone, Default)]
pub struct ReplayChain {
    pub crash: Arc<AtomicBool>,
    pub reached: Arc<Notify>,
    pub scale_runs: Arc<AtomicUsize>,
}

impl WorkChain for ReplayChain {
    fn name(&self) -> &str {
        "replay"
    }

    fn outline(&self) -> Outline {
        Outline::new(["load", "scale", "finish"])
    }

    fn validate(&self, inputs: &Arguments) -> Result<(), String> {
        inputs
            .get("n")
            .map(|_| ())
            .ok_or_else(|| "missing input 'n'".to_string())
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        match step {
            "load" => {
                let n = ctx.input_value("n").await?;
                ctx.set("n", n)?;
                Ok(StepResult::Continue)
            }
            "scale" => {
                self.scale_runs.fetch_add(1, Ordering::SeqCst);
                let n: i64 = ctx.get_as("n")?;
                let node = ctx.emit("scaled", json!(n * 10)).await?;
                ctx.set_node("scaled", node);
                if self.crash.load(Ordering::SeqCst) {
                    self.reached.notify_one();
                    std::future::pending::<()>().await;
                }
                Ok(StepResult::Continue)
            }
            _ => {
                let n: i64 = ctx.get_as("n")?;
                ctx.emit("next", json!(n + 1)).await?;
                Ok(StepResult::Continue)
            }
        }
    }
}

/// Submits a `combine` sub-chain and hands its result back.
pub struct ParentChain;

impl WorkChain for ParentChain {
    fn name(&self) -> &str {
        "parent"
    }

    fn outline(&self) -> Outline {
        Outline::new(["spawn", "collect"])
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        match step {
            "spawn" => {
                let child = ctx.submit_chain("combine", Arguments::new()).await?;
                Ok(StepResult::WaitFor(WaitFor::new().on("child", child)))
            }
            _ => {
                let result = ctx.output_of("child", "result")?;
                ctx.emit("result", result).await?;
                Ok(StepResult::Continue)
            }
        }
    }
}

/// `[emit, after]`: emits `a` in the first step, `b` in the second.
pub struct EmitChain;

impl WorkChain for EmitChain {
    fn name(&self) -> &str {
        "emit"
    }

    fn outline(&self) -> Outline {
        Outline::new(["emit", "after"])
    }

    async fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> Result<StepResult, StepError> {
        match step {
            "emit" => {
                ctx.emit("a", json!(1)).await?;
                Ok(StepResult::Continue)
            }
            _ => {
                ctx.emit("b", json!(2)).await?;
                Ok(StepResult::Continue)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// In-memory repository whose n-th `update_process` call (1-based) fails
/// with a connection error. Every other call goes through.
#[derive(Default)]
pub struct FlakyRepo {
    inner: Repo,
    updates: AtomicUsize,
    fail_on: AtomicUsize,
}

impl FlakyRepo {
    pub fn failing_update(n: usize) -> Self {
        let repo = Self::default();
        repo.fail_on.store(n, Ordering::SeqCst);
        repo
    }
}

impl ProvenanceRepository for FlakyRepo {
    async fn insert_node(&self, node: &Node) -> Result<(), RepositoryError> {
        self.inner.insert_node(node).await
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, RepositoryError> {
        self.inner.get_node(id).await
    }

    async fn seal_node(&self, id: &NodeId) -> Result<(), RepositoryError> {
        self.inner.seal_node(id).await
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepositoryError> {
        self.inner.insert_edge(edge).await
    }

    async fn list_incoming(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        self.inner.list_incoming(id).await
    }

    async fn list_outgoing(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        self.inner.list_outgoing(id).await
    }

    async fn insert_process(&self, record: &ProcessRecord) -> Result<(), RepositoryError> {
        self.inner.insert_process(record).await
    }

    async fn get_process(&self, id: &NodeId) -> Result<Option<ProcessRecord>, RepositoryError> {
        self.inner.get_process(id).await
    }

    async fn update_process(&self, record: &ProcessRecord) -> Result<u64, RepositoryError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        self.inner.update_process(record).await
    }

    async fn list_processes(
        &self,
        filter: &ProcessFilter,
    ) -> Result<Vec<ProcessRecord>, RepositoryError> {
        self.inner.list_processes(filter).await
    }
}
