//! Step-outline state machines ("chains").
//!
//! A chain is a fixed, ordered [`Outline`] of named steps plus one handler
//! per step. Each handler runs to completion against the persisted context
//! and returns a [`StepResult`]: continue with the next step, suspend on a
//! set of futures, or finish. The engine owns the loop; see
//! [`Engine`](crate::engine::Engine).

mod context;
mod registry;

use futures_util::future::BoxFuture;
use strata_types::process::FailurePolicy;

use crate::engine::ProcessFuture;
use crate::error::StepError;
use crate::function::Arguments;
use crate::repository::ProvenanceRepository;

pub use context::StepContext;
pub use registry::ChainRegistry;

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// Ordered step names of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outline {
    steps: Vec<String>,
}

impl Outline {
    pub fn new<S: Into<String>>(steps: impl IntoIterator<Item = S>) -> Self {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names must be non-empty and unique.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.is_empty() {
                return Err("outline contains an empty step name".to_string());
            }
            if !seen.insert(step.as_str()) {
                return Err(format!("outline repeats step '{step}'"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Futures a step suspends on, keyed by the context name each resolves into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitFor {
    futures: Vec<(String, ProcessFuture)>,
    policy: FailurePolicy,
}

impl WaitFor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `future` under `name`. A repeated name replaces the earlier one.
    pub fn on(mut self, name: impl Into<String>, future: ProcessFuture) -> Self {
        let name = name.into();
        self.futures.retain(|(n, _)| *n != name);
        self.futures.push((name, future));
        self
    }

    /// Resolve failed futures to `ContextValue::Failed` instead of failing
    /// the chain.
    pub fn tolerate_failures(mut self) -> Self {
        self.policy = FailurePolicy::Tolerate;
        self
    }

    pub fn futures(&self) -> &[(String, ProcessFuture)] {
        &self.futures
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

impl FromIterator<(String, ProcessFuture)> for WaitFor {
    fn from_iter<T: IntoIterator<Item = (String, ProcessFuture)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(WaitFor::new(), |wait, (name, future)| wait.on(name, future))
    }
}

/// What a step handler tells the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Run the next step.
    Continue,
    /// Suspend until every listed future is terminal.
    WaitFor(WaitFor),
    /// Stop here and seal the chain FINISHED.
    Done,
}

// ---------------------------------------------------------------------------
// WorkChain
// ---------------------------------------------------------------------------

/// A checkpointable multi-step process.
///
/// Handlers must not keep state in `self` between steps: the step that
/// resumes after a suspension may run in another worker or after a
/// restart, and only sees what was persisted in the context.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkChain: Send + Sync + 'static {
    /// Registry key and process label.
    fn name(&self) -> &str;

    fn outline(&self) -> Outline;

    /// Reject malformed inputs before the first step runs.
    fn validate(&self, inputs: &Arguments) -> Result<(), String> {
        let _ = inputs;
        Ok(())
    }

    fn run_step<R: ProvenanceRepository + 'static>(
        &self,
        step: &str,
        ctx: &mut StepContext<'_, R>,
    ) -> impl std::future::Future<Output = Result<StepResult, StepError>> + Send;
}

/// Object-safe version of [`WorkChain`] for the registry.
pub trait DynChain<R: ProvenanceRepository + 'static>: Send + Sync {
    fn name(&self) -> &str;

    fn outline(&self) -> Outline;

    fn validate(&self, inputs: &Arguments) -> Result<(), String>;

    fn run_step_boxed<'a, 'b>(
        &'a self,
        step: &'a str,
        ctx: &'a mut StepContext<'b, R>,
    ) -> BoxFuture<'a, Result<StepResult, StepError>>
    where
        'b: 'a;
}

impl<R: ProvenanceRepository + 'static, C: WorkChain> DynChain<R> for C {
    fn name(&self) -> &str {
        WorkChain::name(self)
    }

    fn outline(&self) -> Outline {
        WorkChain::outline(self)
    }

    fn validate(&self, inputs: &Arguments) -> Result<(), String> {
        WorkChain::validate(self, inputs)
    }

    fn run_step_boxed<'a, 'b>(
        &'a self,
        step: &'a str,
        ctx: &'a mut StepContext<'b, R>,
    ) -> BoxFuture<'a, Result<StepResult, StepError>>
    where
        'b: 'a,
    {
        Box::pin(self.run_step(step, ctx))
    }
}
