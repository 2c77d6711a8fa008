//! Function wrapper: run a callable as a recorded FUNCTION_PROCESS.
//!
//! A [`WorkFunction`] receives its arguments as DATA node references and
//! returns a [`Returns`] set. The wrapper records the process node, INPUT
//! edges in argument order, a CALL edge from the caller (if any), and one
//! OUTPUT or RETURN edge per returned value.

mod wrapper;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::node::NodeId;

use crate::error::FunctionError;
use crate::repository::ProvenanceRepository;

pub use wrapper::CallContext;
pub(crate) use wrapper::{Invocation, attach_result, invoke_function, link_inputs};

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Ordered, named DATA node arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Vec<(String, NodeId)>);

impl Arguments {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Positional arguments, labeled "0", "1", ...
    pub fn positional(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self(
            nodes
                .into_iter()
                .enumerate()
                .map(|(i, n)| (i.to_string(), n))
                .collect(),
        )
    }

    pub fn with(mut self, name: impl Into<String>, node: NodeId) -> Self {
        self.push(name, node);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, node: NodeId) {
        self.0.push((name.into(), node));
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    /// Like `get`, but a missing argument is a validation error.
    pub fn require(&self, name: &str) -> Result<NodeId, FunctionError> {
        self.get(name)
            .ok_or_else(|| FunctionError::Validation(format!("missing argument '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.0.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, NodeId)> for Arguments {
    fn from_iter<T: IntoIterator<Item = (String, NodeId)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Returns
// ---------------------------------------------------------------------------

/// One value handed back by a function or emitted by a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// A fresh value; stored as a new DATA node linked by OUTPUT.
    Value(Value),
    /// An existing DATA node; linked by RETURN.
    Node(NodeId),
}

impl From<Value> for ReturnValue {
    fn from(value: Value) -> Self {
        ReturnValue::Value(value)
    }
}

impl From<NodeId> for ReturnValue {
    fn from(node: NodeId) -> Self {
        ReturnValue::Node(node)
    }
}

/// Ordered result set of a function body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Returns(Vec<(String, ReturnValue)>);

impl Returns {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A single unnamed result (label "0").
    pub fn single(value: impl Into<ReturnValue>) -> Self {
        let mut returns = Self::new();
        returns.push(value);
        returns
    }

    pub fn with(mut self, label: impl Into<String>, value: impl Into<ReturnValue>) -> Self {
        self.0.push((label.into(), value.into()));
        self
    }

    /// Append an unnamed result, labeled by its position.
    pub fn push(&mut self, value: impl Into<ReturnValue>) {
        let label = self.0.len().to_string();
        self.0.push((label, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReturnValue)> {
        self.0.iter().map(|(label, value)| (label.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Returns {
    type Item = (String, ReturnValue);
    type IntoIter = std::vec::IntoIter<(String, ReturnValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// WorkFunction
// ---------------------------------------------------------------------------

/// A pure data transformation recorded in the provenance graph.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkFunction: Send + Sync {
    /// Name recorded as the process label.
    fn name(&self) -> &str;

    /// Reject malformed arguments before the body runs.
    fn validate(&self, args: &Arguments) -> Result<(), String> {
        let _ = args;
        Ok(())
    }

    /// The function body. Nested calls go through `ctx.invoke`.
    fn call<R: ProvenanceRepository + 'static>(
        &self,
        ctx: &CallContext<'_, R>,
        args: &Arguments,
    ) -> impl std::future::Future<Output = Result<Returns, FunctionError>> + Send;
}
