//! Provenance graph primitives: nodes, edges, and ordered links.
//!
//! Nodes are either DATA (an opaque JSON payload) or one of the PROCESS kinds
//! (an execution record lives alongside the node, see [`crate::process`]).
//! Edges are append-only and labeled; the order in which they were created is
//! the order in which `get_inputs` / `get_outputs` replay them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a graph node, wrapping a UUID v7 (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Allocate a fresh id. UUID v7 makes allocation lock-free and ordered.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a NodeId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// What a node in the provenance graph represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Data,
    FunctionProcess,
    ChainProcess,
    CalculationProcess,
}

impl NodeKind {
    pub fn is_process(&self) -> bool {
        !matches!(self, NodeKind::Data)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Data => "data",
            NodeKind::FunctionProcess => "function_process",
            NodeKind::ChainProcess => "chain_process",
            NodeKind::CalculationProcess => "calculation_process",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(NodeKind::Data),
            "function_process" => Ok(NodeKind::FunctionProcess),
            "chain_process" => Ok(NodeKind::ChainProcess),
            "calculation_process" => Ok(NodeKind::CalculationProcess),
            other => Err(format!("invalid node kind: '{other}'")),
        }
    }
}

/// A record in the provenance graph.
///
/// DATA nodes are sealed at creation and never change. PROCESS nodes are
/// sealed when their execution reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Callable name for process nodes, optional caption for data nodes.
    pub label: String,
    /// Opaque value for DATA nodes; static attributes for PROCESS nodes.
    pub payload: serde_json::Value,
    pub sealed: bool,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// A sealed DATA node holding `value`.
    pub fn data(value: serde_json::Value) -> Self {
        Self {
            id: NodeId::new(),
            kind: NodeKind::Data,
            label: String::new(),
            payload: value,
            sealed: true,
            created_at: Utc::now(),
        }
    }

    /// An unsealed PROCESS node for the callable `label`.
    pub fn process(kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            label: label.into(),
            payload: serde_json::Value::Null,
            sealed: false,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Relationship carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// data -> process: the data was an argument of the process.
    Input,
    /// process -> data: the process created the data.
    Output,
    /// process -> process: caller to callee.
    Call,
    /// process -> data: the process handed back data it did not create.
    Return,
}

impl EdgeKind {
    /// Edges that name a process result (the labels form `outputs_sealed`).
    pub fn is_result(&self) -> bool {
        matches!(self, EdgeKind::Output | EdgeKind::Return)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Input => "input",
            EdgeKind::Output => "output",
            EdgeKind::Call => "call",
            EdgeKind::Return => "return",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(EdgeKind::Input),
            "output" => Ok(EdgeKind::Output),
            "call" => Ok(EdgeKind::Call),
            "return" => Ok(EdgeKind::Return),
            other => Err(format!("invalid edge kind: '{other}'")),
        }
    }
}

/// A directed, labeled, append-only relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    /// Argument name for INPUT, result name for OUTPUT/RETURN, callee label for CALL.
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind, label: impl Into<String>) -> Self {
        Self {
            source,
            target,
            kind,
            label: label.into(),
            created_at: Utc::now(),
        }
    }
}

/// One neighbor of a node, as replayed by `get_inputs` / `get_outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub kind: EdgeKind,
    pub label: String,
    pub node: NodeId,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Ordered result set of a process: `label -> data node`.
///
/// Order is emission order. Labels are unique within one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(Vec<(String, NodeId)>);

impl Outputs {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a result. Returns `false` (and leaves the set unchanged) if the
    /// label is already present.
    pub fn insert(&mut self, label: impl Into<String>, node: NodeId) -> bool {
        let label = label.into();
        if self.contains(&label) {
            return false;
        }
        self.0.push((label, node));
        true
    }

    pub fn get(&self, label: &str) -> Option<NodeId> {
        self.0.iter().find(|(l, _)| l == label).map(|(_, n)| *n)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|(l, _)| l == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.0.iter().map(|(l, n)| (l.as_str(), *n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, NodeId)> for Outputs {
    fn from_iter<T: IntoIterator<Item = (String, NodeId)>>(iter: T) -> Self {
        let mut out = Outputs::new();
        for (label, node) in iter {
            out.insert(label, node);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_id_roundtrips_through_string() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn node_ids_are_time_ordered() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(a < b);
    }

    #[test]
    fn data_nodes_are_sealed_at_creation() {
        let node = Node::data(json!(3));
        assert!(node.sealed);
        assert_eq!(node.kind, NodeKind::Data);

        let process = Node::process(NodeKind::ChainProcess, "eos");
        assert!(!process.sealed);
        assert!(process.kind.is_process());
    }

    #[test]
    fn kind_strings_parse_back() {
        for kind in [
            NodeKind::Data,
            NodeKind::FunctionProcess,
            NodeKind::ChainProcess,
            NodeKind::CalculationProcess,
        ] {
            assert_eq!(kind.as_str().parse::<NodeKind>().unwrap(), kind);
        }
        assert_eq!("return".parse::<EdgeKind>().unwrap(), EdgeKind::Return);
        assert!("sideways".parse::<EdgeKind>().is_err());
    }

    #[test]
    fn outputs_reject_duplicate_labels() {
        let mut outputs = Outputs::new();
        let first = NodeId::new();
        assert!(outputs.insert("result", first));
        assert!(!outputs.insert("result", NodeId::new()));
        assert_eq!(outputs.get("result"), Some(first));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn outputs_keep_emission_order() {
        let outputs: Outputs = ["b", "a", "c"]
            .iter()
            .map(|l| (l.to_string(), NodeId::new()))
            .collect();
        let labels: Vec<_> = outputs.labels().collect();
        assert_eq!(labels, vec!["b", "a", "c"]);
    }
}
