//! Lineage queries over the provenance graph.
//!
//! Ancestry walks follow edges backwards (data <- producer <- inputs <-
//! caller). `subgraph` materializes a bounded neighborhood as a `petgraph`
//! `DiGraph` so it can be checked for cycles and rendered as a tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use strata_types::error::RepositoryError;
use strata_types::node::{EdgeKind, Node, NodeId, NodeKind};
use strata_types::process::ProcessStatus;

use super::graph::ProvenanceGraph;
use crate::repository::ProvenanceRepository;

/// Which edges a subgraph walk follows from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Incoming edges only: what the root was derived from.
    Ancestors,
    /// Outgoing edges only: what was derived from the root.
    Descendants,
    Both,
}

/// Edge weight inside a [`Lineage`] graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageEdge {
    pub kind: EdgeKind,
    pub label: String,
}

/// A bounded neighborhood of the provenance graph.
#[derive(Debug)]
pub struct Lineage {
    graph: DiGraph<Node, LineageEdge>,
    root: NodeIndex,
    index: HashMap<NodeId, NodeIndex>,
    status: HashMap<NodeId, ProcessStatus>,
}

impl Lineage {
    pub fn root(&self) -> NodeId {
        self.graph[self.root].id
    }

    pub fn graph(&self) -> &DiGraph<Node, LineageEdge> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Status of a process node in the subgraph, if it has a record.
    pub fn status(&self, id: NodeId) -> Option<ProcessStatus> {
        self.status.get(&id).copied()
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// Render the descendants of the root as an indented tree.
    ///
    /// Shared nodes are printed once per path; cycles (which a valid store
    /// never contains) are cut at the first repeat.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.describe(self.root));
        let mut path = HashSet::new();
        path.insert(self.root);
        self.render_children(self.root, "", &mut path, &mut out);
        out
    }

    fn render_children(
        &self,
        idx: NodeIndex,
        prefix: &str,
        path: &mut HashSet<NodeIndex>,
        out: &mut String,
    ) {
        // petgraph iterates adjacency newest-first.
        let mut children: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();
        children.reverse();

        let count = children.len();
        for (i, (child, edge)) in children.into_iter().enumerate() {
            let last = i + 1 == count;
            let branch = if last { "└── " } else { "├── " };
            let _ = writeln!(
                out,
                "{prefix}{branch}{} {}: {}",
                edge.kind,
                edge.label,
                self.describe(child)
            );
            if path.insert(child) {
                let next = format!("{prefix}{}", if last { "    " } else { "│   " });
                self.render_children(child, &next, path, out);
                path.remove(&child);
            }
        }
    }

    fn describe(&self, idx: NodeIndex) -> String {
        let node = &self.graph[idx];
        match node.kind {
            NodeKind::Data => {
                let mut value = node.payload.to_string();
                if value.chars().count() > 40 {
                    value = value.chars().take(37).collect::<String>() + "...";
                }
                format!("data {value} ({})", node.id)
            }
            kind => {
                let status = self
                    .status
                    .get(&node.id)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("{kind} {} [{status}] ({})", node.label, node.id)
            }
        }
    }
}

impl<R: ProvenanceRepository> ProvenanceGraph<R> {
    /// Every node `id` was derived from, nearest first.
    pub async fn ancestors(&self, id: NodeId) -> Result<Vec<NodeId>, RepositoryError> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        let mut ancestors = Vec::new();

        while let Some(current) = queue.pop_front() {
            for link in self.get_inputs(current).await? {
                if seen.insert(link.node) {
                    ancestors.push(link.node);
                    queue.push_back(link.node);
                }
            }
        }
        Ok(ancestors)
    }

    /// Whether `a` and `b` share an ancestor (or one derives from the other).
    pub async fn related(&self, a: NodeId, b: NodeId) -> Result<bool, RepositoryError> {
        if a == b {
            return Ok(true);
        }
        let mut left: HashSet<NodeId> = self.ancestors(a).await?.into_iter().collect();
        left.insert(a);
        if left.contains(&b) {
            return Ok(true);
        }
        let right = self.ancestors(b).await?;
        Ok(right.iter().any(|n| left.contains(n)))
    }

    /// Collect the nodes within `depth` hops of `root` (following `walk`)
    /// and every edge between them.
    pub async fn subgraph(
        &self,
        root: NodeId,
        depth: usize,
        walk: Walk,
    ) -> Result<Lineage, RepositoryError> {
        let mut order = vec![root];
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            let mut neighbors = Vec::new();
            if matches!(walk, Walk::Descendants | Walk::Both) {
                neighbors.extend(self.get_outputs(current).await?.into_iter().map(|l| l.node));
            }
            if matches!(walk, Walk::Ancestors | Walk::Both) {
                neighbors.extend(self.get_inputs(current).await?.into_iter().map(|l| l.node));
            }
            for next in neighbors {
                if seen.insert(next) {
                    order.push(next);
                    queue.push_back((next, level + 1));
                }
            }
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut status = HashMap::new();
        for id in &order {
            let node = self.node(*id).await?;
            if node.kind.is_process()
                && let Some(record) = self.repo().get_process(id).await?
            {
                status.insert(*id, record.status);
            }
            index.insert(*id, graph.add_node(node));
        }

        // Each edge is added once, from its source.
        for id in &order {
            for link in self.get_outputs(*id).await? {
                if let Some(&target) = index.get(&link.node) {
                    graph.add_edge(
                        index[id],
                        target,
                        LineageEdge {
                            kind: link.kind,
                            label: link.label,
                        },
                    );
                }
            }
        }

        Ok(Lineage {
            root: index[&root],
            graph,
            index,
            status,
        })
    }

    /// Text rendering of everything derived from `root`, `depth` levels deep.
    pub async fn render_tree(&self, root: NodeId, depth: usize) -> Result<String, RepositoryError> {
        Ok(self.subgraph(root, depth, Walk::Descendants).await?.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryProvenanceRepository;
    use serde_json::{Value, json};

    type Graph = ProvenanceGraph<InMemoryProvenanceRepository>;

    /// x, y -> add -> sum -> double -> twice
    async fn pipeline(graph: &Graph) -> (NodeId, NodeId, NodeId, NodeId, NodeId) {
        let x = graph.store(json!(1)).await.unwrap();
        let y = graph.store(json!(2)).await.unwrap();
        let add = graph
            .create_node(NodeKind::FunctionProcess, "add", Value::Null)
            .await
            .unwrap();
        graph.create_edge(x, add, EdgeKind::Input, "x").await.unwrap();
        graph.create_edge(y, add, EdgeKind::Input, "y").await.unwrap();
        let sum = graph.store(json!(3)).await.unwrap();
        graph.create_edge(add, sum, EdgeKind::Output, "sum").await.unwrap();

        let double = graph
            .create_node(NodeKind::FunctionProcess, "double", Value::Null)
            .await
            .unwrap();
        graph.create_edge(sum, double, EdgeKind::Input, "value").await.unwrap();
        let twice = graph.store(json!(6)).await.unwrap();
        graph
            .create_edge(double, twice, EdgeKind::Output, "result")
            .await
            .unwrap();
        (x, y, sum, twice, add)
    }

    #[tokio::test]
    async fn ancestors_walk_back_to_inputs() {
        let graph = Graph::new(InMemoryProvenanceRepository::new());
        let (x, y, sum, twice, add) = pipeline(&graph).await;

        let ancestors = graph.ancestors(twice).await.unwrap();
        for id in [x, y, sum, add] {
            assert!(ancestors.contains(&id));
        }
        assert!(graph.ancestors(x).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn related_detects_shared_ancestry() {
        let graph = Graph::new(InMemoryProvenanceRepository::new());
        let (x, y, _sum, twice, _add) = pipeline(&graph).await;
        let unrelated = graph.store(json!("other")).await.unwrap();

        assert!(graph.related(twice, x).await.unwrap());
        assert!(graph.related(y, twice).await.unwrap());
        assert!(!graph.related(twice, unrelated).await.unwrap());
        // Two independent inputs share nothing.
        assert!(!graph.related(x, y).await.unwrap());
    }

    #[tokio::test]
    async fn subgraph_respects_depth() {
        let graph = Graph::new(InMemoryProvenanceRepository::new());
        let (x, _y, sum, twice, add) = pipeline(&graph).await;

        let near = graph.subgraph(x, 2, Walk::Descendants).await.unwrap();
        assert!(near.contains(add));
        assert!(near.contains(sum));
        assert!(!near.contains(twice));

        let full = graph.subgraph(twice, 10, Walk::Both).await.unwrap();
        assert_eq!(full.node_count(), 6);
        assert_eq!(full.edge_count(), 5);
        assert!(full.is_acyclic());
        assert_eq!(full.root(), twice);
    }

    #[tokio::test]
    async fn render_tree_lists_edges_with_labels() {
        let graph = Graph::new(InMemoryProvenanceRepository::new());
        let (x, ..) = pipeline(&graph).await;

        let text = graph.render_tree(x, 4).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].starts_with("data 1"));
        assert!(lines[1].contains("input x: function_process add"));
        assert!(lines[2].contains("output sum: data 3"));
        assert!(text.contains("result: data 6"));
    }
}
