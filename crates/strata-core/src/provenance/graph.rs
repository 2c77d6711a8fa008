use std::sync::Arc;

use serde_json::Value;
use strata_types::error::RepositoryError;
use strata_types::node::{Edge, EdgeKind, Link, Node, NodeId, NodeKind, Outputs};

use crate::repository::ProvenanceRepository;

/// Append-only view of the provenance graph.
///
/// Cheap to clone: the repository is shared behind an `Arc`.
pub struct ProvenanceGraph<R: ProvenanceRepository> {
    repo: Arc<R>,
}

impl<R: ProvenanceRepository> Clone for ProvenanceGraph<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: ProvenanceRepository> ProvenanceGraph<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo: Arc::new(repo),
        }
    }

    pub fn from_shared(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn shared_repo(&self) -> Arc<R> {
        Arc::clone(&self.repo)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create a node. DATA nodes are sealed immediately.
    pub async fn create_node(
        &self,
        kind: NodeKind,
        label: &str,
        payload: Value,
    ) -> Result<NodeId, RepositoryError> {
        let mut node = if kind.is_process() {
            Node::process(kind, label)
        } else {
            Node::data(Value::Null)
        };
        node.label = label.to_string();
        node.payload = payload;
        self.repo.insert_node(&node).await?;
        Ok(node.id)
    }

    /// Store `value` as a new sealed DATA node.
    pub async fn store(&self, value: Value) -> Result<NodeId, RepositoryError> {
        let node = Node::data(value);
        self.repo.insert_node(&node).await?;
        tracing::trace!(node_id = %node.id, "stored data node");
        Ok(node.id)
    }

    pub async fn create_edge(
        &self,
        source: NodeId,
        target: NodeId,
        kind: EdgeKind,
        label: &str,
    ) -> Result<(), RepositoryError> {
        self.repo
            .insert_edge(&Edge::new(source, target, kind, label))
            .await
    }

    pub async fn seal_node(&self, id: NodeId) -> Result<(), RepositoryError> {
        self.repo.seal_node(&id).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get a node, failing with `NotFound` if it does not exist.
    pub async fn node(&self, id: NodeId) -> Result<Node, RepositoryError> {
        self.repo.get_node(&id).await?.ok_or(RepositoryError::NotFound)
    }

    /// Payload of a DATA node.
    pub async fn value(&self, id: NodeId) -> Result<Value, RepositoryError> {
        let node = self.node(id).await?;
        if node.kind != NodeKind::Data {
            return Err(RepositoryError::Query(format!(
                "node {id} is a {}, not a data node",
                node.kind
            )));
        }
        Ok(node.payload)
    }

    /// Incoming edges of `id`, in creation order.
    pub async fn get_inputs(&self, id: NodeId) -> Result<Vec<Link>, RepositoryError> {
        let edges = self.repo.list_incoming(&id).await?;
        Ok(edges
            .into_iter()
            .map(|e| Link {
                kind: e.kind,
                label: e.label,
                node: e.source,
            })
            .collect())
    }

    /// Outgoing edges of `id`, in creation order.
    pub async fn get_outputs(&self, id: NodeId) -> Result<Vec<Link>, RepositoryError> {
        let edges = self.repo.list_outgoing(&id).await?;
        Ok(edges
            .into_iter()
            .map(|e| Link {
                kind: e.kind,
                label: e.label,
                node: e.target,
            })
            .collect())
    }

    /// Named arguments of a process (its INPUT edges), in call order.
    pub async fn arguments(&self, process_id: NodeId) -> Result<Vec<(String, NodeId)>, RepositoryError> {
        Ok(self
            .get_inputs(process_id)
            .await?
            .into_iter()
            .filter(|l| l.kind == EdgeKind::Input)
            .map(|l| (l.label, l.node))
            .collect())
    }

    /// Result set of a process: its OUTPUT and RETURN edges, in emission order.
    pub async fn results(&self, process_id: NodeId) -> Result<Outputs, RepositoryError> {
        Ok(self
            .get_outputs(process_id)
            .await?
            .into_iter()
            .filter(|l| l.kind.is_result())
            .map(|l| (l.label, l.node))
            .collect())
    }

    /// The process that created a DATA node, if any.
    pub async fn producer(&self, data_id: NodeId) -> Result<Option<NodeId>, RepositoryError> {
        Ok(self
            .get_inputs(data_id)
            .await?
            .into_iter()
            .find(|l| l.kind == EdgeKind::Output)
            .map(|l| l.node))
    }

    /// Processes called by `process_id`, in call order.
    pub async fn callees(&self, process_id: NodeId) -> Result<Vec<NodeId>, RepositoryError> {
        Ok(self
            .get_outputs(process_id)
            .await?
            .into_iter()
            .filter(|l| l.kind == EdgeKind::Call)
            .map(|l| l.node)
            .collect())
    }

    pub async fn caller(&self, process_id: NodeId) -> Result<Option<NodeId>, RepositoryError> {
        Ok(self
            .get_inputs(process_id)
            .await?
            .into_iter()
            .find(|l| l.kind == EdgeKind::Call)
            .map(|l| l.node))
    }
}
