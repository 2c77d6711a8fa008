//! Process-local provenance repository.
//!
//! Holds nodes and records in `DashMap`s and the edge log behind a mutex so
//! the uniqueness checks and the append happen atomically. Nothing survives
//! the process; use the SQLite repository in strata-infra for durability.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use strata_types::error::RepositoryError;
use strata_types::node::{Edge, EdgeKind, Node, NodeId};
use strata_types::process::{ProcessFilter, ProcessRecord};

use super::provenance::ProvenanceRepository;

#[derive(Default)]
struct EdgeLog {
    edges: Vec<Edge>,
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    result_labels: HashSet<(NodeId, String)>,
    produced: HashSet<NodeId>,
}

/// In-memory implementation of [`ProvenanceRepository`].
#[derive(Default)]
pub struct InMemoryProvenanceRepository {
    nodes: DashMap<NodeId, Node>,
    processes: DashMap<NodeId, ProcessRecord>,
    edges: Mutex<EdgeLog>,
}

impl InMemoryProvenanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn edge_log(&self) -> Result<std::sync::MutexGuard<'_, EdgeLog>, RepositoryError> {
        self.edges
            .lock()
            .map_err(|_| RepositoryError::Query("edge log lock poisoned".to_string()))
    }

    fn collect(&self, log: &EdgeLog, index: Option<&Vec<usize>>) -> Vec<Edge> {
        index
            .map(|positions| positions.iter().map(|&i| log.edges[i].clone()).collect())
            .unwrap_or_default()
    }
}

impl ProvenanceRepository for InMemoryProvenanceRepository {
    async fn insert_node(&self, node: &Node) -> Result<(), RepositoryError> {
        match self.nodes.entry(node.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node {} already exists",
                node.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(node.clone());
                Ok(())
            }
        }
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, RepositoryError> {
        Ok(self.nodes.get(id).map(|n| n.clone()))
    }

    async fn seal_node(&self, id: &NodeId) -> Result<(), RepositoryError> {
        let mut node = self.nodes.get_mut(id).ok_or(RepositoryError::NotFound)?;
        node.sealed = true;
        Ok(())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), RepositoryError> {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            return Err(RepositoryError::NotFound);
        }

        let mut log = self.edge_log()?;
        let label_key = (edge.source, edge.label.clone());
        if edge.kind.is_result() && log.result_labels.contains(&label_key) {
            return Err(RepositoryError::Conflict(format!(
                "{} already has a result labeled '{}'",
                edge.source, edge.label
            )));
        }
        if edge.kind == EdgeKind::Output && log.produced.contains(&edge.target) {
            return Err(RepositoryError::Conflict(format!(
                "data node {} already has a producer",
                edge.target
            )));
        }

        if edge.kind.is_result() {
            log.result_labels.insert(label_key);
        }
        if edge.kind == EdgeKind::Output {
            log.produced.insert(edge.target);
        }
        let position = log.edges.len();
        log.edges.push(edge.clone());
        log.outgoing.entry(edge.source).or_default().push(position);
        log.incoming.entry(edge.target).or_default().push(position);
        Ok(())
    }

    async fn list_incoming(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        let log = self.edge_log()?;
        Ok(self.collect(&log, log.incoming.get(id)))
    }

    async fn list_outgoing(&self, id: &NodeId) -> Result<Vec<Edge>, RepositoryError> {
        let log = self.edge_log()?;
        Ok(self.collect(&log, log.outgoing.get(id)))
    }

    async fn insert_process(&self, record: &ProcessRecord) -> Result<(), RepositoryError> {
        if !self.nodes.contains_key(&record.id) {
            return Err(RepositoryError::NotFound);
        }
        match self.processes.entry(record.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "process record {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_process(&self, id: &NodeId) -> Result<Option<ProcessRecord>, RepositoryError> {
        Ok(self.processes.get(id).map(|r| r.clone()))
    }

    async fn update_process(&self, record: &ProcessRecord) -> Result<u64, RepositoryError> {
        let mut stored = self
            .processes
            .get_mut(&record.id)
            .ok_or(RepositoryError::NotFound)?;

        if stored.is_sealed() {
            return Err(RepositoryError::Conflict(format!(
                "process {} is sealed ({})",
                record.id, stored.status
            )));
        }
        if stored.revision != record.revision {
            return Err(RepositoryError::Conflict(format!(
                "process {} revision {} != expected {}",
                record.id, stored.revision, record.revision
            )));
        }

        let revision = record.revision + 1;
        let mut next = record.clone();
        next.revision = revision;
        *stored = next;

        if record.status.is_terminal()
            && let Some(mut node) = self.nodes.get_mut(&record.id)
        {
            node.sealed = true;
        }
        Ok(revision)
    }

    async fn list_processes(
        &self,
        filter: &ProcessFilter,
    ) -> Result<Vec<ProcessRecord>, RepositoryError> {
        let mut records: Vec<ProcessRecord> = self
            .processes
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        if let Some(limit) = filter.limit {
            records.truncate(limit as usize);
        }
        Ok(records)
    }
}
