//! Provenance repository trait definition.
//!
//! One storage interface covers the append-only graph (nodes and edges) and
//! the mutable process records that hang off PROCESS nodes. The two must
//! live in the same store: sealing a record also seals its node.

use strata_types::error::RepositoryError;
use strata_types::node::{Edge, Node, NodeId};
use strata_types::process::{ProcessFilter, ProcessRecord};

/// Repository trait for provenance persistence.
///
/// Implementations must support concurrent appenders and enforce these rules
/// at write time, returning `RepositoryError::Conflict` on violation:
///
/// - two OUTPUT/RETURN edges from one source may not share a label;
/// - a DATA node may have at most one incoming OUTPUT edge;
/// - a sealed process record is never updated;
/// - `update_process` is a compare-and-set on `revision`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ProvenanceRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Insert a new node. Fails with `Conflict` if the id already exists.
    fn insert_node(
        &self,
        node: &Node,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a node by id.
    fn get_node(
        &self,
        id: &NodeId,
    ) -> impl std::future::Future<Output = Result<Option<Node>, RepositoryError>> + Send;

    /// Mark a node sealed. Sealing twice is a no-op; `NotFound` if missing.
    fn seal_node(
        &self,
        id: &NodeId,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    /// Append an edge. Both endpoints must exist (`NotFound` otherwise).
    fn insert_edge(
        &self,
        edge: &Edge,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Edges pointing at `id`, in creation order.
    fn list_incoming(
        &self,
        id: &NodeId,
    ) -> impl std::future::Future<Output = Result<Vec<Edge>, RepositoryError>> + Send;

    /// Edges leaving `id`, in creation order.
    fn list_outgoing(
        &self,
        id: &NodeId,
    ) -> impl std::future::Future<Output = Result<Vec<Edge>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Process records
    // -----------------------------------------------------------------------

    /// Create a process record. Its node must already exist.
    fn insert_process(
        &self,
        record: &ProcessRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a process record by its node id.
    fn get_process(
        &self,
        id: &NodeId,
    ) -> impl std::future::Future<Output = Result<Option<ProcessRecord>, RepositoryError>> + Send;

    /// Replace a process record if the stored revision equals
    /// `record.revision` and the stored record is not sealed.
    ///
    /// On success the stored revision becomes `record.revision + 1`, which is
    /// returned. When `record.status` is terminal the process node is sealed
    /// in the same write.
    fn update_process(
        &self,
        record: &ProcessRecord,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// List process records matching `filter`, ordered by creation time.
    fn list_processes(
        &self,
        filter: &ProcessFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessRecord>, RepositoryError>> + Send;
}
