//! Provenance graph facade and lineage queries.
//!
//! `ProvenanceGraph` wraps a [`ProvenanceRepository`](crate::repository::ProvenanceRepository)
//! with the operations the engine and the CLI need: creating and sealing
//! nodes, appending labeled edges, and replaying a node's neighbors in
//! creation order. `lineage` adds ancestry queries and `petgraph` subgraphs.

pub mod graph;
pub mod lineage;

pub use graph::ProvenanceGraph;
pub use lineage::{Lineage, Walk};
