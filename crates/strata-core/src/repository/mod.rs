//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (strata-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` provides a process-local implementation used
//! by tests and embedded engines.

pub mod memory;
pub mod provenance;

pub use memory::InMemoryProvenanceRepository;
pub use provenance::ProvenanceRepository;
