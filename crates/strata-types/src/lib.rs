//! Shared domain types for Strata.
//!
//! This crate contains the provenance graph primitives (nodes, edges, links),
//! process records with their persisted chain context, lifecycle events, the
//! global configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod node;
pub mod process;
