//! Provenance graph, function wrapper, and chain engine for Strata.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus everything that runs on top of them: the
//! provenance graph facade, the function wrapper, the step-outline chain
//! engine, and the in-process daemon. It depends only on `strata-types` --
//! never on `strata-infra` or any database/IO crate.

pub mod calculation;
pub mod chain;
pub mod checkpoint;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event;
pub mod function;
pub mod provenance;
pub mod repository;

#[cfg(test)]
pub(crate) mod testing;
