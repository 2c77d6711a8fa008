//! Observability setup shared by Strata binaries.

pub mod tracing_setup;
