//! Infrastructure layer for Strata.
//!
//! Contains implementations of the ports defined in `strata-core`: the
//! SQLite provenance repository, a calculation backend that runs local
//! executables, configuration loading, and data-directory resolution.

pub mod calculation;
pub mod config;
pub mod filesystem;
pub mod sqlite;
