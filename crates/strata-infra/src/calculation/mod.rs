//! Calculation backends that run outside the engine process.

pub mod local;

pub use local::LocalProcessBackend;
