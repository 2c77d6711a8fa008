//! External calculation boundary.
//!
//! Calculations run outside the engine (a local command, a cluster job).
//! The engine hands a backend a [`CalculationRequest`], receives a
//! [`JobId`], and polls it until the job reports a terminal [`JobState`].

pub mod backend;
pub mod box_backend;

pub use backend::{
    CalculationBackend, CalculationError, CalculationRequest, CalculationSpec, DisabledBackend,
    JobId, JobState,
};
pub use box_backend::BoxCalculationBackend;
