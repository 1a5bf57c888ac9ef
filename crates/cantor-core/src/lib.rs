//! Computation model and shared types for the cantor speech toolkit.
//!
//! This crate provides the in-memory IR that the compiler produces and the
//! optimizer mutates:
//! - The computation itself (`Computation`, `Command`, `Submatrix`)
//! - Network components with capability flags (`Component`, `Network`)
//! - Input/output bindings (`IoBindings`)
//! - A reference executor used to validate transformations (`executor`)

pub mod component;
pub mod computation;
pub mod executor;
pub mod network;

// Re-export commonly used types
pub use component::Component;
pub use computation::{
    Command, Computation, ComponentId, IoBindings, MatrixId, MatrixInfo, MatrixInit, Submatrix,
    SubmatrixId,
};
pub use executor::Executor;
pub use network::Network;

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cantor-core operations.
///
/// A malformed computation cannot be executed or optimized safely, so every
/// consumer treats these errors as fatal and propagates them to the host
/// pipeline instead of continuing with a partial result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid computation: {0}")]
    InvalidComputation(String),

    #[error("Matrix {0} not found")]
    MatrixNotFound(usize),

    #[error("Submatrix {0} not found")]
    SubmatrixNotFound(usize),

    #[error("Component {0} not found")]
    ComponentNotFound(usize),

    #[error("Execution error: {0}")]
    Execution(String),
}
