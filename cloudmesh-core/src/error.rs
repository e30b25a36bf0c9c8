//! Error types for cloudmesh

use thiserror::Error;

/// Errors surfaced by the reconstruction pipeline.
///
/// Problems local to one point or one pivot are recorded as flags and never
/// become an `Error`; these variants are reserved for conditions that make
/// the whole run meaningless.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Reconstruction cancelled")]
    Cancelled,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Common result type for cloudmesh operations
pub type Result<T> = std::result::Result<T, Error>;
