//! Lattice error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The resource specified in the request is not found.
    #[error("the resource specified in the request is not found")]
    ResourceNotFound,
    /// The target node or service is not currently available.
    #[error("the target node or service is not available: {0}")]
    Unavailable(String),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}
