//! Error types for ring-attention.

use thiserror::Error;

/// Result type alias for ring-attention operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ring-attention.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, rejected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shape or topology precondition violated at call time.
    #[error("shape error: {0}")]
    Shape(String),

    /// A ring exchange or collective failed to complete.
    #[error("transport error: {0}")]
    Transport(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
