//! Error types for Tessera Core.

use thiserror::Error;

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// Caller supplied an invalid combination of forward inputs.
    #[error("validation error: {0}")]
    Validation(String),

    /// Model configuration is inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// Model construction or weight loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Attention computation error.
    #[error("attention error: {0}")]
    Attention(String),

    /// Model registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
