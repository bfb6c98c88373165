use thiserror::Error;

/// Common error type for SysBus gateway components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Value out of range: {0}")]
    ValueRange(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
