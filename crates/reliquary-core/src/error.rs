//! Error types for Reliquary core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Reliquary core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed hexadecimal artifact identifier
    #[error("invalid artifact id: {0}")]
    InvalidArtifactId(String),

    /// Hash mismatch (computed != transmitted ID)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Token escape sequence error
    #[error("bad token encoding: {0}")]
    BadEncoding(String),

    /// Date outside the representable range
    #[error("unrepresentable date: {0}")]
    BadDate(f64),
}
