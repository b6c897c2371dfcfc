//! Error types shared by the gate crates.

use thiserror::Error;

/// Error type for key material, certificate generation and message encoding.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Key generation failed (e.g., insufficient entropy)
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Self-signed certificate could not be produced
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Response envelope is missing a required field
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for gate-common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

impl From<rcgen::Error> for CommonError {
    fn from(e: rcgen::Error) -> Self {
        CommonError::Certificate(e.to_string())
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(e: serde_json::Error) -> Self {
        CommonError::Serialization(e.to_string())
    }
}
