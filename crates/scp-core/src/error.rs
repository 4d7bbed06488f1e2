//! Error types for scp-core

use crate::crypto::CryptoError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// scp-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// JSON encoding/decoding error (event content, scp tag payloads)
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Event kind does not match what the parser expects
    #[error("unexpected event kind: expected {expected}, got {actual}")]
    UnexpectedKind { expected: u32, actual: u32 },

    /// Malformed community or channel URI
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// Missing required tag or field
    #[error("missing required field: {0}")]
    MissingField(String),
}
