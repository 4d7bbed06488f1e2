//! Error types for scp-client

use scp_core::CryptoError;
use scp_net::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed event, descriptor or tag payload
    #[error("protocol error: {0}")]
    Protocol(#[from] scp_core::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("signing failed: {0}")]
    Signing(String),

    /// Operation needs data the descriptor does not carry
    #[error("unsupported: {0}")]
    Unsupported(String),
}
