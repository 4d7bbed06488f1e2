//! Relay transport contract
//!
//! A relay is reached either over a persistent stream (`wss://`, `ws://`) or
//! through plain request/response calls. Both expose the same
//! [`RelayTransport`] surface so callers never care which one they hold.

use crate::framing::FrameError;
use async_trait::async_trait;
use scp_core::{FetchRequest, ProtocolEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Transport errors
///
/// Cloneable so that one failed fetch can be handed to every caller sharing
/// the same cached in-flight result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport shut down")]
    Shutdown,
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Relay rejected request: {0}")]
    Relay(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Request {0} still pending after polling limit")]
    PollExhausted(String),
    #[error("Request id already in flight: {0}")]
    DuplicateRequest(String),
}

impl TransportError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::PollExhausted(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Outcome of submitting one event to one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub relay: String,
}

impl SubmitResponse {
    pub fn accepted(relay: &str, message: Option<String>) -> Self {
        Self {
            success: true,
            message,
            relay: relay.to_string(),
        }
    }

    pub fn rejected(relay: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            relay: relay.to_string(),
        }
    }
}

/// Fetch and submit against a single relay
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Relay URL this transport talks to
    fn url(&self) -> &str;

    /// Every event matching any of `requests`, in arrival order
    async fn fetch_events(&self, requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError>;

    /// Relay-side cached query
    async fn fetch_cached_events(
        &self,
        event_type: &str,
        params: Value,
    ) -> Result<Vec<ProtocolEvent>, TransportError> {
        let request = FetchRequest::Cached {
            event_type: event_type.to_string(),
            params,
        };
        self.fetch_events(std::slice::from_ref(&request)).await
    }

    /// Publish a signed event
    async fn submit_event(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError>;
}

/// How a relay URL is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Request,
}

impl TransportKind {
    /// Chosen by URL scheme: `wss://` and `ws://` stream, anything else
    /// goes through request/response calls.
    pub fn for_url(url: &str) -> Self {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("wss://") || lower.starts_with("ws://") {
            Self::Stream
        } else {
            Self::Request
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_by_scheme() {
        assert_eq!(TransportKind::for_url("wss://relay.example"), TransportKind::Stream);
        assert_eq!(TransportKind::for_url("WS://127.0.0.1:7000"), TransportKind::Stream);
        assert_eq!(TransportKind::for_url("https://relay.example"), TransportKind::Request);
        assert_eq!(TransportKind::for_url("http://localhost:8080"), TransportKind::Request);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::ConnectionClosed.is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransportError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(TransportError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!TransportError::Http { status: 403, body: String::new() }.is_retryable());
        assert!(!TransportError::Relay("blocked".into()).is_retryable());
        assert!(!TransportError::Shutdown.is_retryable());
    }

    #[test]
    fn test_submit_response_json() {
        let ok = SubmitResponse::accepted("wss://r", None);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"success": true, "relay": "wss://r"})
        );
        let rejected = SubmitResponse::rejected("wss://r", "duplicate");
        assert_eq!(rejected.message.as_deref(), Some("duplicate"));
        assert!(!rejected.success);
    }
}
