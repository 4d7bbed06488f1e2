//! Request/response relay transport
//!
//! Plain JSON-over-HTTP calls. A relay may answer a slow query with
//! `{"requestId": ...}` instead of a result; the caller then polls
//! `GET {relay}/poll/{requestId}` until the result is ready or the attempt
//! budget runs out.

use crate::transport::{RelayTransport, SubmitResponse, TransportError};
use async_trait::async_trait;
use scp_core::{FetchRequest, ProtocolEvent};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// JSON request/response calls
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// POST `body` as JSON and return the decoded JSON reply
    async fn post_json(&self, url: &str, body: &Value, auth: Option<&str>) -> Result<Value, TransportError>;

    /// GET and return the decoded JSON reply
    async fn get_json(&self, url: &str, auth: Option<&str>) -> Result<Value, TransportError>;
}

/// [`ApiTransport`] backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { client, timeout })
    }

    async fn send(&self, request: reqwest::RequestBuilder, auth: Option<&str>) -> Result<Value, TransportError> {
        let request = match auth {
            Some(auth) => request.header(reqwest::header::AUTHORIZATION, auth),
            None => request,
        };
        let response = request.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid JSON reply: {e}")))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::ConnectionFailed(err.to_string())
        }
    }
}

#[async_trait]
impl ApiTransport for HttpApi {
    async fn post_json(&self, url: &str, body: &Value, auth: Option<&str>) -> Result<Value, TransportError> {
        trace!(url, "POST");
        self.send(self.client.post(url).json(body), auth).await
    }

    async fn get_json(&self, url: &str, auth: Option<&str>) -> Result<Value, TransportError> {
        trace!(url, "GET");
        self.send(self.client.get(url), auth).await
    }
}

/// Bounds for polling a deferred result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            interval: Duration::from_millis(500),
        }
    }
}

/// `requestId` of a reply that only acknowledges a deferred query
fn deferred_request_id(reply: &Value) -> Option<&str> {
    let obj = reply.as_object()?;
    if ["data", "events", "error", "success"].iter().any(|k| obj.contains_key(*k)) {
        return None;
    }
    obj.get("requestId").and_then(Value::as_str)
}

/// Follow a deferred reply to its final result
pub async fn resolve_deferred(
    api: &dyn ApiTransport,
    base_url: &str,
    reply: Value,
    auth: Option<&str>,
    poll: PollConfig,
) -> Result<Value, TransportError> {
    let Some(request_id) = deferred_request_id(&reply).map(str::to_string) else {
        return Ok(reply);
    };
    let poll_url = format!("{}/poll/{}", base_url.trim_end_matches('/'), request_id);
    debug!(url = %poll_url, max_attempts = poll.max_attempts, "polling deferred result");

    for attempt in 1..=poll.max_attempts {
        tokio::time::sleep(poll.interval).await;
        let reply = api.get_json(&poll_url, auth).await?;
        if deferred_request_id(&reply).is_none() {
            debug!(url = %poll_url, attempt, "deferred result ready");
            return Ok(reply);
        }
        trace!(url = %poll_url, attempt, "result not ready");
    }
    Err(TransportError::PollExhausted(request_id))
}

/// Events from a fetch reply: `{"events": [...]}`, `{"data": [...]}` or
/// `{"error": ...}`
pub fn events_from_reply(reply: Value) -> Result<Vec<ProtocolEvent>, TransportError> {
    let mut reply = match reply {
        Value::Object(map) => map,
        Value::Array(events) => return Ok(serde_json::from_value(Value::Array(events))?),
        other => return Err(TransportError::Protocol(format!("unexpected fetch reply: {other}"))),
    };
    if let Some(error) = reply.remove("error").filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(TransportError::Relay(message));
    }
    match reply.remove("events").or_else(|| reply.remove("data")) {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(events) => Ok(serde_json::from_value(events)?),
    }
}

/// Relay transport over request/response calls
pub struct RequestTransport {
    url: String,
    api: Arc<dyn ApiTransport>,
    poll: PollConfig,
}

impl RequestTransport {
    pub fn new(url: impl Into<String>, api: Arc<dyn ApiTransport>, poll: PollConfig) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            api,
            poll,
        }
    }

    /// POST `params` to `{relay}/{endpoint}` and follow a deferred reply
    pub async fn call(&self, endpoint: &str, params: &Value, auth: Option<&str>) -> Result<Value, TransportError> {
        let url = format!("{}/{}", self.url, endpoint.trim_start_matches('/'));
        let reply = self.api.post_json(&url, params, auth).await?;
        resolve_deferred(self.api.as_ref(), &self.url, reply, auth, self.poll).await
    }
}

#[async_trait]
impl RelayTransport for RequestTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_events(&self, requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError> {
        let reply = self.call("fetch-events", &json!({ "requests": requests }), None).await?;
        events_from_reply(reply)
    }

    async fn submit_event(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
        let url = format!("{}/submit-event", self.url);
        let reply = self.api.post_json(&url, &serde_json::to_value(event)?, None).await?;
        Ok(SubmitResponse {
            success: reply.get("success").and_then(Value::as_bool).unwrap_or(false),
            message: reply.get("message").and_then(Value::as_str).map(str::to_string),
            relay: self.url.clone(),
        })
    }
}
