//! In-memory relay and HTTP doubles shared by the unit tests

use crate::session::{Ed25519Signer, EventSigner, LocalEventSigner, Session};
use async_trait::async_trait;
use parking_lot::Mutex;
use scp_core::{FetchRequest, Filter, ProtocolEvent, UnsignedEvent};
use scp_net::{ApiTransport, FetchFacade, NetConfig, RelayTransport, RetryPolicy, SubmitResponse, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type RecordedCall = (String, Value, Option<String>);

#[derive(Default)]
struct ApiState {
    replies: HashMap<String, Result<Value, TransportError>>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// Answers POSTs by exact URL; unknown URLs get a 404
#[derive(Clone, Default)]
pub struct RecordingApi {
    state: Arc<ApiState>,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, url: &str, reply: Value) -> Self {
        self.with(url, Ok(reply))
    }

    pub fn fail(self, url: &str, err: TransportError) -> Self {
        self.with(url, Err(err))
    }

    fn with(self, url: &str, result: Result<Value, TransportError>) -> Self {
        let mut state = Arc::try_unwrap(self.state).unwrap_or_default();
        state.replies.insert(url.to_string(), result);
        Self { state: Arc::new(state) }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|(url, _, _)| url).collect()
    }
}

#[async_trait]
impl ApiTransport for RecordingApi {
    async fn post_json(&self, url: &str, body: &Value, auth: Option<&str>) -> Result<Value, TransportError> {
        self.state
            .calls
            .lock()
            .push((url.to_string(), body.clone(), auth.map(str::to_string)));
        match self.state.replies.get(url) {
            Some(result) => result.clone(),
            None => Err(TransportError::Http {
                status: 404,
                body: format!("no route for {url}"),
            }),
        }
    }

    async fn get_json(&self, url: &str, auth: Option<&str>) -> Result<Value, TransportError> {
        self.post_json(url, &Value::Null, auth).await
    }
}

#[derive(Default)]
struct RelayState {
    events: Vec<ProtocolEvent>,
    cached: HashMap<String, Vec<ProtocolEvent>>,
    fetches: Mutex<Vec<Vec<FetchRequest>>>,
    submitted: Mutex<Vec<ProtocolEvent>>,
}

/// Relay answering filters from a fixed event set
#[derive(Clone)]
pub struct MemoryRelay {
    url: String,
    state: Arc<RelayState>,
}

impl MemoryRelay {
    pub fn new(url: &str, events: Vec<ProtocolEvent>) -> Self {
        Self {
            url: url.to_string(),
            state: Arc::new(RelayState {
                events,
                ..Default::default()
            }),
        }
    }

    pub fn with_cached(self, event_type: &str, events: Vec<ProtocolEvent>) -> Self {
        let mut state = Arc::try_unwrap(self.state).unwrap_or_default();
        state.cached.insert(event_type.to_string(), events);
        Self {
            url: self.url,
            state: Arc::new(state),
        }
    }

    pub fn fetches(&self) -> Vec<Vec<FetchRequest>> {
        self.state.fetches.lock().clone()
    }

    pub fn submitted(&self) -> Vec<ProtocolEvent> {
        self.state.submitted.lock().clone()
    }
}

fn matches(filter: &Filter, event: &ProtocolEvent) -> bool {
    let within = |values: &Option<Vec<String>>, value: &str| values.as_ref().map_or(true, |v| v.iter().any(|x| x == value));
    within(&filter.ids, &event.id)
        && within(&filter.authors, &event.pubkey)
        && filter.kinds.as_ref().map_or(true, |k| k.contains(&event.kind))
        && filter.since.map_or(true, |since| event.created_at >= since)
        && filter.until.map_or(true, |until| event.created_at <= until)
        && filter.tags.iter().all(|(name, values)| {
            let name = name.trim_start_matches('#');
            event
                .tags_named(name)
                .filter_map(|t| t.value())
                .any(|v| values.iter().any(|x| x == v))
        })
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_events(&self, requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError> {
        self.state.fetches.lock().push(requests.to_vec());
        let mut found: Vec<ProtocolEvent> = Vec::new();
        for request in requests {
            let hits: Vec<&ProtocolEvent> = match request {
                FetchRequest::Filter(filter) => self.state.events.iter().filter(|e| matches(filter, e)).collect(),
                FetchRequest::Cached { event_type, .. } => {
                    self.state.cached.get(event_type).map(|e| e.iter().collect()).unwrap_or_default()
                }
            };
            for event in hits {
                if !found.iter().any(|f| f.id == event.id) {
                    found.push(event.clone());
                }
            }
        }
        Ok(found)
    }

    async fn submit_event(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
        self.state.submitted.lock().push(event.clone());
        Ok(SubmitResponse::accepted(&self.url, None))
    }
}

/// Single-attempt network settings so call counts are exact
pub fn test_config() -> NetConfig {
    NetConfig {
        retry: RetryPolicy::none(),
        ..NetConfig::default()
    }
}

pub fn facade_over(relay: &MemoryRelay, api: &RecordingApi) -> Arc<FetchFacade> {
    let read: Arc<dyn RelayTransport> = Arc::new(relay.clone());
    let api: Arc<dyn ApiTransport> = Arc::new(api.clone());
    Arc::new(FetchFacade::new(Arc::clone(&read), vec![read], api, test_config()))
}

/// Facade over an empty relay
pub fn facade_with(api: &RecordingApi) -> Arc<FetchFacade> {
    facade_over(&MemoryRelay::new("wss://relay.test", Vec::new()), api)
}

/// Sign as `session` with the bundled Ed25519 signer
pub fn sign(session: &Session, unsigned: UnsignedEvent) -> ProtocolEvent {
    LocalEventSigner::new(Ed25519Signer::from_secret(session.secret()))
        .sign_event(unsigned)
        .unwrap()
}
