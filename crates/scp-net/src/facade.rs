//! Single entry point for relay reads and writes
//!
//! Picks a transport per relay URL, collapses identical reads through the
//! result cache and retries transient failures with backoff.

use crate::cache::{cache_key, ResultCache};
use crate::http::{events_from_reply, resolve_deferred, ApiTransport, HttpApi, PollConfig, RequestTransport};
use crate::retry::RetryPolicy;
use crate::transport::{RelayTransport, SubmitResponse, TransportError, TransportKind};
use crate::websocket::StreamTransport;
use futures::future::join_all;
use scp_core::{FetchRequest, ProtocolEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Network tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetConfig {
    /// How long an identical read shares one result
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    /// Upper bound for one request (stream reply or HTTP call)
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll: PollConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            poll: PollConfig::default(),
        }
    }
}

/// Build the transport matching `url`'s scheme
pub fn transport_for(url: &str, api: &Arc<dyn ApiTransport>, config: &NetConfig) -> Arc<dyn RelayTransport> {
    match TransportKind::for_url(url) {
        TransportKind::Stream => Arc::new(StreamTransport::new(
            url.trim_end_matches('/'),
            config.connect_timeout,
            config.request_timeout,
        )),
        TransportKind::Request => Arc::new(RequestTransport::new(url, Arc::clone(api), config.poll)),
    }
}

pub struct FetchFacade {
    read_relay: Arc<dyn RelayTransport>,
    /// Always starts with the read relay
    write_relays: Vec<Arc<dyn RelayTransport>>,
    api: Arc<dyn ApiTransport>,
    events: ResultCache<Vec<ProtocolEvent>>,
    replies: ResultCache<Value>,
    config: NetConfig,
}

impl FetchFacade {
    /// Facade over real transports. The read relay doubles as the public
    /// indexing relay and is always among the write relays.
    pub fn connect(read_relay: &str, write_relays: &[String], config: NetConfig) -> Result<Self, TransportError> {
        let api: Arc<dyn ApiTransport> = Arc::new(HttpApi::new(config.request_timeout)?);
        Ok(Self::with_api(read_relay, write_relays, api, config))
    }

    pub fn with_api(read_relay: &str, write_relays: &[String], api: Arc<dyn ApiTransport>, config: NetConfig) -> Self {
        let read = transport_for(read_relay, &api, &config);
        let mut writes = vec![Arc::clone(&read)];
        for url in write_relays {
            let url = url.trim_end_matches('/');
            if writes.iter().any(|t| t.url() == url) {
                continue;
            }
            writes.push(transport_for(url, &api, &config));
        }
        Self::new(read, writes, api, config)
    }

    pub fn new(
        read_relay: Arc<dyn RelayTransport>,
        write_relays: Vec<Arc<dyn RelayTransport>>,
        api: Arc<dyn ApiTransport>,
        config: NetConfig,
    ) -> Self {
        info!(
            read_relay = read_relay.url(),
            write_relays = write_relays.len(),
            "fetch facade ready"
        );
        Self {
            read_relay,
            write_relays,
            api,
            events: ResultCache::new(),
            replies: ResultCache::new(),
            config,
        }
    }

    pub fn read_relay_url(&self) -> &str {
        self.read_relay.url()
    }

    pub fn write_relay_urls(&self) -> Vec<&str> {
        self.write_relays.iter().map(|t| t.url()).collect()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Events from the read relay matching any of `requests`
    pub async fn fetch_events(&self, requests: Vec<FetchRequest>) -> Result<Vec<ProtocolEvent>, TransportError> {
        let key = cache_key(self.read_relay.url(), &serde_json::to_value(&requests)?);
        let transport = Arc::clone(&self.read_relay);
        let retry = self.config.retry;

        self.events
            .get_or_fetch(&key, self.config.cache_ttl, move || async move {
                debug!(relay = transport.url(), requests = requests.len(), "fetching events");
                retry
                    .run_if(|| transport.fetch_events(&requests), TransportError::is_retryable)
                    .await
            })
            .await
    }

    /// Relay-side cached query
    pub async fn fetch_cached(&self, event_type: &str, params: Value) -> Result<Vec<ProtocolEvent>, TransportError> {
        self.fetch_events(vec![FetchRequest::Cached {
            event_type: event_type.to_string(),
            params,
        }])
        .await
    }

    /// Submit to the read relay
    pub async fn submit_event(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
        let transport = &self.read_relay;
        self.config
            .retry
            .run_if(|| transport.submit_event(event), TransportError::is_retryable)
            .await
    }

    /// Submit to every write relay at once. A relay that fails is reported
    /// as a rejected response; it never hides the others.
    pub async fn submit_to_write_relays(&self, event: &ProtocolEvent) -> Vec<SubmitResponse> {
        let retry = self.config.retry;
        let submissions = self.write_relays.iter().map(|transport| async move {
            match retry
                .run_if(|| transport.submit_event(event), TransportError::is_retryable)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(relay = transport.url(), event_id = %event.id, error = %err, "submit failed");
                    SubmitResponse::rejected(transport.url(), err.to_string())
                }
            }
        });
        let responses = join_all(submissions).await;
        debug!(
            event_id = %event.id,
            accepted = responses.iter().filter(|r| r.success).count(),
            relays = responses.len(),
            "event submitted"
        );
        responses
    }

    /// POST `params` to `{base_url}/{endpoint}`, following a deferred reply.
    /// Identical calls inside the cache window share one result.
    pub async fn call_api(
        &self,
        base_url: &str,
        endpoint: &str,
        params: Value,
        auth: Option<String>,
    ) -> Result<Value, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let url = format!("{}/{}", base_url, endpoint.trim_start_matches('/'));
        let key = cache_key(&url, &params);
        let api = Arc::clone(&self.api);
        let retry = self.config.retry;
        let poll = self.config.poll;

        self.replies
            .get_or_fetch(&key, self.config.cache_ttl, move || async move {
                retry
                    .run_if(
                        || async {
                            let reply = api.post_json(&url, &params, auth.as_deref()).await?;
                            resolve_deferred(api.as_ref(), &base_url, reply, auth.as_deref(), poll).await
                        },
                        TransportError::is_retryable,
                    )
                    .await
            })
            .await
    }

    /// Uncached signed POST (gatekeeper calls carry fresh signatures)
    pub async fn post(&self, url: &str, body: &Value, auth: Option<&str>) -> Result<Value, TransportError> {
        self.config
            .retry
            .run_if(|| self.api.post_json(url, body, auth), TransportError::is_retryable)
            .await
    }

    /// Read-relay API query returning events
    pub async fn fetch_events_from_api(
        &self,
        endpoint: &str,
        params: Value,
        auth: Option<String>,
    ) -> Result<Vec<ProtocolEvent>, TransportError> {
        if TransportKind::for_url(self.read_relay.url()) != TransportKind::Request {
            return Err(TransportError::Protocol(format!(
                "API endpoint {endpoint} needs an HTTP read relay, got {}",
                self.read_relay.url()
            )));
        }
        let base = self.read_relay.url().to_string();
        let reply = self.call_api(&base, endpoint, params, auth).await?;
        events_from_reply(reply)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::tests::ScriptedApi;
    use crate::router::tests::event;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use scp_core::Filter;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Relay double answering from a script, then with `events`
    pub(crate) struct ScriptedRelay {
        url: String,
        pub fetches: AtomicUsize,
        pub submits: AtomicUsize,
        failures: Mutex<VecDeque<TransportError>>,
        events: Vec<ProtocolEvent>,
    }

    impl ScriptedRelay {
        pub fn new(url: &str, events: Vec<ProtocolEvent>) -> Self {
            Self {
                url: url.to_string(),
                fetches: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
                failures: Mutex::new(VecDeque::new()),
                events,
            }
        }

        pub fn failing_first(self, failures: impl IntoIterator<Item = TransportError>) -> Self {
            *self.failures.lock() = failures.into_iter().collect();
            self
        }
    }

    #[async_trait]
    impl RelayTransport for ScriptedRelay {
        fn url(&self) -> &str {
            &self.url
        }

        async fn fetch_events(&self, _requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            match self.failures.lock().pop_front() {
                Some(err) => Err(err),
                None => Ok(self.events.clone()),
            }
        }

        async fn submit_event(&self, _event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().pop_front() {
                Some(err) => Err(err),
                None => Ok(SubmitResponse::accepted(&self.url, None)),
            }
        }
    }

    fn facade(read: Arc<ScriptedRelay>, writes: Vec<Arc<ScriptedRelay>>, api: Arc<ScriptedApi>) -> FetchFacade {
        let read_dyn: Arc<dyn RelayTransport> = read;
        let mut all = vec![Arc::clone(&read_dyn)];
        all.extend(writes.into_iter().map(|w| w as Arc<dyn RelayTransport>));
        FetchFacade::new(read_dyn, all, api, NetConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_reads_share_one_call() {
        let relay = Arc::new(ScriptedRelay::new("https://read.test", vec![event("a", 1)]));
        let facade = facade(Arc::clone(&relay), vec![], Arc::new(ScriptedApi::default()));
        let requests = || vec![FetchRequest::from(Filter::new().kinds([1]))];

        let (a, b) = tokio::join!(facade.fetch_events(requests()), facade.fetch_events(requests()));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(relay.fetches.load(Ordering::SeqCst), 1);

        // A different payload is a different call
        facade.fetch_events(vec![Filter::new().kinds([0]).into()]).await.unwrap();
        assert_eq!(relay.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let relay = Arc::new(
            ScriptedRelay::new("wss://read.test", vec![event("a", 1)])
                .failing_first([TransportError::ConnectionClosed, TransportError::Timeout(Duration::from_secs(1))]),
        );
        let facade = facade(Arc::clone(&relay), vec![], Arc::new(ScriptedApi::default()));

        let events = facade.fetch_cached("community-posts", json!({"limit": 5})).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(relay.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_rejection_is_not_retried() {
        let relay = Arc::new(
            ScriptedRelay::new("wss://read.test", vec![]).failing_first([TransportError::Relay("restricted".into())]),
        );
        let facade = facade(Arc::clone(&relay), vec![], Arc::new(ScriptedApi::default()));

        let err = facade.fetch_events(vec![Filter::new().into()]).await.unwrap_err();
        assert_eq!(err, TransportError::Relay("restricted".into()));
        assert_eq!(relay.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_fan_out_isolates_failures() {
        let read = Arc::new(ScriptedRelay::new("wss://read.test", vec![]));
        let broken = Arc::new(
            ScriptedRelay::new("https://broken.test", vec![])
                .failing_first(std::iter::repeat(TransportError::ConnectionClosed).take(4)),
        );
        let facade = facade(Arc::clone(&read), vec![Arc::clone(&broken)], Arc::new(ScriptedApi::default()));

        let responses = facade.submit_to_write_relays(&event("e1", 1)).await;
        assert_eq!(responses.len(), 2);
        assert!(responses[0].success);
        assert_eq!(responses[0].relay, "wss://read.test");
        assert!(!responses[1].success);
        assert_eq!(responses[1].message.as_deref(), Some("Connection closed"));
        assert_eq!(broken.submits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_write_relays_include_read_relay_once() {
        let api: Arc<dyn ApiTransport> = Arc::new(ScriptedApi::default());
        let facade = FetchFacade::with_api(
            "https://index.test",
            &[
                "wss://relay-a.test".to_string(),
                "https://index.test/".to_string(),
                "wss://relay-a.test".to_string(),
            ],
            api,
            NetConfig::default(),
        );
        assert_eq!(facade.read_relay_url(), "https://index.test");
        assert_eq!(facade.write_relay_urls(), ["https://index.test", "wss://relay-a.test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_reads_are_cached_and_polled() {
        let api = Arc::new(ScriptedApi::with_replies([
            Ok(json!({"requestId": "q1"})),
            Ok(json!({"data": [serde_json::to_value(event("a", 1)).unwrap()]})),
        ]));
        let read: Arc<dyn RelayTransport> = Arc::new(ScriptedRelay::new("https://index.test", vec![]));
        let facade = FetchFacade::new(Arc::clone(&read), vec![read], api.clone(), NetConfig::default());

        let params = json!({"communityUri": "34550:p:dev"});
        let first = facade
            .fetch_events_from_api("communities/posts", params.clone(), None)
            .await
            .unwrap();
        let second = facade
            .fetch_events_from_api("communities/posts", params, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            api.urls(),
            ["https://index.test/communities/posts", "https://index.test/poll/q1"]
        );
    }

    #[tokio::test]
    async fn test_api_reads_need_http_read_relay() {
        let read: Arc<dyn RelayTransport> = Arc::new(ScriptedRelay::new("wss://read.test", vec![]));
        let api = Arc::new(ScriptedApi::default());
        let facade = FetchFacade::new(Arc::clone(&read), vec![read], api.clone(), NetConfig::default());

        let err = facade.fetch_events_from_api("communities/posts", json!({}), None).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert!(api.urls().is_empty());
    }
}
