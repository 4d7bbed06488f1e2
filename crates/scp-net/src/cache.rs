//! In-flight result sharing
//!
//! Identical requests issued within a short window share one underlying call.
//! Entries hold the shared future itself, so a caller arriving while the call
//! is still running waits on the same result instead of starting another.
//! Failures are shared too and age out like successes.

use crate::transport::TransportError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, TransportError>>>;

struct CacheEntry<T: Clone> {
    result: SharedResult<T>,
    expires_at: Instant,
}

/// Cache of shared in-flight results keyed by request fingerprint
pub struct ResultCache<T: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

/// Fingerprint of a call: the endpoint plus its serialized payload
pub fn cache_key(endpoint: &str, payload: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(&[0]);
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

impl<T> ResultCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live entry for `key`, or start `producer` and share its
    /// result for `ttl`. Staleness is judged when the entry is read.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let shared = {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    trace!(key, "sharing cached result");
                    entry.result.clone()
                }
                _ => {
                    entries.retain(|_, entry| entry.expires_at > now);
                    let result = producer().boxed().shared();
                    entries.insert(
                        key.to_string(),
                        CacheEntry {
                            result: result.clone(),
                            expires_at: now + ttl,
                        },
                    );
                    result
                }
            }
        };
        shared.await
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ResultCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_millis(1000);

    fn counting(calls: &Arc<AtomicUsize>, value: u32) -> impl Future<Output = Result<u32, TransportError>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_share_one_producer() {
        let cache = ResultCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("k", TTL, || counting(&calls, 1)),
            cache.get_or_fetch("k", TTL, || counting(&calls, 2)),
            cache.get_or_fetch("k", TTL, || counting(&calls, 3)),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ResultCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cache.get_or_fetch("k", TTL, || counting(&calls, 1)).await.unwrap(), 1);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get_or_fetch("k", TTL, || counting(&calls, 2)).await.unwrap(), 1);

        tokio::time::advance(TTL).await;
        assert_eq!(cache.get_or_fetch("k", TTL, || counting(&calls, 3)).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_shared_within_window() {
        let cache: ResultCache<u32> = ResultCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::ConnectionClosed)
            }
        };

        assert!(cache.get_or_fetch("k", TTL, failing).await.is_err());
        assert!(cache.get_or_fetch("k", TTL, failing).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_and_purge() {
        let cache = ResultCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_fetch("a", TTL, || counting(&calls, 1)).await.unwrap();
        cache
            .get_or_fetch("b", Duration::from_millis(100), || counting(&calls, 2))
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_key_depends_on_endpoint_and_payload() {
        let a = cache_key("communities/posts", &json!({"since": 1}));
        assert_eq!(a, cache_key("communities/posts", &json!({"since": 1})));
        assert_ne!(a, cache_key("communities/posts", &json!({"since": 2})));
        assert_ne!(a, cache_key("channels/messages", &json!({"since": 1})));
        assert_eq!(a.len(), 64);
    }
}
