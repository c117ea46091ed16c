//! RW-015: Query cache.
//!
//! One-shot fetches keyed by canonical filter JSON. Concurrent callers with
//! the same key await one shared in-flight future; successful results are
//! kept for a TTL; failures are never stored so the next call retries.
//! Every insert sweeps expired entries, so keys that are never looked up
//! again do not outlive their TTL by more than one insert.
//!
//! Locks are `parking_lot` and never held across an `.await`.

use crate::core::error::TransportError;
use crate::core::types::{Event, Filter};
use crate::transport::Transport;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

type FetchFuture = Shared<BoxFuture<'static, Result<Vec<Event>, TransportError>>>;

/// A cached fetch result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub filter: Filter,
    pub events: Vec<Event>,
    pub fetched_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct QueryCache {
    transport: Arc<dyn Transport>,
    ttl: Duration,
    fetch_timeout: Duration,
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    inflight: Mutex<FxHashMap<String, FetchFuture>>,
}

impl QueryCache {
    pub fn new(transport: Arc<dyn Transport>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            transport,
            ttl,
            fetch_timeout,
            entries: RwLock::new(FxHashMap::default()),
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    /// Serve from cache, join an identical in-flight fetch, or fetch.
    pub async fn get_or_fetch(&self, filter: &Filter) -> Result<Vec<Event>, TransportError> {
        let key = filter.canonical_key();
        if let Some(events) = self.fresh(&key) {
            tracing::trace!(key = %key, "cache hit");
            return Ok(events);
        }

        let fetch = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(shared) => {
                    tracing::trace!(key = %key, "joining in-flight fetch");
                    shared.clone()
                }
                None => {
                    let shared = self.start_fetch(filter.clone());
                    inflight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        let result = fetch.clone().await;

        if let Ok(events) = &result {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| entry.is_fresh(self.ttl));
            let evicted = before - entries.len();
            if evicted > 0 {
                tracing::trace!(evicted, "expired entries swept");
            }
            entries.insert(
                key.clone(),
                CacheEntry {
                    filter: filter.clone(),
                    events: events.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        {
            let mut inflight = self.inflight.lock();
            if inflight.get(&key).is_some_and(|f| f.ptr_eq(&fetch)) {
                inflight.remove(&key);
            }
        }
        if let Err(err) = &result {
            tracing::warn!(filter = %filter, error = %err, "fetch failed");
        }
        result
    }

    fn start_fetch(&self, filter: Filter) -> FetchFuture {
        let transport = Arc::clone(&self.transport);
        let timeout = self.fetch_timeout;
        async move {
            tracing::debug!(filter = %filter, "fetching");
            match tokio::time::timeout(timeout, transport.fetch(&filter)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }
        .boxed()
        .shared()
    }

    fn fresh(&self, key: &str) -> Option<Vec<Event>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(self.ttl) => return Some(entry.events.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().remove(key);
        None
    }

    /// Cached events for `filter`, if fresh. Never fetches.
    pub fn peek(&self, filter: &Filter) -> Option<Vec<Event>> {
        self.fresh(&filter.canonical_key())
    }

    /// Drop the entry for `filter`.
    pub fn invalidate(&self, filter: &Filter) -> bool {
        self.entries.write().remove(&filter.canonical_key()).is_some()
    }

    /// Drop every entry whose filter would match `event`.
    pub fn invalidate_matching(&self, event: &Event) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.filter.matches(event));
        before - entries.len()
    }

    /// Prepend a live event to the cached list for `filter`, keeping at most
    /// the filter's `limit` events.
    ///
    /// Returns false when there is no entry or the id is already present.
    pub fn prepend(&self, filter: &Filter, event: Event) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&filter.canonical_key()) else {
            return false;
        };
        if entry.events.iter().any(|e| e.id == event.id) {
            return false;
        }
        entry.events.insert(0, event);
        if let Some(limit) = filter.limit {
            entry.events.truncate(limit);
        }
        true
    }

    /// Remove expired entries. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(self.ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::tests::event;
    use crate::transport::MemoryRelay;
    use serde_json::json;

    fn cache(relay: &MemoryRelay, ttl: Duration) -> QueryCache {
        QueryCache::new(Arc::new(relay.clone()), ttl, Duration::from_secs(1))
    }

    fn filter(v: serde_json::Value) -> Filter {
        Filter::from_resolved("q", v.as_object().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_rw015_concurrent_identical_filters_share_one_fetch() {
        let relay = MemoryRelay::with_events([event("a", "p", 1, 1)]);
        relay.set_fetch_delay(Duration::from_millis(30));
        let cache = cache(&relay, Duration::from_secs(60));

        let f1 = filter(json!({"kinds": [1], "authors": ["p"]}));
        let mut f2 = Filter::default();
        f2.authors = Some(vec!["p".into()]);
        f2.kinds = Some(vec![1]);

        let (r1, r2) = tokio::join!(cache.get_or_fetch(&f1), cache.get_or_fetch(&f2));
        assert_eq!(r1.unwrap().len(), 1);
        assert_eq!(r2.unwrap().len(), 1);
        assert_eq!(relay.fetch_count(), 1);

        // served from cache afterwards
        cache.get_or_fetch(&f1).await.unwrap();
        assert_eq!(relay.fetch_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_rw015_failures_are_not_cached() {
        let relay = MemoryRelay::with_events([event("a", "p", 1, 1)]);
        let cache = cache(&relay, Duration::from_secs(60));
        let f = filter(json!({"kinds": [1]}));

        relay.set_fail_fetch(true);
        assert!(cache.get_or_fetch(&f).await.is_err());
        assert!(cache.is_empty());

        relay.set_fail_fetch(false);
        assert_eq!(cache.get_or_fetch(&f).await.unwrap().len(), 1);
        assert_eq!(relay.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_rw015_zero_ttl_always_refetches() {
        let relay = MemoryRelay::new();
        let cache = cache(&relay, Duration::ZERO);
        let f = filter(json!({"kinds": [1]}));
        cache.get_or_fetch(&f).await.unwrap();
        cache.get_or_fetch(&f).await.unwrap();
        assert_eq!(relay.fetch_count(), 2);
        assert!(cache.peek(&f).is_none());
    }

    #[tokio::test]
    async fn test_rw015_fetch_timeout() {
        let relay = MemoryRelay::new();
        relay.set_fetch_delay(Duration::from_millis(500));
        let cache = QueryCache::new(
            Arc::new(relay.clone()),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let err = cache.get_or_fetch(&filter(json!({"kinds": [1]}))).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(20)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_rw015_prepend_and_invalidate() {
        let relay = MemoryRelay::with_events([event("a", "p", 1, 1)]);
        let cache = cache(&relay, Duration::from_secs(60));
        let f = filter(json!({"kinds": [1]}));
        let other = filter(json!({"kinds": [7]}));
        cache.get_or_fetch(&f).await.unwrap();
        cache.get_or_fetch(&other).await.unwrap();

        assert!(cache.prepend(&f, event("b", "p", 1, 2)));
        assert!(!cache.prepend(&f, event("b", "p", 1, 2)));
        assert!(!cache.prepend(&filter(json!({"kinds": [9]})), event("c", "p", 9, 2)));
        let ids: Vec<_> = cache.peek(&f).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert_eq!(cache.invalidate_matching(&event("z", "q", 1, 3)), 1);
        assert!(cache.peek(&f).is_none());
        assert!(cache.invalidate(&other));
        assert!(!cache.invalidate(&other));
    }

    #[tokio::test]
    async fn test_rw015_insert_sweeps_expired_entries() {
        let relay = MemoryRelay::new();
        let cache = cache(&relay, Duration::from_millis(10));
        for kind in 0..50 {
            cache.get_or_fetch(&filter(json!({"kinds": [kind]}))).await.unwrap();
        }
        assert_eq!(cache.len(), 50);
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.get_or_fetch(&filter(json!({"kinds": [99]}))).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&filter(json!({"kinds": [99]}))).is_some());
    }

    #[tokio::test]
    async fn test_rw015_evict_expired() {
        let relay = MemoryRelay::new();
        let cache = cache(&relay, Duration::from_millis(10));
        cache.get_or_fetch(&filter(json!({"kinds": [1]}))).await.unwrap();
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
