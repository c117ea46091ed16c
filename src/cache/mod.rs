//! Shared data layer: fetch cache, live subscription registry, hashing.
//!
//! A [`DataLayer`] is built once per process and handed to every executor
//! scope by `Arc`. Entries are keyed by filter content, never by scope, so
//! sharing across scopes is safe.

pub mod hasher;
pub mod store;
pub mod subscription;

pub use store::{CacheEntry, QueryCache};
pub use subscription::{Listener, SubscriptionHandle, SubscriptionRegistry};

use crate::core::config::EngineOptions;
use crate::transport::Transport;
use std::sync::Arc;

pub struct DataLayer {
    pub transport: Arc<dyn Transport>,
    pub cache: QueryCache,
    pub subscriptions: SubscriptionRegistry,
}

impl DataLayer {
    pub fn new(transport: Arc<dyn Transport>, options: &EngineOptions) -> Arc<Self> {
        Arc::new(Self {
            cache: QueryCache::new(
                Arc::clone(&transport),
                options.cache_ttl(),
                options.fetch_timeout(),
            ),
            subscriptions: SubscriptionRegistry::new(Arc::clone(&transport)),
            transport,
        })
    }
}
