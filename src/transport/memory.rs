//! RW-011: In-process relay.
//!
//! Stores events, answers fetches with nostr semantics (newest first,
//! `limit` applied), fans injected or published events out to matching live
//! subscriptions. Records every fetch so tests can count network round
//! trips. Also backs `relayweave run` with a JSON fixture.

use super::{LiveMessage, LiveSubscription, PublishReceipt, Transport};
use crate::core::error::TransportError;
use crate::core::types::{Event, Filter};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Default)]
struct RelayState {
    events: Mutex<Vec<Event>>,
    subscriptions: Mutex<FxHashMap<u64, (Filter, UnboundedSender<LiveMessage>)>>,
    next_subscription: AtomicU64,
    fetch_log: Mutex<Vec<Filter>>,
    published: Mutex<Vec<Event>>,
    fail_fetch: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fetch_delay_ms: AtomicU64,
    subscribe_delay_ms: AtomicU64,
    subscribe_calls: AtomicU64,
}

/// Cloneable handle; clones share one relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay pre-seeded with stored events.
    pub fn with_events(events: impl IntoIterator<Item = Event>) -> Self {
        let relay = Self::new();
        for event in events {
            relay.store(event);
        }
        relay
    }

    /// Store an event without notifying subscribers. Returns false on a
    /// duplicate id.
    pub fn store(&self, event: Event) -> bool {
        let mut events = self.state.events.lock();
        if events.iter().any(|e| e.id == event.id) {
            return false;
        }
        events.push(event);
        true
    }

    /// Store an event and deliver it to every matching live subscription.
    /// Duplicates are still delivered, as a real relay pool may.
    pub fn inject(&self, event: Event) {
        self.store(event.clone());
        let subscriptions = self.state.subscriptions.lock();
        for (filter, sink) in subscriptions.values() {
            if filter.matches(&event) {
                let _ = sink.send(LiveMessage::Event(event.clone()));
            }
        }
    }

    /// Every filter fetched so far, in call order.
    pub fn fetch_log(&self) -> Vec<Filter> {
        self.state.fetch_log.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetch_log.lock().len()
    }

    /// Events accepted through `publish`.
    pub fn published(&self) -> Vec<Event> {
        self.state.published.lock().clone()
    }

    /// Currently open live subscriptions.
    pub fn open_subscriptions(&self) -> usize {
        self.state.subscriptions.lock().len()
    }

    /// Total `subscribe` calls ever made.
    pub fn subscribe_calls(&self) -> u64 {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.state.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Artificial latency before every subscribe answers.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.state
            .subscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Artificial latency for every fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state
            .fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn query(&self, filter: &Filter) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .state
            .events
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>, TransportError> {
        self.state.fetch_log.lock().push(filter.clone());
        let delay = self.state.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_fetch.load(Ordering::SeqCst) {
            return Err(TransportError::Fetch("relay unavailable".to_string()));
        }
        Ok(self.query(filter))
    }

    async fn subscribe(
        &self,
        filter: &Filter,
        sink: UnboundedSender<LiveMessage>,
    ) -> Result<LiveSubscription, TransportError> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.subscribe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe("relay refused subscription".to_string()));
        }
        if filter.limit != Some(0) {
            for event in self.query(filter) {
                sink.send(LiveMessage::Event(event))
                    .map_err(|_| TransportError::Closed)?;
            }
        }
        sink.send(LiveMessage::EndOfStored)
            .map_err(|_| TransportError::Closed)?;

        let id = self.state.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.state
            .subscriptions
            .lock()
            .insert(id, (filter.clone(), sink));

        let state = Arc::clone(&self.state);
        Ok(LiveSubscription::new(move || {
            state.subscriptions.lock().remove(&id);
        }))
    }

    async fn publish(&self, event: &Event) -> Result<PublishReceipt, TransportError> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("no relay accepted the event".to_string()));
        }
        self.state.published.lock().push(event.clone());
        self.inject(event.clone());
        Ok(PublishReceipt {
            id: event.id.clone(),
            success_count: 1,
        })
    }
}
