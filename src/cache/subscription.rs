//! RW-016: Live subscription registry.
//!
//! One transport subscription per canonical filter, shared by every
//! listener that resolves to the same filter. The first listener opens it,
//! the last release closes it. Each subscription has one forwarder task that
//! drops duplicate record ids (within a bounded window of recent ids) and
//! calls listeners in arrival order. Listeners that attach while the
//! subscription is still opening wait for the outcome and share its error.

use crate::core::error::TransportError;
use crate::core::types::{Event, Filter};
use crate::transport::{LiveMessage, LiveSubscription, Transport};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Callback attached to a live filter.
pub type Listener = Arc<dyn Fn(Event) + Send + Sync>;

/// Proof of attachment; pass back to [`SubscriptionRegistry::release`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub key: String,
    pub listener_id: u64,
}

/// Recent record ids remembered per subscription for de-duplication.
const SEEN_WINDOW: usize = 4096;

type OpenOutcome = Option<Result<(), TransportError>>;

struct Slot {
    listeners: Vec<(u64, Listener)>,
    live: Option<LiveSubscription>,
    forwarder: Option<JoinHandle<()>>,
    /// Set while the transport subscription is being opened
    opening: Option<watch::Receiver<OpenOutcome>>,
}

enum Attach {
    /// Joined an existing slot; holds its opening outcome if still opening
    Joined(Option<watch::Receiver<OpenOutcome>>),
    /// Created the slot; must open the transport subscription
    Opening(watch::Sender<OpenOutcome>),
}

type Slots = Arc<Mutex<FxHashMap<String, Slot>>>;

pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    slots: Slots,
    next_listener: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            slots: Arc::new(Mutex::new(FxHashMap::default())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Attach `listener` to the live feed for `filter`, opening the
    /// transport subscription if this is the first listener.
    pub async fn ensure_subscription(
        &self,
        filter: &Filter,
        listener: Listener,
    ) -> Result<SubscriptionHandle, TransportError> {
        let key = filter.canonical_key();
        let listener_id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let handle = SubscriptionHandle {
            key: key.clone(),
            listener_id,
        };

        let attached = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) => {
                    slot.listeners.push((listener_id, listener));
                    Attach::Joined(slot.opening.clone())
                }
                None => {
                    let (outcome, opening) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        Slot {
                            listeners: vec![(listener_id, listener)],
                            live: None,
                            forwarder: None,
                            opening: Some(opening),
                        },
                    );
                    Attach::Opening(outcome)
                }
            }
        };
        let outcome = match attached {
            Attach::Joined(opening) => {
                tracing::trace!(key = %key, listener_id, "attached to existing subscription");
                if let Some(mut opening) = opening {
                    let opened = match opening.wait_for(Option::is_some).await {
                        Ok(result) => (*result).clone(),
                        Err(_) => Some(Err(TransportError::Closed)),
                    };
                    if let Some(Err(err)) = opened {
                        return Err(err);
                    }
                }
                return Ok(handle);
            }
            Attach::Opening(outcome) => outcome,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(Arc::clone(&self.slots), key.clone(), rx));
        match self.transport.subscribe(filter, tx).await {
            Ok(live) => {
                let orphaned = {
                    let mut slots = self.slots.lock();
                    match slots.get_mut(&key) {
                        Some(slot) => {
                            slot.live = Some(live);
                            slot.forwarder = Some(forwarder);
                            slot.opening = None;
                            None
                        }
                        None => Some((live, forwarder)),
                    }
                };
                let _ = outcome.send(Some(Ok(())));
                // every listener left while the subscription was opening
                if let Some((live, forwarder)) = orphaned {
                    live.cancel();
                    forwarder.abort();
                }
                tracing::debug!(filter = %filter, "live subscription opened");
                Ok(handle)
            }
            Err(err) => {
                self.slots.lock().remove(&key);
                forwarder.abort();
                // listeners that attached meanwhile get the same error
                let _ = outcome.send(Some(Err(err.clone())));
                tracing::warn!(filter = %filter, error = %err, "subscribe failed");
                Err(err)
            }
        }
    }

    /// Detach a listener. Returns true when this closed the underlying
    /// subscription.
    pub fn release(&self, handle: &SubscriptionHandle) -> bool {
        let closed = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&handle.key) else {
                return false;
            };
            slot.listeners.retain(|(id, _)| *id != handle.listener_id);
            if slot.listeners.is_empty() {
                slots.remove(&handle.key)
            } else {
                None
            }
        };
        match closed {
            Some(slot) => {
                if let Some(live) = slot.live {
                    live.cancel();
                }
                if let Some(forwarder) = slot.forwarder {
                    forwarder.abort();
                }
                tracing::debug!(key = %handle.key, "live subscription closed");
                true
            }
            None => false,
        }
    }

    /// Distinct open filters.
    pub fn subscription_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Listeners attached to `filter`.
    pub fn listener_count(&self, filter: &Filter) -> usize {
        self.slots
            .lock()
            .get(&filter.canonical_key())
            .map_or(0, |slot| slot.listeners.len())
    }
}

/// Bounded set of recently seen ids; the oldest id is forgotten first.
struct RecentIds {
    ids: FxHashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: FxHashSet::default(),
            order: VecDeque::with_capacity(capacity.min(SEEN_WINDOW)),
            capacity: capacity.max(1),
        }
    }

    /// False if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

async fn forward(slots: Slots, key: String, mut rx: UnboundedReceiver<LiveMessage>) {
    let mut seen = RecentIds::new(SEEN_WINDOW);
    while let Some(message) = rx.recv().await {
        let event = match message {
            LiveMessage::EndOfStored => {
                tracing::trace!(key = %key, "end of stored events");
                continue;
            }
            LiveMessage::Event(event) => event,
        };
        if !seen.insert(&event.id) {
            tracing::trace!(key = %key, id = %event.id, "duplicate event dropped");
            continue;
        }
        let listeners: Vec<Listener> = match slots.lock().get(&key) {
            Some(slot) => slot.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => break,
        };
        for listener in listeners {
            listener(event.clone());
        }
    }
}
