//! RW-010: Transport and signer abstractions.
//!
//! The engine never manages relay connections, retries or framing. It talks
//! to a [`Transport`] (fetch / subscribe / publish) and, for writes, a
//! [`Signer`]. Both are injected as trait objects.

pub mod memory;
pub mod signer;

pub use memory::MemoryRelay;
pub use signer::StaticSigner;

use crate::core::error::TransportError;
use crate::core::types::{Event, Filter, UnsignedEvent};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

/// A message delivered on a live subscription, in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMessage {
    Event(Event),
    /// End of stored events; everything after this is live.
    EndOfStored,
}

/// Cancel handle for an open transport subscription.
///
/// Cancels exactly once, either explicitly or on drop.
pub struct LiveSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl LiveSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Result of a publish: the record id and how many relays accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: String,
    pub success_count: usize,
}

/// Relay-pool operations consumed by the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One-shot fetch of stored events matching `filter`.
    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>, TransportError>;

    /// Open a live subscription. Messages go to `sink` until the returned
    /// handle is cancelled or dropped.
    async fn subscribe(
        &self,
        filter: &Filter,
        sink: UnboundedSender<LiveMessage>,
    ) -> Result<LiveSubscription, TransportError>;

    /// Publish a signed record.
    async fn publish(&self, event: &Event) -> Result<PublishReceipt, TransportError>;
}

/// Signing collaborator. Absence is handled by the action executor.
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> String;

    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, String>;
}
