//! RW-012: Deterministic signer for tests and the CLI.
//!
//! No cryptography. The record id is a BLAKE3 composite of the serialized
//! fields; the signature is the id re-hashed with the public key.

use super::Signer;
use crate::cache::hasher;
use crate::core::types::{Event, UnsignedEvent};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct StaticSigner {
    pubkey: String,
}

impl StaticSigner {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }
}

/// Deterministic id for an unsigned record.
pub fn event_id(unsigned: &UnsignedEvent) -> String {
    let tags = serde_json::to_string(&unsigned.tags).unwrap_or_default();
    let hash = hasher::composite_hash(&[
        &unsigned.pubkey,
        &unsigned.created_at.to_string(),
        &unsigned.kind.to_string(),
        &tags,
        &unsigned.content,
    ]);
    hash.trim_start_matches("blake3:").to_string()
}

#[async_trait]
impl Signer for StaticSigner {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, String> {
        if unsigned.pubkey != self.pubkey {
            return Err(format!(
                "signer key {} cannot sign for {}",
                self.pubkey, unsigned.pubkey
            ));
        }
        let id = event_id(&unsigned);
        let sig = hasher::composite_hash(&[&id, &self.pubkey]);
        Ok(Event {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: sig.trim_start_matches("blake3:").to_string(),
        })
    }
}
