//! relayweave: live declarative queries over nostr relays.
//!
//! Documents name queries (filters plus pipes) and write actions. The
//! executor resolves cross-query references in dependency order, keeps
//! results live through shared subscriptions, and publishes actions whose
//! results flow back into dependent queries.

pub mod cache;
pub mod cli;
pub mod core;
pub mod transport;
