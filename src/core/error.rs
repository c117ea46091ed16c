//! RW-002: Error taxonomy.
//!
//! Query-path errors are contained per query (pending / empty result);
//! cycles abort a pass; action-path errors travel back to the caller inside
//! an `ActionOutcome`.

use std::time::Duration;

/// Errors raised while planning or executing queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Dependency cycle; the path starts and ends with the same query
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Filter still holds a symbolic reference after resolution
    #[error("query '{query}' has unresolved reference '{token}'")]
    UnresolvedReference { query: String, token: String },

    /// Resolved filter field has the wrong shape
    #[error("query '{query}' field '{field}': {reason}")]
    InvalidFilter {
        query: String,
        field: String,
        reason: String,
    },

    /// Query name not present in the document
    #[error("unknown query '{0}'")]
    UnknownQuery(String),

    /// Transport failure surfaced outside the fetch boundary
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed document or options
    #[error("document error: {0}")]
    Document(String),
}

impl EngineError {
    /// Create an unresolved-reference error
    pub fn unresolved(query: impl Into<String>, token: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            query: query.into(),
            token: token.into(),
        }
    }

    /// Create an invalid-filter error
    pub fn invalid_filter(
        query: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidFilter {
            query: query.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the query should simply be retried on a later pass.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::UnresolvedReference { .. })
    }
}

/// Errors reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("transport closed")]
    Closed,
}

/// Errors from the action path. Never escape `execute_action`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("action '{0}' not found")]
    NotFound(String),

    #[error("no signer available")]
    NoSigner,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("publish failed: {0}")]
    PublishFailure(String),

    #[error("action '{action}' has unresolved reference '{token}'")]
    UnresolvedReference { action: String, token: String },

    #[error("trigger chain stopped at '{action}': {reason}")]
    ChainStopped { action: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw002_cycle_message_names_path() {
        let err = EngineError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_rw002_pending_classification() {
        assert!(EngineError::unresolved("q", "$x").is_pending());
        assert!(!EngineError::Cycle { path: vec![] }.is_pending());
        assert!(!EngineError::from(TransportError::Closed).is_pending());
    }
}
