//! RW-004: Resolution context: the mutable variable scope of one executor.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Variables a document scope resolves against.
///
/// One context per executor scope. Nested component instances get a
/// [`derive_for_target`](Self::derive_for_target) copy, never a shared
/// reference.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Resolved query values by bare query name
    pub query_results: IndexMap<String, Value>,

    /// Published record ids by bare action name
    pub action_results: IndexMap<String, String>,

    /// Submitted form fields (`form.*`)
    pub form_data: Map<String, Value>,

    /// Loop-scope variables; highest resolution priority
    pub loop_variables: HashMap<String, Value>,

    /// Current user's public key (`user.pubkey`)
    pub user_pubkey: Option<String>,

    /// Per-instance profile/record context (`target.*`)
    pub target: Option<Value>,

    /// Unix seconds (`time.now`)
    pub now: u64,
}

impl ResolutionContext {
    /// Context for a signed-in user.
    pub fn for_user(pubkey: impl Into<String>) -> Self {
        Self {
            user_pubkey: Some(pubkey.into()),
            now: unix_now(),
            ..Default::default()
        }
    }

    /// Copy for a nested scope: own `target`, empty loop variables.
    pub fn derive_for_target(&self, target: Value) -> Self {
        Self {
            target: Some(target),
            loop_variables: HashMap::new(),
            ..self.clone()
        }
    }

    /// Refresh `time.now`.
    pub fn touch(&mut self) {
        self.now = unix_now();
    }

    /// Flat variable view exposed to the presentation layer.
    pub fn extracted_variables(&self) -> IndexMap<String, Value> {
        let mut vars = IndexMap::new();
        for (name, value) in &self.query_results {
            vars.insert(format!("${name}"), value.clone());
        }
        for (name, id) in &self.action_results {
            vars.insert(format!("@{name}"), Value::String(id.clone()));
        }
        if let Some(pubkey) = &self.user_pubkey {
            vars.insert("user.pubkey".to_string(), Value::String(pubkey.clone()));
        }
        vars.insert("time.now".to_string(), Value::from(self.now));
        vars
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rw004_derive_for_target() {
        let mut ctx = ResolutionContext::for_user("me");
        ctx.loop_variables.insert("item".into(), json!(1));
        ctx.query_results.insert("feed".into(), json!([1, 2]));

        let child = ctx.derive_for_target(json!({"pubkey": "them"}));
        assert_eq!(child.target, Some(json!({"pubkey": "them"})));
        assert!(child.loop_variables.is_empty());
        assert_eq!(child.query_results["feed"], json!([1, 2]));
        assert_eq!(child.user_pubkey.as_deref(), Some("me"));
        // parent untouched
        assert!(ctx.target.is_none());
        assert_eq!(ctx.loop_variables.len(), 1);
    }

    #[test]
    fn test_rw004_extracted_variables() {
        let mut ctx = ResolutionContext::for_user("me");
        ctx.query_results.insert("count".into(), json!(3));
        ctx.action_results.insert("post".into(), "id1".into());
        let vars = ctx.extracted_variables();
        assert_eq!(vars["$count"], json!(3));
        assert_eq!(vars["@post"], json!("id1"));
        assert_eq!(vars["user.pubkey"], json!("me"));
        assert!(vars.contains_key("time.now"));
    }

    #[test]
    fn test_rw004_unix_now_is_recent() {
        // 2024-01-01
        assert!(unix_now() > 1_704_067_200);
    }
}
