//! RW-008: Action executor.
//!
//! lookup → context → resolve → sign → publish → record → invalidate →
//! re-run → triggers
//!
//! Actions are re-resolved on every invocation so their inputs reflect the
//! latest query state. Chained `triggers` go through a bounded work queue;
//! an action already run in the current chain is never queued again.

use super::context::ResolutionContext;
use super::error::ActionError;
use super::executor::Executor;
use super::resolver;
use super::types::{strip_sigil, ActionSpec, UnsignedEvent};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};

/// Result of `execute_action`: a record id, or `None` plus the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub action: String,
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "display")]
    pub error: Option<ActionError>,
    /// Outcomes of actions run through `triggers`, in execution order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chained: Vec<ActionOutcome>,
}

fn display<S: serde::Serializer>(
    error: &Option<ActionError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_str(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ActionOutcome {
    fn published(action: &str, record_id: String) -> Self {
        Self {
            action: action.to_string(),
            record_id: Some(record_id),
            error: None,
            chained: Vec::new(),
        }
    }

    fn failed(action: &str, error: ActionError) -> Self {
        Self {
            action: action.to_string(),
            record_id: None,
            error: Some(error),
            chained: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.record_id.is_some()
    }
}

impl Executor {
    /// Run a named action with submitted form fields, then its trigger chain.
    ///
    /// Never fails: every error is reported inside the outcome.
    pub async fn execute_action(&self, name: &str, form_data: Map<String, Value>) -> ActionOutcome {
        let max_depth = self.inner.options.max_chain_depth;
        let mut queue: VecDeque<(String, Map<String, Value>, usize)> = VecDeque::new();
        queue.push_back((strip_sigil(name, '@'), form_data, 0));
        let mut visited: HashSet<String> = HashSet::new();
        let mut outcomes: Vec<ActionOutcome> = Vec::new();

        while let Some((action, form, depth)) = queue.pop_front() {
            visited.insert(action.clone());
            let outcome = match self.publish_action(&action, form).await {
                Ok(id) => {
                    tracing::info!(action = %action, id = %id, "action published");
                    ActionOutcome::published(&action, id)
                }
                Err(err) => {
                    tracing::warn!(action = %action, error = %err, "action failed");
                    ActionOutcome::failed(&action, err)
                }
            };

            let next = self.trigger_of(&action).filter(|_| outcome.is_success());
            outcomes.push(outcome);
            let Some(next) = next else {
                continue;
            };

            let stop_reason = if visited.contains(&next) {
                Some("trigger loop")
            } else if depth + 1 > max_depth {
                Some("chain depth limit")
            } else {
                None
            };
            match stop_reason {
                Some(reason) => {
                    tracing::warn!(from = %action, to = %next, reason, "trigger chain stopped");
                    outcomes.push(ActionOutcome::failed(
                        &next,
                        ActionError::ChainStopped {
                            action: next.clone(),
                            reason: reason.to_string(),
                        },
                    ));
                }
                None => queue.push_back((next, Map::new(), depth + 1)),
            }
        }

        let mut outcomes = outcomes.into_iter();
        match outcomes.next() {
            Some(mut first) => {
                first.chained = outcomes.collect();
                first
            }
            None => ActionOutcome::failed(name, ActionError::NotFound(name.to_string())),
        }
    }

    fn trigger_of(&self, action: &str) -> Option<String> {
        self.inner
            .document
            .read()
            .events
            .get(action)
            .and_then(|spec| spec.triggers.clone())
    }

    /// One action, no chaining. Returns the published record id.
    async fn publish_action(
        &self,
        action: &str,
        form_data: Map<String, Value>,
    ) -> Result<String, ActionError> {
        let spec = self
            .inner
            .document
            .read()
            .events
            .get(action)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(action.to_string()))?;

        let context = {
            let mut st = self.inner.state.lock();
            st.context.form_data = form_data;
            st.context.touch();
            st.context.clone()
        };

        let (content, tags) = build_record(action, &spec, &context)?;
        let signer = self.inner.signer.clone().ok_or(ActionError::NoSigner)?;
        let unsigned = UnsignedEvent {
            pubkey: signer.public_key(),
            created_at: context.now,
            kind: spec.kind,
            tags,
            content,
        };
        let event = signer.sign(unsigned).await.map_err(ActionError::Signing)?;

        let receipt = self
            .inner
            .layer
            .transport
            .publish(&event)
            .await
            .map_err(|e| ActionError::PublishFailure(e.to_string()))?;
        if receipt.success_count == 0 {
            return Err(ActionError::PublishFailure(
                "no relay accepted the record".to_string(),
            ));
        }

        self.inner
            .state
            .lock()
            .context
            .action_results
            .insert(action.to_string(), receipt.id.clone());

        // queries referencing @action, plus queries whose results the new
        // record belongs to
        let graph = self.graph();
        let mut stale: HashSet<String> =
            graph.queries_referencing_action(action).into_iter().collect();
        let evicted = self.inner.layer.cache.invalidate_matching(&event);
        {
            let st = self.inner.state.lock();
            for (query, filter) in &st.filters {
                if filter.matches(&event) {
                    stale.insert(query.clone());
                }
            }
            for query in &stale {
                if let Some(filter) = st.filters.get(query) {
                    self.inner.layer.cache.invalidate(filter);
                }
            }
        }
        tracing::debug!(action, evicted, stale = stale.len(), "refreshing after publish");

        match self.run_passes(stale).await {
            Ok(changed) => {
                if self.inner.options.live {
                    self.ensure_live_all().await;
                }
                self.emit(changed);
            }
            Err(err) => tracing::warn!(error = %err, "refresh after publish failed"),
        }
        Ok(receipt.id)
    }
}

/// Resolve content and tags of an action against `context`.
fn build_record(
    action: &str,
    spec: &ActionSpec,
    context: &ResolutionContext,
) -> Result<(String, Vec<Vec<String>>), ActionError> {
    let content = match (&spec.json_template, &spec.content) {
        (Some(template), _) => {
            let resolved = resolver::resolve(template, context);
            serde_json::to_string(&resolved).unwrap_or_default()
        }
        (None, Some(content)) => resolver::resolve_to_text(content, context),
        (None, None) => String::new(),
    };

    let mut tags: Vec<Vec<String>> = Vec::with_capacity(spec.tags.len() + 1);
    for tag in &spec.tags {
        let mut resolved = Vec::with_capacity(tag.len());
        for part in tag {
            let value = resolver::resolve_string(part, context);
            if let Some(token) = resolver::first_unresolved(&value) {
                return Err(ActionError::UnresolvedReference {
                    action: action.to_string(),
                    token,
                });
            }
            resolved.push(resolver::unescape(&resolver::value_to_string(&value)));
        }
        tags.push(resolved);
    }
    if let Some(d_tag) = &spec.d_tag {
        tags.push(vec![
            "d".to_string(),
            resolver::resolve_to_text(d_tag, context),
        ]);
    }
    Ok((content, tags))
}
