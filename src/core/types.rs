//! RW-001: Document, query, filter, event and action types.
//!
//! Everything the document compiler hands to the engine derives
//! Serialize/Deserialize (and JsonSchema for `relayweave schema`).
//! Filters exist in two forms: the raw JSON map taken from the document, and
//! the typed [`Filter`], which can only be built from a fully resolved map.

use super::error::EngineError;
use super::resolver;
use crate::cache::hasher;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Document
// ============================================================================

/// A compiled document: named queries, named write actions, imports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DocumentSpec {
    /// Named queries (`$name` or bare `name`)
    #[serde(default)]
    pub queries: IndexMap<String, QuerySpec>,

    /// Named write actions (`@name` or bare `name`)
    #[serde(default, alias = "actions")]
    pub events: IndexMap<String, ActionSpec>,

    /// Component imports resolved by the compiler (carried, not interpreted)
    #[serde(default)]
    pub imports: IndexMap<String, Value>,
}

impl DocumentSpec {
    /// Strip `$`/`@` sigils from query names, action names and trigger refs.
    pub fn normalized(self) -> Self {
        let queries = self
            .queries
            .into_iter()
            .map(|(name, mut spec)| {
                spec.triggers = spec.triggers.map(|t| strip_sigil(&t, '@'));
                (strip_sigil(&name, '$'), spec)
            })
            .collect();
        let events = self
            .events
            .into_iter()
            .map(|(name, mut spec)| {
                spec.triggers = spec.triggers.map(|t| strip_sigil(&t, '@'));
                (strip_sigil(&name, '@'), spec)
            })
            .collect();
        Self {
            queries,
            events,
            imports: self.imports,
        }
    }
}

/// Remove one leading sigil, if present.
pub fn strip_sigil(name: &str, sigil: char) -> String {
    name.strip_prefix(sigil).unwrap_or(name).to_string()
}

// ============================================================================
// Queries
// ============================================================================

/// A named query: flat filter fields plus an optional pipe and trigger.
///
/// Every key other than `pipe` and `triggers` is a filter field, so
/// `{"kinds": [3], "authors": ["user.pubkey"], "pipe": [...]}` deserializes
/// directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuerySpec {
    /// Post-fetch transformation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipe: Vec<PipeOp>,

    /// Action fired when the live value changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<String>,

    /// Raw, possibly symbolic, filter fields
    #[serde(flatten)]
    pub filter: Map<String, Value>,
}

impl QuerySpec {
    /// The raw filter as a JSON value (input to the resolver).
    pub fn filter_value(&self) -> Value {
        Value::Object(self.filter.clone())
    }
}

// ============================================================================
// Filters
// ============================================================================

/// A fully resolved relay filter. Never contains symbolic references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,

    /// Tag filters keyed with their `#` prefix (`#e`, `#p`, `#d`, ...)
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a typed filter from a resolved JSON map.
    ///
    /// Fails with [`EngineError::UnresolvedReference`] if any value is still a
    /// symbolic token, so nothing unresolved can reach a transport.
    pub fn from_resolved(query: &str, map: &Map<String, Value>) -> Result<Self, EngineError> {
        if let Some(token) = resolver::first_unresolved(&Value::Object(map.clone())) {
            return Err(EngineError::unresolved(query, token));
        }

        let mut filter = Filter::default();
        for (key, value) in map {
            match key.as_str() {
                "ids" => filter.ids = Some(string_list(query, key, value)?),
                "authors" => filter.authors = Some(string_list(query, key, value)?),
                "kinds" => filter.kinds = Some(number_list(query, key, value)?),
                "since" => filter.since = Some(number(query, key, value)?),
                "until" => filter.until = Some(number(query, key, value)?),
                "limit" => filter.limit = Some(number(query, key, value)? as usize),
                k if k.starts_with('#') => {
                    filter.tags.insert(k.to_string(), string_list(query, key, value)?);
                }
                other => {
                    tracing::debug!(query, field = other, "ignoring unsupported filter field");
                }
            }
        }
        Ok(filter)
    }

    /// Nostr matching semantics. `limit` does not affect matching.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(key, wanted)| {
            let name = key.trim_start_matches('#');
            event.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some(name)
                    && tag.get(1).is_some_and(|v| wanted.contains(v))
            })
        })
    }

    /// Canonical JSON with recursively sorted keys; the cache and subscription key.
    pub fn canonical_key(&self) -> String {
        hasher::canonical_json(&serde_json::to_value(self).unwrap_or_default())
    }

    /// The live-only variant of this filter (`limit: 0` skips stored events).
    pub fn live(&self) -> Self {
        Self {
            limit: Some(0),
            ..self.clone()
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_key())
    }
}

fn string_list(query: &str, field: &str, value: &Value) -> Result<Vec<String>, EngineError> {
    match value {
        Value::String(s) => Ok(vec![resolver::unescape(s)]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(resolver::unescape(s)),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(EngineError::invalid_filter(
                    query,
                    field,
                    format!("expected string, got {other}"),
                )),
            })
            .collect(),
        other => Err(EngineError::invalid_filter(
            query,
            field,
            format!("expected string list, got {other}"),
        )),
    }
}

fn number_list(query: &str, field: &str, value: &Value) -> Result<Vec<u64>, EngineError> {
    match value {
        Value::Array(items) => items.iter().map(|item| number(query, field, item)).collect(),
        single => Ok(vec![number(query, field, single)?]),
    }
}

fn number(query: &str, field: &str, value: &Value) -> Result<u64, EngineError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| EngineError::invalid_filter(query, field, format!("bad number {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid_filter(query, field, format!("bad number {s:?}"))),
        other => Err(EngineError::invalid_filter(
            query,
            field,
            format!("expected number, got {other}"),
        )),
    }
}

// ============================================================================
// Events
// ============================================================================

/// A signed record as stored on and delivered by relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// JSON form consumed by the pipe engine.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Values at position 1 of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

/// Convert a fetched event set into the pipe engine's input value.
pub fn events_to_value(events: &[Event]) -> Value {
    Value::Array(events.iter().map(Event::to_value).collect())
}

/// A record built by the action executor, before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

// ============================================================================
// Pipes
// ============================================================================

/// One pipe operation. Closed set, dispatched by [`crate::core::pipe::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PipeOp {
    First,
    Last,
    Reverse,
    Unique,
    Flatten,
    Compact,
    #[serde(alias = "count")]
    Length,
    Keys,
    Values,
    Sum,
    Min,
    Max,
    Average,
    Get {
        field: String,
    },
    Pluck {
        field: String,
    },
    GroupBy {
        field: String,
    },
    #[serde(rename = "default")]
    DefaultTo {
        value: Value,
    },
    Limit {
        count: usize,
    },
    Take {
        count: usize,
    },
    #[serde(rename = "drop")]
    Skip {
        count: usize,
    },
    Add {
        value: f64,
    },
    Multiply {
        value: f64,
    },
    Filter {
        field: String,
        #[serde(default)]
        cmp: Comparison,
        value: Value,
    },
    Where {
        field: String,
        #[serde(default)]
        value: Option<Value>,
    },
    Sort {
        #[serde(default)]
        by: Option<String>,
        #[serde(default)]
        order: SortOrder,
    },
    FilterTag {
        tag: String,
        #[serde(default)]
        value: Option<String>,
    },
    PluckTag {
        tag: String,
        #[serde(default = "default_tag_index")]
        index: usize,
    },
    WhereIndex {
        index: usize,
        value: Value,
    },
    PluckIndex {
        index: usize,
    },
    Join {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Split {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Uppercase,
    Lowercase,
    Trim,
    Truncate {
        length: usize,
    },
    Replace {
        from: String,
        to: String,
    },
    ParseJson,
    Stringify,
    Merge {
        value: Value,
    },
    Pick {
        fields: Vec<String>,
    },
    Omit {
        fields: Vec<String>,
    },
    Defaults {
        value: Value,
    },
    Map {
        pipe: Vec<PipeOp>,
    },
    Construct {
        fields: IndexMap<String, Vec<PipeOp>>,
    },
}

fn default_tag_index() -> usize {
    1
}

fn default_separator() -> String {
    ",".to_string()
}

/// Comparison used by the `filter` op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ============================================================================
// Actions
// ============================================================================

/// A write-action template, resolved on every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Event kind to publish
    pub kind: u64,

    /// String content template (`{expr}` placeholders or a bare token)
    #[serde(default)]
    pub content: Option<String>,

    /// JSON content template, resolved recursively then serialized
    #[serde(default)]
    pub json_template: Option<Value>,

    /// Tag templates
    #[serde(default)]
    pub tags: Vec<Vec<String>>,

    /// Replaceable-event identifier, appended as `["d", ...]`
    #[serde(default)]
    pub d_tag: Option<String>,

    /// Action chained after a successful publish
    #[serde(default)]
    pub triggers: Option<String>,
}

// ============================================================================
// Run output
// ============================================================================

/// Lifecycle of one query within an executor scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// Filter still holds unresolved references; retried next pass.
    Pending { unresolved: String },
    /// Result stored in the context.
    Resolved,
    /// Transport failure; empty result, retried on the next run.
    Failed { error: String },
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending { unresolved } => write!(f, "PENDING ({unresolved})"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Failed { error } => write!(f, "FAILED ({error})"),
        }
    }
}

/// Snapshot returned by `Executor::run_all`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutput {
    /// Every query of the document; pending/failed queries map to `[]`
    pub query_results: IndexMap<String, Value>,

    /// `$query`, `@action`, `user.pubkey`, `time.now` as flat variables
    pub extracted_variables: IndexMap<String, Value>,

    /// Queries still waiting on unresolved references
    pub pending: Vec<String>,
}
