//! RW-017: Document loading and validation.
//!
//! Loads a compiled document from JSON or YAML and checks the structural
//! constraints the executor relies on:
//! - Trigger targets must name declared actions
//! - `$query` / `@action` references must name declared entries
//! - An action sets at most one of `content` and `jsonTemplate`
//! - Query dependencies must be acyclic

use super::error::EngineError;
use super::graph::DependencyGraph;
use super::resolver;
use super::types::{ActionSpec, DocumentSpec};
use serde_json::Value;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

/// Load a document from disk; `.yaml`/`.yml` parse as YAML, anything else as JSON.
pub fn parse_document_file(path: &Path) -> Result<DocumentSpec, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => parse_document_yaml(&content),
        _ => parse_document(&content),
    }
}

/// Parse a JSON document. Sigils are stripped from names.
pub fn parse_document(json: &str) -> Result<DocumentSpec, String> {
    serde_json::from_str::<DocumentSpec>(json)
        .map(DocumentSpec::normalized)
        .map_err(|e| format!("JSON parse error: {e}"))
}

/// Parse a YAML document. Sigils are stripped from names.
pub fn parse_document_yaml(yaml: &str) -> Result<DocumentSpec, String> {
    serde_yaml_ng::from_str::<DocumentSpec>(yaml)
        .map(DocumentSpec::normalized)
        .map_err(|e| format!("YAML parse error: {e}"))
}

/// Validate a normalized document. Returns a list of errors (empty = valid).
pub fn validate_document(doc: &DocumentSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (name, query) in &doc.queries {
        if let Some(target) = &query.triggers {
            if !doc.events.contains_key(target) {
                errors.push(ValidationError::new(format!(
                    "query '{name}' triggers unknown action '{target}'"
                )));
            }
        }
        check_references(doc, &format!("query '{name}'"), &query.filter_value(), &mut errors);
    }

    for (name, action) in &doc.events {
        if action.content.is_some() && action.json_template.is_some() {
            errors.push(ValidationError::new(format!(
                "action '{name}' sets both content and jsonTemplate"
            )));
        }
        if let Some(target) = &action.triggers {
            if !doc.events.contains_key(target) {
                errors.push(ValidationError::new(format!(
                    "action '{name}' triggers unknown action '{target}'"
                )));
            }
        }
        check_references(doc, &format!("action '{name}'"), &action_templates(action), &mut errors);
    }

    if let Err(EngineError::Cycle { path }) = DependencyGraph::from_document(doc).execution_order() {
        errors.push(ValidationError::new(format!(
            "dependency cycle: {}",
            path.join(" -> ")
        )));
    }

    errors
}

/// Every templated field of an action as one JSON value.
fn action_templates(action: &ActionSpec) -> Value {
    let mut fields = vec![
        serde_json::to_value(&action.tags).unwrap_or_default(),
        action.json_template.clone().unwrap_or(Value::Null),
    ];
    if let Some(content) = &action.content {
        fields.push(Value::String(content.clone()));
    }
    if let Some(d_tag) = &action.d_tag {
        fields.push(Value::String(d_tag.clone()));
    }
    Value::Array(fields)
}

fn check_references(doc: &DocumentSpec, owner: &str, value: &Value, errors: &mut Vec<ValidationError>) {
    for query in resolver::query_references(value) {
        if !doc.queries.contains_key(&query) {
            errors.push(ValidationError::new(format!(
                "{owner} references unknown query '${query}'"
            )));
        }
    }
    for action in resolver::action_references(value) {
        if !doc.events.contains_key(&action) {
            errors.push(ValidationError::new(format!(
                "{owner} references unknown action '@{action}'"
            )));
        }
    }
}
