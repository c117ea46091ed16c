//! RW-003: Variable resolution.
//!
//! Resolves `$query`, `@action`, `user.pubkey`, `target.*`, `form.*` and
//! `time.now` against a [`ResolutionContext`]. Whole-string tokens resolve to
//! typed values; `{expr}` placeholders inside longer strings are substituted
//! as text. Unresolvable tokens come back verbatim so callers can detect
//! "still pending" with [`first_unresolved`].
//!
//! Priority for a bare token: loop variable > query result > built-in.
//! `$$` escapes a literal `$` and is never treated as a reference.

use super::context::ResolutionContext;
use serde_json::Value;

const BUILTIN_ROOTS: [&str; 4] = ["user", "target", "form", "time"];

/// Resolve every symbolic reference inside `value`.
///
/// Array elements that are tokens resolving to arrays are spliced into the
/// parent, so `"authors": ["$contacts"]` becomes the contact list.
pub fn resolve(value: &Value, ctx: &ResolutionContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) if !has_template(s) => match resolve_string(s, ctx) {
                        Value::Array(spliced) if is_symbolic_token(s) => out.extend(spliced),
                        other => out.push(other),
                    },
                    other => out.push(resolve(other, ctx)),
                }
            }
            Value::Array(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a single string: template substitution or whole-token lookup.
pub fn resolve_string(s: &str, ctx: &ResolutionContext) -> Value {
    if has_template(s) {
        return Value::String(substitute_templates(s, ctx));
    }
    resolve_expression(s.trim(), ctx).unwrap_or_else(|| Value::String(s.to_string()))
}

/// Resolve a string and render the result as text.
pub fn resolve_to_text(s: &str, ctx: &ResolutionContext) -> String {
    value_to_string(&resolve_string(s, ctx))
}

/// Resolve an expression: a token, or `token or literal`.
pub fn resolve_expression(expr: &str, ctx: &ResolutionContext) -> Option<Value> {
    if let Some((left, right)) = expr.split_once(" or ") {
        let left = left.trim();
        if is_symbolic_token(left) || is_loop_token(left, ctx) {
            return match resolve_token(left, ctx) {
                Some(v) if !is_empty(&v) => Some(v),
                _ => Some(parse_literal(right.trim())),
            };
        }
    }
    resolve_token(expr, ctx)
}

fn resolve_token(token: &str, ctx: &ResolutionContext) -> Option<Value> {
    if token.is_empty() || token.starts_with("$$") || token.contains(char::is_whitespace) {
        return None;
    }
    let mut parts = token.split('.');
    let head = parts.next()?;
    let path: Vec<&str> = parts.collect();

    let loop_var = ctx
        .loop_variables
        .get(head)
        .or_else(|| ctx.loop_variables.get(head.trim_start_matches('$')));
    if let Some(value) = loop_var {
        return lookup_path(value, &path);
    }

    if let Some(name) = head.strip_prefix('$') {
        return ctx
            .query_results
            .get(name)
            .and_then(|value| lookup_path(value, &path));
    }
    if let Some(name) = head.strip_prefix('@') {
        return ctx
            .action_results
            .get(name)
            .map(|id| Value::String(id.clone()));
    }

    match (head, path.as_slice()) {
        ("user", ["pubkey"]) => ctx.user_pubkey.clone().map(Value::String),
        ("target", [_, ..]) => ctx.target.as_ref().and_then(|t| lookup_path(t, &path)),
        ("form", [field, rest @ ..]) => ctx
            .form_data
            .get(*field)
            .and_then(|value| lookup_path(value, rest)),
        ("time", ["now"]) => Some(Value::from(ctx.now)),
        _ => None,
    }
}

/// Walk a dotted path through objects (by key) and arrays (by index).
pub fn lookup_path(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn substitute_templates(template: &str, ctx: &ResolutionContext) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        let expr = rest[open + 1..close].trim();
        result.push_str(&rest[..open]);
        match resolve_expression(expr, ctx) {
            Some(value) if !expr.is_empty() => result.push_str(&value_to_string(&value)),
            _ => result.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }

    result.push_str(rest);
    result
}

fn has_template(s: &str) -> bool {
    s.find('{')
        .is_some_and(|open| s[open..].contains('}'))
}

fn is_loop_token(token: &str, ctx: &ResolutionContext) -> bool {
    let head = token.split('.').next().unwrap_or(token);
    ctx.loop_variables.contains_key(head)
}

/// Whether `s` is a whole symbolic reference (`$q`, `@a`, `user.pubkey`, ...).
pub fn is_symbolic_token(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.starts_with("$$") || s.contains(char::is_whitespace) {
        return false;
    }
    if (s.starts_with('$') || s.starts_with('@')) && s.len() > 1 {
        return true;
    }
    match s.split_once('.') {
        Some((head, rest)) => BUILTIN_ROOTS.contains(&head) && !rest.is_empty(),
        None => false,
    }
}

/// First symbolic reference still present anywhere in `value`.
pub fn first_unresolved(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let mut tokens = Vec::new();
            collect_string_tokens(s, &mut tokens);
            tokens.into_iter().next()
        }
        Value::Array(items) => items.iter().find_map(first_unresolved),
        Value::Object(map) => map.values().find_map(first_unresolved),
        _ => None,
    }
}

/// Whether any symbolic reference survives in `value`.
pub fn contains_unresolved(value: &Value) -> bool {
    first_unresolved(value).is_some()
}

/// Bare query names referenced as `$name` (or `$name.path`) inside `value`.
pub fn query_references(value: &Value) -> Vec<String> {
    references_with_sigil(value, '$')
}

/// Bare action names referenced as `@name` inside `value`.
pub fn action_references(value: &Value) -> Vec<String> {
    references_with_sigil(value, '@')
}

fn references_with_sigil(value: &Value, sigil: char) -> Vec<String> {
    let mut tokens = Vec::new();
    collect_tokens(value, &mut tokens);
    let mut names: Vec<String> = Vec::new();
    for token in tokens {
        let head = token.split('.').next().unwrap_or(&token);
        if let Some(name) = head.strip_prefix(sigil) {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn collect_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => collect_string_tokens(s, out),
        Value::Array(items) => items.iter().for_each(|item| collect_tokens(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_tokens(item, out)),
        _ => {}
    }
}

fn collect_string_tokens(s: &str, out: &mut Vec<String>) {
    if has_template(s) {
        let mut rest = s;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|c| open + c) else {
                break;
            };
            collect_expression_token(rest[open + 1..close].trim(), out);
            rest = &rest[close + 1..];
        }
    } else {
        collect_expression_token(s.trim(), out);
    }
}

fn collect_expression_token(expr: &str, out: &mut Vec<String>) {
    let token = expr.split_once(" or ").map_or(expr, |(left, _)| left.trim());
    if is_symbolic_token(token) {
        out.push(token.to_string());
    }
}

/// Turn `$$name` escapes into literal `$name`.
pub fn unescape(s: &str) -> String {
    match s.strip_prefix("$$") {
        Some(rest) => format!("${rest}"),
        None => s.to_string(),
    }
}

/// Null, empty string, empty array, empty object.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Render a value as text: strings raw, null empty, everything else as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_literal(raw: &str) -> Value {
    if let Some(inner) = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
    {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
