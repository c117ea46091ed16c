//! RW-005: Pipe engine.
//!
//! Pure, stateless transformation of a value through an ordered list of
//! [`PipeOp`]s, applied strictly left to right. Total over every input: an
//! operation that does not fit the value's shape passes the value through
//! unchanged.
//!
//! `construct` needs to tell "a collection of records" from "one record that
//! was already selected". That decision is [`is_record_collection`] and
//! nothing else.

use super::resolver::{is_empty, lookup_path, value_to_string};
use super::types::{Comparison, PipeOp, SortOrder};
use crate::cache::hasher;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Apply a whole pipe.
pub fn apply(value: Value, ops: &[PipeOp]) -> Value {
    ops.iter().fold(value, apply_op)
}

/// A non-empty array whose every element is an object with a string `id`.
///
/// `construct` maps such a collection record by record; any other input
/// (single object, scalars, empty array) builds exactly one object.
pub fn is_record_collection(value: &Value) -> bool {
    match value {
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .all(|item| item.get("id").is_some_and(Value::is_string)),
        _ => false,
    }
}

/// Apply one operation.
pub fn apply_op(value: Value, op: &PipeOp) -> Value {
    match op {
        PipeOp::First => match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        },
        PipeOp::Last => match value {
            Value::Array(mut items) => items.pop().unwrap_or(Value::Null),
            other => other,
        },
        PipeOp::Reverse => map_array(value, |mut items| {
            items.reverse();
            Value::Array(items)
        }),
        PipeOp::Unique => map_array(value, |items| {
            let mut seen = HashSet::new();
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| seen.insert(hasher::canonical_json(item)))
                    .collect(),
            )
        }),
        PipeOp::Flatten => map_array(value, |items| {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }),
        PipeOp::Compact => map_array(value, |items| {
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| !matches!(item, Value::Null | Value::Bool(false)))
                    .filter(|item| item.as_str() != Some(""))
                    .collect(),
            )
        }),
        PipeOp::Length => match value {
            Value::Array(items) => Value::from(items.len()),
            Value::Object(map) => Value::from(map.len()),
            Value::String(s) => Value::from(s.chars().count()),
            Value::Null => Value::from(0),
            other => other,
        },
        PipeOp::Keys => match value {
            Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
            other => other,
        },
        PipeOp::Values => match value {
            Value::Object(map) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
            other => other,
        },
        PipeOp::Sum => map_array(value, |items| number_value(numbers(&items).sum())),
        PipeOp::Min => map_array(value, |items| {
            numbers(&items)
                .reduce(f64::min)
                .map_or(Value::Null, number_value)
        }),
        PipeOp::Max => map_array(value, |items| {
            numbers(&items)
                .reduce(f64::max)
                .map_or(Value::Null, number_value)
        }),
        PipeOp::Average => map_array(value, |items| {
            let nums: Vec<f64> = numbers(&items).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number_value(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }),
        PipeOp::Get { field } => match value {
            Value::Object(_) => field_of(&value, field),
            other => other,
        },
        PipeOp::Pluck { field } => map_array(value, |items| {
            Value::Array(
                items
                    .iter()
                    .filter_map(|item| lookup_path(item, &split_path(field)))
                    .collect(),
            )
        }),
        PipeOp::GroupBy { field } => map_array(value, |items| {
            let mut groups: Map<String, Value> = Map::new();
            for item in items {
                let Some(key) = lookup_path(&item, &split_path(field)) else {
                    continue;
                };
                let slot = groups
                    .entry(value_to_string(&key))
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(group) = slot {
                    group.push(item);
                }
            }
            Value::Object(groups)
        }),
        PipeOp::DefaultTo { value: fallback } => {
            if is_empty(&value) {
                fallback.clone()
            } else {
                value
            }
        }
        PipeOp::Limit { count } | PipeOp::Take { count } => map_array(value, |mut items| {
            items.truncate(*count);
            Value::Array(items)
        }),
        PipeOp::Skip { count } => map_array(value, |items| {
            Value::Array(items.into_iter().skip(*count).collect())
        }),
        PipeOp::Add { value: operand } => match value.as_f64() {
            Some(n) => number_value(n + operand),
            None => value,
        },
        PipeOp::Multiply { value: operand } => match value.as_f64() {
            Some(n) => number_value(n * operand),
            None => value,
        },
        PipeOp::Filter {
            field,
            cmp,
            value: expected,
        } => map_array(value, |items| {
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| compare(&field_of(item, field), *cmp, expected))
                    .collect(),
            )
        }),
        PipeOp::Where {
            field,
            value: expected,
        } => map_array(value, |items| {
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| {
                        let actual = field_of(item, field);
                        match expected {
                            Some(expected) => values_equal(&actual, expected),
                            None => is_truthy(&actual),
                        }
                    })
                    .collect(),
            )
        }),
        PipeOp::Sort { by, order } => map_array(value, |mut items| {
            items.sort_by(|a, b| {
                let ordering = match by {
                    Some(field) => compare_values(&field_of(a, field), &field_of(b, field)),
                    None => compare_values(a, b),
                };
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
            Value::Array(items)
        }),
        PipeOp::FilterTag { tag, value: wanted } => map_array(value, |items| {
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| match item {
                        Value::Array(_) => tag_matches(item, tag, wanted.as_deref()),
                        Value::Object(_) => tags_of(item)
                            .iter()
                            .any(|t| tag_matches(t, tag, wanted.as_deref())),
                        _ => false,
                    })
                    .collect(),
            )
        }),
        PipeOp::PluckTag { tag, index } => match value {
            Value::Object(_) => Value::Array(pluck_tag(&tags_of(&value), tag, *index)),
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in &items {
                    match item {
                        Value::Array(_) => {
                            out.extend(pluck_tag(std::slice::from_ref(item), tag, *index))
                        }
                        Value::Object(_) => out.extend(pluck_tag(&tags_of(item), tag, *index)),
                        _ => {}
                    }
                }
                Value::Array(out)
            }
            other => other,
        },
        PipeOp::WhereIndex {
            index,
            value: expected,
        } => map_array(value, |items| {
            Value::Array(
                items
                    .into_iter()
                    .filter(|item| {
                        item.get(*index)
                            .is_some_and(|actual| values_equal(actual, expected))
                    })
                    .collect(),
            )
        }),
        PipeOp::PluckIndex { index } => map_array(value, |items| {
            Value::Array(
                items
                    .iter()
                    .filter_map(|item| item.as_array().and_then(|a| a.get(*index)).cloned())
                    .collect(),
            )
        }),
        PipeOp::Join { separator } => map_array(value, |items| {
            Value::String(
                items
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(separator),
            )
        }),
        PipeOp::Split { separator } => match value {
            Value::String(s) if s.is_empty() => Value::Array(Vec::new()),
            Value::String(s) => Value::Array(
                s.split(separator.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
            other => other,
        },
        PipeOp::Uppercase => map_strings(value, |s| s.to_uppercase()),
        PipeOp::Lowercase => map_strings(value, |s| s.to_lowercase()),
        PipeOp::Trim => map_strings(value, |s| s.trim().to_string()),
        PipeOp::Truncate { length } => map_strings(value, |s| s.chars().take(*length).collect()),
        PipeOp::Replace { from, to } => map_strings(value, |s| s.replace(from.as_str(), to)),
        PipeOp::ParseJson => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        },
        PipeOp::Stringify => match value {
            Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        },
        PipeOp::Merge { value: extra } => match value {
            Value::Object(mut map) => {
                merge_into(&mut map, extra, true);
                Value::Object(map)
            }
            Value::Array(items) if items.iter().all(Value::is_object) => {
                let mut map = Map::new();
                for item in &items {
                    merge_into(&mut map, item, true);
                }
                merge_into(&mut map, extra, true);
                Value::Object(map)
            }
            other => other,
        },
        PipeOp::Pick { fields } => map_objects(value, |map| {
            fields
                .iter()
                .filter_map(|f| map.get(f).map(|v| (f.clone(), v.clone())))
                .collect()
        }),
        PipeOp::Omit { fields } => map_objects(value, |map| {
            map.iter()
                .filter(|(k, _)| !fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }),
        PipeOp::Defaults { value: defaults } => match value {
            Value::Object(mut map) => {
                merge_into(&mut map, defaults, false);
                Value::Object(map)
            }
            other => other,
        },
        PipeOp::Map { pipe } => map_array(value, |items| {
            Value::Array(items.into_iter().map(|item| apply(item, pipe)).collect())
        }),
        PipeOp::Construct { fields } => {
            if is_record_collection(&value) {
                map_array(value, |items| {
                    Value::Array(items.iter().map(|item| construct(item, fields)).collect())
                })
            } else if value.is_array() || value.is_object() {
                construct(&value, fields)
            } else {
                value
            }
        }
    }
}

fn construct(source: &Value, fields: &IndexMap<String, Vec<PipeOp>>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(name, pipe)| (name.clone(), apply(source.clone(), pipe)))
            .collect(),
    )
}

fn map_array(value: Value, f: impl FnOnce(Vec<Value>) -> Value) -> Value {
    match value {
        Value::Array(items) => f(items),
        other => other,
    }
}

fn map_strings(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(f(&s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn map_objects(value: Value, f: impl Fn(&Map<String, Value>) -> Map<String, Value>) -> Value {
    match value {
        Value::Object(map) => Value::Object(f(&map)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Value::Object(f(&map)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn merge_into(target: &mut Map<String, Value>, source: &Value, overwrite: bool) {
    if let Value::Object(source) = source {
        for (k, v) in source {
            let missing = target.get(k).is_none_or(Value::is_null);
            if overwrite || missing {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn split_path(field: &str) -> Vec<&str> {
    field.split('.').filter(|s| !s.is_empty()).collect()
}

/// `"."` (or empty) addresses the element itself; missing fields are null.
fn field_of(item: &Value, field: &str) -> Value {
    lookup_path(item, &split_path(field)).unwrap_or(Value::Null)
}

fn tags_of(item: &Value) -> Vec<Value> {
    item.get("tags")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn tag_matches(tag: &Value, name: &str, wanted: Option<&str>) -> bool {
    tag.get(0).and_then(Value::as_str) == Some(name)
        && wanted.is_none_or(|w| tag.get(1).and_then(Value::as_str) == Some(w))
}

fn pluck_tag(tags: &[Value], name: &str, index: usize) -> Vec<Value> {
    tags.iter()
        .filter(|t| tag_matches(t, name, None))
        .filter_map(|t| t.get(index).cloned())
        .collect()
}

fn numbers(items: &[Value]) -> impl Iterator<Item = f64> + '_ {
    items.iter().filter_map(Value::as_f64)
}

/// Integral results stay integers so `count`/`sum` compare equal to JSON ints.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        other => !is_empty(other),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used by `sort`: numbers numerically, strings lexically,
/// mixed types by type rank.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare(actual: &Value, cmp: Comparison, expected: &Value) -> bool {
    let comparable = type_rank(actual) == type_rank(expected)
        && matches!(actual, Value::Number(_) | Value::String(_));
    match cmp {
        Comparison::Eq => values_equal(actual, expected),
        Comparison::Ne => !values_equal(actual, expected),
        Comparison::Gt => comparable && compare_values(actual, expected) == Ordering::Greater,
        Comparison::Gte => comparable && compare_values(actual, expected) != Ordering::Less,
        Comparison::Lt => comparable && compare_values(actual, expected) == Ordering::Less,
        Comparison::Lte => comparable && compare_values(actual, expected) != Ordering::Greater,
        Comparison::Contains => match (actual, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ops(v: Value) -> Vec<PipeOp> {
        serde_json::from_value(v).unwrap()
    }

    fn contact_list() -> Value {
        json!([{
            "id": "c1",
            "pubkey": "me",
            "kind": 3,
            "created_at": 10,
            "tags": [["p", "abc"], ["p", "def"]],
            "content": ""
        }])
    }

    #[test]
    fn test_rw005_contacts_scenario() {
        let pipe = ops(json!([
            {"op": "first"},
            {"op": "get", "field": "tags"},
            {"op": "pluckIndex", "index": 1}
        ]));
        assert_eq!(apply(contact_list(), &pipe), json!(["abc", "def"]));
    }

    #[test]
    fn test_rw005_simple_ops() {
        let v = json!([3, 1, 2, 1]);
        assert_eq!(apply(v.clone(), &[PipeOp::First]), json!(3));
        assert_eq!(apply(v.clone(), &[PipeOp::Last]), json!(1));
        assert_eq!(apply(v.clone(), &[PipeOp::Reverse]), json!([1, 2, 1, 3]));
        assert_eq!(apply(v.clone(), &[PipeOp::Unique]), json!([3, 1, 2]));
        assert_eq!(apply(v.clone(), &[PipeOp::Length]), json!(4));
        assert_eq!(apply(v.clone(), &[PipeOp::Sum]), json!(7));
        assert_eq!(apply(v.clone(), &[PipeOp::Min]), json!(1));
        assert_eq!(apply(v.clone(), &[PipeOp::Max]), json!(3));
        assert_eq!(apply(v, &[PipeOp::Average]), json!(1.75));
        assert_eq!(apply(json!([]), &[PipeOp::First]), Value::Null);
        assert_eq!(apply(json!([]), &[PipeOp::Length]), json!(0));
        assert_eq!(apply(json!([[1], [2, [3]], 4]), &[PipeOp::Flatten]), json!([1, 2, [3], 4]));
        assert_eq!(apply(json!([0, null, "", false, "x"]), &[PipeOp::Compact]), json!([0, "x"]));
        assert_eq!(apply(json!({"a": 1, "b": 2}), &[PipeOp::Keys]), json!(["a", "b"]));
        assert_eq!(apply(json!({"a": 1, "b": 2}), &[PipeOp::Values]), json!([1, 2]));
    }

    #[test]
    fn test_rw005_shape_mismatch_is_noop() {
        for op in [
            PipeOp::First,
            PipeOp::Reverse,
            PipeOp::Sum,
            PipeOp::Keys,
            PipeOp::Map { pipe: vec![PipeOp::Length] },
            PipeOp::GroupBy { field: "x".into() },
            PipeOp::Construct { fields: IndexMap::new() },
        ] {
            assert_eq!(apply(json!(42), std::slice::from_ref(&op)), json!(42), "{op:?}");
        }
        assert_eq!(apply(json!("text"), &[PipeOp::Get { field: "a".into() }]), json!("text"));
        assert_eq!(apply(json!(true), &[PipeOp::Add { value: 1.0 }]), json!(true));
    }

    #[test]
    fn test_rw005_field_ops() {
        let rows = json!([
            {"id": "1", "pubkey": "a", "kind": 1, "meta": {"score": 5}},
            {"id": "2", "pubkey": "b", "kind": 7},
            {"id": "3", "pubkey": "a", "kind": 7, "meta": {"score": 2}}
        ]);
        assert_eq!(
            apply(rows.clone(), &[PipeOp::Pluck { field: "meta.score".into() }]),
            json!([5, 2])
        );
        let grouped = apply(rows.clone(), &[PipeOp::GroupBy { field: "pubkey".into() }]);
        assert_eq!(grouped["a"].as_array().unwrap().len(), 2);
        assert_eq!(grouped["b"].as_array().unwrap().len(), 1);
        assert_eq!(apply(rows.clone(), &[PipeOp::Get { field: "x".into() }]), rows);
        assert_eq!(
            apply(json!({"a": {"b": 1}}), &[PipeOp::Get { field: "a.b".into() }]),
            json!(1)
        );
        assert_eq!(apply(json!({"a": 1}), &[PipeOp::Get { field: "z".into() }]), Value::Null);
    }

    #[test]
    fn test_rw005_value_ops() {
        assert_eq!(apply(Value::Null, &[PipeOp::DefaultTo { value: json!(0) }]), json!(0));
        assert_eq!(apply(json!([]), &[PipeOp::DefaultTo { value: json!("none") }]), json!("none"));
        assert_eq!(apply(json!(3), &[PipeOp::DefaultTo { value: json!(0) }]), json!(3));
        assert_eq!(apply(json!([1, 2, 3]), &[PipeOp::Limit { count: 2 }]), json!([1, 2]));
        assert_eq!(apply(json!([1, 2, 3]), &[PipeOp::Take { count: 5 }]), json!([1, 2, 3]));
        assert_eq!(apply(json!([1, 2, 3]), &[PipeOp::Skip { count: 1 }]), json!([2, 3]));
        assert_eq!(apply(json!(2), &[PipeOp::Add { value: 3.0 }]), json!(5));
        assert_eq!(apply(json!(2), &[PipeOp::Multiply { value: 1.5 }]), json!(3));
        assert_eq!(apply(json!(1), &[PipeOp::Multiply { value: 0.5 }]), json!(0.5));
    }

    #[test]
    fn test_rw005_filter_and_where() {
        let rows = json!([
            {"kind": 1, "content": "gm nostr", "ok": true},
            {"kind": 7, "content": "+", "ok": false},
            {"kind": 30023, "content": "long form"}
        ]);
        let pipe = ops(json!([{"op": "filter", "field": "kind", "cmp": "gte", "value": 7}, {"op": "length"}]));
        assert_eq!(apply(rows.clone(), &pipe), json!(2));
        let pipe = ops(json!([{"op": "filter", "field": "content", "cmp": "contains", "value": "nostr"}, {"op": "pluck", "field": "kind"}]));
        assert_eq!(apply(rows.clone(), &pipe), json!([1]));
        let pipe = ops(json!([{"op": "filter", "field": "kind", "value": "1"}]));
        assert_eq!(apply(rows.clone(), &pipe), json!([]));
        let pipe = ops(json!([{"op": "where", "field": "ok"}, {"op": "length"}]));
        assert_eq!(apply(rows.clone(), &pipe), json!(1));
        let pipe = ops(json!([{"op": "where", "field": "kind", "value": 7.0}, {"op": "length"}]));
        assert_eq!(apply(rows, &pipe), json!(1));
    }

    #[test]
    fn test_rw005_sort_stable_and_ordered() {
        let rows = json!([
            {"k": 2, "i": 0},
            {"k": 1, "i": 1},
            {"k": 2, "i": 2},
            {"k": 1, "i": 3}
        ]);
        let asc = apply(rows.clone(), &ops(json!([{"op": "sort", "by": "k"}, {"op": "pluck", "field": "i"}])));
        assert_eq!(asc, json!([1, 3, 0, 2]));
        let desc = apply(rows, &ops(json!([{"op": "sort", "by": "k", "order": "desc"}, {"op": "pluck", "field": "i"}])));
        assert_eq!(desc, json!([0, 2, 1, 3]));
        assert_eq!(
            apply(json!(["b", 3, "a", 1, null]), &[PipeOp::Sort { by: None, order: SortOrder::Asc }]),
            json!([null, 1, 3, "a", "b"])
        );
    }

    #[test]
    fn test_rw005_tag_ops() {
        let events = json!([
            {"id": "1", "tags": [["t", "nostr"], ["p", "x"]]},
            {"id": "2", "tags": [["t", "rust"]]},
            {"id": "3", "tags": [["p", "y"], ["p", "z"]]}
        ]);
        let tagged = apply(events.clone(), &ops(json!([{"op": "filterTag", "tag": "t", "value": "rust"}])));
        assert_eq!(tagged, json!([{"id": "2", "tags": [["t", "rust"]]}]));
        let people = apply(events.clone(), &ops(json!([{"op": "pluckTag", "tag": "p"}])));
        assert_eq!(people, json!(["x", "y", "z"]));
        let first_people = apply(events, &ops(json!([{"op": "first"}, {"op": "pluckTag", "tag": "p"}])));
        assert_eq!(first_people, json!(["x"]));

        let tags = json!([["e", "a", "root"], ["e", "b", "reply"], ["p", "c"]]);
        assert_eq!(
            apply(tags.clone(), &ops(json!([{"op": "whereIndex", "index": 2, "value": "reply"}, {"op": "pluckIndex", "index": 1}]))),
            json!(["b"])
        );
        assert_eq!(
            apply(tags, &ops(json!([{"op": "filterTag", "tag": "e"}, {"op": "length"}]))),
            json!(2)
        );
    }

    #[test]
    fn test_rw005_string_ops() {
        assert_eq!(apply(json!(["a", "b"]), &ops(json!([{"op": "join", "separator": "-"}]))), json!("a-b"));
        assert_eq!(apply(json!("a,b"), &ops(json!([{"op": "split"}]))), json!(["a", "b"]));
        assert_eq!(apply(json!("  Hi "), &[PipeOp::Trim, PipeOp::Uppercase]), json!("HI"));
        assert_eq!(apply(json!(["A", 1]), &[PipeOp::Lowercase]), json!(["a", 1]));
        assert_eq!(apply(json!("hello"), &[PipeOp::Truncate { length: 3 }]), json!("hel"));
        assert_eq!(
            apply(json!("a-b"), &[PipeOp::Replace { from: "-".into(), to: "+".into() }]),
            json!("a+b")
        );
        assert_eq!(
            apply(json!(r#"{"name":"alice"}"#), &[PipeOp::ParseJson, PipeOp::Get { field: "name".into() }]),
            json!("alice")
        );
        assert_eq!(apply(json!("not json"), &[PipeOp::ParseJson]), json!("not json"));
        assert_eq!(apply(json!({"a": 1}), &[PipeOp::Stringify]), json!(r#"{"a":1}"#));
    }

    #[test]
    fn test_rw005_object_ops() {
        let obj = json!({"a": 1, "b": null, "c": 3});
        assert_eq!(
            apply(obj.clone(), &ops(json!([{"op": "merge", "value": {"c": 4, "d": 5}}]))),
            json!({"a": 1, "b": null, "c": 4, "d": 5})
        );
        assert_eq!(
            apply(obj.clone(), &ops(json!([{"op": "defaults", "value": {"a": 9, "b": 2, "e": 0}}]))),
            json!({"a": 1, "b": 2, "c": 3, "e": 0})
        );
        assert_eq!(apply(obj.clone(), &ops(json!([{"op": "pick", "fields": ["a", "z"]}]))), json!({"a": 1}));
        assert_eq!(apply(obj, &ops(json!([{"op": "omit", "fields": ["a", "b"]}]))), json!({"c": 3}));
        assert_eq!(
            apply(json!([{"a": 1}, {"b": 2}]), &ops(json!([{"op": "merge", "value": {}}]))),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_rw005_map_recurses_per_element() {
        let v = json!([[1, 2], [3], []]);
        assert_eq!(apply(v, &[PipeOp::Map { pipe: vec![PipeOp::Sum] }]), json!([3, 3, 0]));
    }

    #[test]
    fn test_rw005_record_collection_rule() {
        assert!(is_record_collection(&json!([{"id": "a"}, {"id": "b", "x": 1}])));
        assert!(!is_record_collection(&json!([])));
        assert!(!is_record_collection(&json!([{"id": "a"}, {"name": "b"}])));
        assert!(!is_record_collection(&json!([{"id": 1}])));
        assert!(!is_record_collection(&json!({"id": "a"})));
        assert!(!is_record_collection(&json!(["a", "b"])));
    }

    #[test]
    fn test_rw005_construct_collection_vs_single() {
        let pipe = ops(json!([{"op": "construct", "fields": {
            "author": [{"op": "get", "field": "pubkey"}],
            "mentions": [{"op": "pluckTag", "tag": "p"}]
        }}]));
        let records = json!([
            {"id": "1", "pubkey": "a", "tags": [["p", "x"]]},
            {"id": "2", "pubkey": "b", "tags": []}
        ]);
        assert_eq!(
            apply(records.clone(), &pipe),
            json!([
                {"author": "a", "mentions": ["x"]},
                {"author": "b", "mentions": []}
            ])
        );
        let single = apply(records.clone(), &[vec![PipeOp::First], pipe.clone()].concat());
        assert_eq!(single, json!({"author": "a", "mentions": ["x"]}));

        // non-record arrays build one object from the whole value
        let summary = ops(json!([{"op": "construct", "fields": {
            "total": [{"op": "length"}],
            "top": [{"op": "first"}]
        }}]));
        assert_eq!(apply(json!([5, 6]), &summary), json!({"total": 2, "top": 5}));
    }

    fn small_values() -> impl Strategy<Value = Value> {
        prop::collection::vec(
            prop_oneof![
                (0i64..6).prop_map(Value::from),
                "[a-c]".prop_map(Value::String),
                Just(Value::Null),
            ],
            0..24,
        )
        .prop_map(Value::Array)
    }

    fn keyed_rows() -> impl Strategy<Value = Value> {
        prop::collection::vec(0i64..4, 0..24).prop_map(|keys| {
            Value::Array(
                keys.into_iter()
                    .enumerate()
                    .map(|(i, k)| json!({"k": k, "i": i}))
                    .collect(),
            )
        })
    }

    proptest! {
        #[test]
        fn test_rw005_unique_idempotent(v in small_values()) {
            let once = apply(v, &[PipeOp::Unique]);
            let twice = apply(once.clone(), &[PipeOp::Unique]);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_rw005_sort_idempotent(v in small_values()) {
            let asc = PipeOp::Sort { by: None, order: SortOrder::Asc };
            let once = apply(v.clone(), std::slice::from_ref(&asc));
            let twice = apply(v, &[asc.clone(), asc]);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_rw005_sort_by_field_keeps_tie_order(v in keyed_rows()) {
            let sorted = apply(v, &[PipeOp::Sort { by: Some("k".into()), order: SortOrder::Asc }]);
            let rows = sorted.as_array().cloned().unwrap_or_default();
            for pair in rows.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a["k"].as_i64() <= b["k"].as_i64());
                if a["k"] == b["k"] {
                    prop_assert!(a["i"].as_i64() < b["i"].as_i64());
                }
            }
        }
    }
}
