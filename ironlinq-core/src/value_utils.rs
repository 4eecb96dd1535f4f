//! Value utility functions shared across modules
//!
//! Nested field access, equality and ordering over `serde_json::Value` documents whose
//! leaf scalars may be Extended JSON dates (`{"$date": ..}`) or object ids (`{"$oid": ..}`).

use crate::codec;
use serde_json::Value;
use std::cmp::Ordering;

/// Get nested value from JSON with dot notation support
///
/// Supports:
/// - Simple fields: "name"
/// - Nested objects: "address.city"
/// - Array indexing: "items.0.name"
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use ironlinq_core::value_utils::get_nested_value;
///
/// let doc = json!({"address": {"city": "NYC"}});
/// assert_eq!(get_nested_value(&doc, "address.city"), Some(&json!("NYC")));
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                value = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Resolve a field path the way aggregation expressions do: a path that walks into an
/// array of documents maps over its elements. Missing fields resolve to `None`.
pub fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let mut parts = path.splitn(2, '.');
    let head = parts.next()?;
    let rest = parts.next();
    match doc {
        Value::Object(map) => {
            let value = map.get(head)?;
            match rest {
                None => Some(value.clone()),
                Some(rest) => resolve_path(value, rest),
            }
        }
        Value::Array(items) => {
            let mapped: Vec<Value> = items
                .iter()
                .filter_map(|item| resolve_path(item, path))
                .collect();
            Some(Value::Array(mapped))
        }
        _ => None,
    }
}

/// Set a value at a nested path with dot notation support
///
/// Creates intermediate objects if they don't exist. Used by `$unwind` to put the
/// unwound element back into the document.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use ironlinq_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"name": "Alice"});
/// set_nested_value(&mut doc, "address.city", json!("NYC"));
/// assert_eq!(doc["address"]["city"], "NYC");
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = doc;
    for part in parents {
        current = match current {
            Value::Object(map) => map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            _ => return,
        };
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

/// Remove the field at a (possibly dotted) path
pub fn remove_nested_value(doc: &mut Value, path: &str) {
    match path.rsplit_once('.') {
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
        }
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = match current {
                    Value::Object(map) => match map.get_mut(part) {
                        Some(next) => next,
                        None => return,
                    },
                    _ => return,
                };
            }
            if let Value::Object(map) = current {
                map.remove(leaf);
            }
        }
    }
}

// ============================================================================
// ORDERING
// ============================================================================

/// Canonical sort-order bracket of a value (null < numbers < strings < objects < arrays
/// < object ids < booleans < dates)
pub fn type_bracket(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) if codec::oid_hex(value).is_some() => 7,
        Value::Object(_) if codec::is_date(value) => 9,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// Compare two values of the same kind
///
/// Returns `Some(Ordering)` for comparable pairs (numbers, strings, booleans, dates,
/// object ids), `None` for incompatible kinds (e.g., comparing string to number). This is
/// the comparison the match dialect uses: `{age: {$gt: "x"}}` never matches a number.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use ironlinq_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!(10), &json!(5)), Some(Ordering::Greater));
/// assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
/// assert_eq!(compare_values(&json!("a"), &json!(1)), None);
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => compare_numbers(n1, n2),
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        (Value::Object(_), Value::Object(_)) => {
            if let (Some(d1), Some(d2)) = (codec::date_millis(a), codec::date_millis(b)) {
                return Some(d1.cmp(&d2));
            }
            if let (Some(o1), Some(o2)) = (codec::oid_hex(a), codec::oid_hex(b)) {
                return Some(o1.to_ascii_lowercase().cmp(&o2.to_ascii_lowercase()));
            }
            None
        }
        _ => None,
    }
}

/// Total order over all values, used for sorting and aggregation comparisons
pub fn compare_bson(a: &Value, b: &Value) -> Ordering {
    let bracket = type_bracket(a).cmp(&type_bracket(b));
    if bracket != Ordering::Equal {
        return bracket;
    }
    if let Some(ordering) = compare_values(a, b) {
        return ordering;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ordering = compare_bson(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ordering = lk.cmp(rk).then_with(|| compare_bson(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Compare two optional values with None handling
///
/// Missing values sort like null: before any actual value.
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let null = Value::Null;
    compare_bson(a.unwrap_or(&null), b.unwrap_or(&null))
}

/// Equality that treats `1` and `1.0` as equal and compares documents by content
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_bson(a, b) == Ordering::Equal
}

/// Creates a canonical string representation of a JSON value
/// where object keys are always sorted alphabetically.
///
/// Two logically equivalent objects with different key order
/// (`{"a":1,"b":2}` and `{"b":2,"a":1}`) produce the same string. Numbers are written in
/// a normalized form so `1` and `1.0` collapse. Used for grouping keys and set operators.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use ironlinq_core::value_utils::canonical_json_string;
///
/// let v1 = json!({"a": 1, "b": 2});
/// let v2 = json!({"b": 2, "a": 1});
/// assert_eq!(canonical_json_string(&v1), canonical_json_string(&v2));
/// ```
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            let inner: String = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", k, canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");

            format!("{{{}}}", inner)
        }
        Value::Array(arr) => {
            let inner: String = arr
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        _ => value.to_string(),
    }
}
