// ironlinq-core/src/memory/operators.rs
//! Match-dialect query operators
//!
//! Each operator (`$eq`, `$gt`, `$and`, ...) is a separate type implementing
//! [`OperatorMatcher`], looked up by name in [`OPERATOR_REGISTRY`].
//!
//! ```text
//! OperatorMatcher trait
//!     ↓
//! ┌────────────────┬────────────────┬────────────────┐
//! │ Comparison     │ Logical        │ Element/Array  │
//! │ ($eq, $gt...)  │ ($and, $or...) │ ($exists...)   │
//! └────────────────┴────────────────┴────────────────┘
//! ```

use super::expression::{is_truthy, Evaluator, Variables};
use crate::codec;
use crate::error::{LinqError, Result};
use crate::value_utils::{compare_values, resolve_path, values_equal};
use ahash::AHashMap;
use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::num::NonZeroUsize;

fn invalid(message: impl Into<String>) -> LinqError {
    LinqError::Store(message.into())
}

// ============================================================================
// REGEX WITH OPTIONS SUPPORT
// ============================================================================

lazy_static! {
    /// Compiled patterns keyed by "pattern:options", LRU with 100 entries
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN)));
}

/// Prefix the pattern with inline flags for the option letters `i`, `m`, `s`, `x`
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}:{}", pattern, options);
    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options))
        .map_err(|e| invalid(format!("Invalid regex pattern '{}': {}", pattern, e)))?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

/// Regex test with option letters; shared with `$regexMatch`
pub(crate) fn regex_match_with_options(text: &str, pattern: &str, options: &str) -> Result<bool> {
    Ok(get_or_compile_regex(pattern, options)?.is_match(text))
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// Document and variables a filter is evaluated against
pub struct MatchContext<'a> {
    pub document: &'a Value,
    pub vars: &'a Variables,
}

/// One query operator
///
/// `doc_value` is the field value (`None` when the field is missing), `filter_value` the
/// operand from the filter. Logical operators ignore `doc_value` and recurse through the
/// context's document.
pub trait OperatorMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        ctx: &MatchContext<'_>,
    ) -> Result<bool>;
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// Equality with array-element matching; a null operand also matches a missing field
fn equals_with_elements(doc_value: Option<&Value>, filter_value: &Value) -> bool {
    match doc_value {
        None => filter_value.is_null(),
        Some(v) => {
            values_equal(v, filter_value)
                || matches!(v, Value::Array(items) if items.iter().any(|e| values_equal(e, filter_value)))
        }
    }
}

/// $eq: `{ field: { $eq: value } }`, shorthand `{ field: value }`
pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        Ok(equals_with_elements(doc_value, filter_value))
    }
}

/// $ne: true when the field is missing
pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        Ok(!equals_with_elements(doc_value, filter_value))
    }
}

/// Ordering comparison for $gt, $gte, $lt, $lte with array-element matching.
/// Values of different kinds never match.
fn compare_with_predicate<F>(doc_value: Option<&Value>, filter_value: &Value, predicate: F) -> Result<bool>
where
    F: Fn(Ordering) -> bool,
{
    let v = match doc_value {
        None => return Ok(false),
        Some(v) => v,
    };
    if compare_values(v, filter_value).map_or(false, &predicate) {
        return Ok(true);
    }
    if let Value::Array(items) = v {
        return Ok(items
            .iter()
            .any(|e| compare_values(e, filter_value).map_or(false, &predicate)));
    }
    Ok(false)
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Greater)
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Less)
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Less)
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Greater)
    }
}

// ============================================================================
// ARRAY OPERATORS
// ============================================================================

fn membership(op: &str, doc_value: Option<&Value>, filter_value: &Value) -> Result<bool> {
    match filter_value {
        Value::Array(candidates) => Ok(candidates
            .iter()
            .any(|candidate| equals_with_elements(doc_value, candidate))),
        _ => Err(invalid(format!("{} needs an array", op))),
    }
}

/// $in: `{ field: { $in: [v1, v2, ...] } }`
pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        membership("$in", doc_value, filter_value)
    }
}

/// $nin: true when the field is missing
pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        Ok(!membership("$nin", doc_value, filter_value)?)
    }
}

/// $size: array with exactly n elements
pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        let size = filter_value
            .as_i64()
            .ok_or_else(|| invalid("$size needs a number"))?;
        Ok(matches!(doc_value, Some(Value::Array(items)) if items.len() as i64 == size))
    }
}

/// $elemMatch: at least one element satisfies every condition
///
/// `{ tags: { $elemMatch: { $gt: 5 } } }` tests elements directly,
/// `{ pets: { $elemMatch: { Age: { $gt: 5 } } } }` treats each element as a document.
pub struct ElemMatchOperator;

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        let items = match doc_value {
            Some(Value::Array(items)) => items,
            _ => return Ok(false),
        };
        let operator_form = filter_value
            .as_object()
            .map_or(false, |o| o.keys().all(|k| k.starts_with('$')));
        for item in items {
            let hit = if operator_form {
                matches_filter_value(Some(item), filter_value, ctx)?
            } else {
                item.is_object() && matches_filter_with_vars(item, filter_value, ctx.vars)?
            };
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// ELEMENT OPERATORS
// ============================================================================

/// $exists: `{ field: { $exists: true } }`
pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        Ok(doc_value.is_some() == is_truthy(filter_value))
    }
}

/// $regex without `$options`: string fields, or any string element of an array
pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: &MatchContext<'_>) -> Result<bool> {
        let pattern = filter_value
            .as_str()
            .ok_or_else(|| invalid("$regex has to be a string"))?;
        regex_field_match(doc_value, pattern, "")
    }
}

fn regex_field_match(doc_value: Option<&Value>, pattern: &str, options: &str) -> Result<bool> {
    match doc_value {
        Some(Value::String(s)) => regex_match_with_options(s, pattern, options),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(s) = item {
                    if regex_match_with_options(s, pattern, options)? {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

fn clauses<'v>(op: &str, filter_value: &'v Value) -> Result<&'v Vec<Value>> {
    match filter_value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(invalid(format!("{} must be a nonempty array", op))),
    }
}

/// $and: `{ $and: [ {..}, {..} ] }`
pub struct AndOperator;

impl OperatorMatcher for AndOperator {
    fn name(&self) -> &'static str {
        "$and"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        for clause in clauses("$and", filter_value)? {
            if !matches_filter_with_vars(ctx.document, clause, ctx.vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct OrOperator;

impl OperatorMatcher for OrOperator {
    fn name(&self) -> &'static str {
        "$or"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        for clause in clauses("$or", filter_value)? {
            if matches_filter_with_vars(ctx.document, clause, ctx.vars)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// $nor: true only if every clause is false
pub struct NorOperator;

impl OperatorMatcher for NorOperator {
    fn name(&self) -> &'static str {
        "$nor"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        for clause in clauses("$nor", filter_value)? {
            if matches_filter_with_vars(ctx.document, clause, ctx.vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// $not: `{ field: { $not: { $size: 0 } } }`
pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        if !filter_value.is_object() {
            return Err(invalid("$not needs a regex or a document"));
        }
        Ok(!matches_filter_value(doc_value, filter_value, ctx)?)
    }
}

/// $expr: `{ $expr: <aggregation expression> }`, evaluated for truthiness
pub struct ExprOperator;

impl OperatorMatcher for ExprOperator {
    fn name(&self) -> &'static str {
        "$expr"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
        let evaluator = Evaluator::with_vars(ctx.document, ctx.vars.clone());
        Ok(is_truthy(&evaluator.evaluate(filter_value)?))
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Every match operator by name; immutable after first use
    pub static ref OPERATOR_REGISTRY: AHashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(SizeOperator),
            Box::new(ElemMatchOperator),
            Box::new(ExistsOperator),
            Box::new(RegexOperator),
            Box::new(AndOperator),
            Box::new(OrOperator),
            Box::new(NorOperator),
            Box::new(NotOperator),
            Box::new(ExprOperator),
        ];
        operators.into_iter().map(|op| (op.name(), op)).collect()
    };
}

fn operator(name: &str) -> Result<&'static dyn OperatorMatcher> {
    OPERATOR_REGISTRY
        .get(name)
        .map(|op| op.as_ref())
        .ok_or_else(|| invalid(format!("unknown operator: {}", name)))
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

fn is_scalar_literal(value: &Value) -> bool {
    codec::is_date(value) || codec::oid_hex(value).is_some()
}

/// Apply an operator document (`{ $gt: 5, $lt: 9 }`) or a plain value (implicit `$eq`)
/// to one field value
fn matches_filter_value(doc_value: Option<&Value>, condition: &Value, ctx: &MatchContext<'_>) -> Result<bool> {
    let ops = match condition {
        Value::Object(ops) if !is_scalar_literal(condition) && ops.keys().any(|k| k.starts_with('$')) => ops,
        other => return Ok(equals_with_elements(doc_value, other)),
    };

    // { $regex: p, $options: o } is one operation
    if let Some(pattern) = ops.get("$regex") {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| invalid("$regex has to be a string"))?;
        let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
        if !regex_field_match(doc_value, pattern, options)? {
            return Ok(false);
        }
    }

    for (name, operand) in ops {
        if name == "$regex" || name == "$options" {
            continue;
        }
        if !operator(name)?.matches(doc_value, operand, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Does `document` satisfy `filter`, with `$$` variables bound for `$expr`
pub fn matches_filter_with_vars(document: &Value, filter: &Value, vars: &Variables) -> Result<bool> {
    let filter_obj = filter
        .as_object()
        .ok_or_else(|| invalid("filter must be an object"))?;
    let ctx = MatchContext { document, vars };

    for (key, condition) in filter_obj {
        let matched = if key.starts_with('$') {
            operator(key)?.matches(None, condition, &ctx)?
        } else {
            let field_value = resolve_path(document, key);
            matches_filter_value(field_value.as_ref(), condition, &ctx)?
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn matches_filter(document: &Value, filter: &Value) -> Result<bool> {
    matches_filter_with_vars(document, filter, &Variables::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(doc: Value, filter: Value) -> bool {
        matches_filter(&doc, &filter).unwrap()
    }

    #[test]
    fn test_registry_contents() {
        for name in ["$eq", "$gt", "$in", "$exists", "$elemMatch", "$regex", "$nor", "$expr"] {
            assert!(OPERATOR_REGISTRY.contains_key(name), "{}", name);
        }
        assert_eq!(OPERATOR_REGISTRY.len(), 17);
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({"Age": 30, "Name": "Ann"});
        assert!(m(doc.clone(), json!({"Age": {"$gt": 25}})));
        assert!(m(doc.clone(), json!({"Age": {"$gte": 30, "$lt": 31}})));
        assert!(!m(doc.clone(), json!({"Age": {"$lte": 29}})));
        assert!(!m(doc.clone(), json!({"Age": {"$gt": "10"}})));
        assert!(m(doc.clone(), json!({"Name": "Ann"})));
        assert!(m(doc, json!({"Name": {"$ne": "Bob"}})));
    }

    #[test]
    fn test_null_matches_missing() {
        assert!(m(json!({"a": 1}), json!({"Nick": null})));
        assert!(m(json!({"Nick": null}), json!({"Nick": {"$eq": null}})));
        assert!(!m(json!({"Nick": "x"}), json!({"Nick": null})));
        assert!(m(json!({"Nick": "x"}), json!({"Nick": {"$ne": null}})));
    }

    #[test]
    fn test_array_element_matching() {
        let doc = json!({"Tags": ["a", "b"], "Scores": [3, 9]});
        assert!(m(doc.clone(), json!({"Tags": "b"})));
        assert!(m(doc.clone(), json!({"Scores": {"$gt": 8}})));
        assert!(m(doc.clone(), json!({"Tags": {"$in": ["z", "a"]}})));
        assert!(!m(doc.clone(), json!({"Tags": {"$nin": ["a"]}})));
        assert!(m(doc.clone(), json!({"Tags": {"$size": 2}})));
        assert!(m(doc, json!({"Tags": {"$not": {"$size": 0}}})));
    }

    #[test]
    fn test_in_requires_array() {
        let err = matches_filter(&json!({"a": 1}), &json!({"a": {"$in": null}})).unwrap_err();
        assert!(matches!(err, LinqError::Store(m) if m.contains("$in needs an array")));
    }

    #[test]
    fn test_regex_with_options() {
        let doc = json!({"Name": "Alice"});
        assert!(m(doc.clone(), json!({"Name": {"$regex": "^ali", "$options": "i"}})));
        assert!(!m(doc.clone(), json!({"Name": {"$regex": "^ali"}})));
        assert!(m(doc, json!({"Name": {"$regex": "ce$"}})));
    }

    #[test]
    fn test_logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(m(doc.clone(), json!({"$or": [{"a": 5}, {"b": 2}]})));
        assert!(!m(doc.clone(), json!({"$and": [{"a": 1}, {"b": 3}]})));
        assert!(m(doc.clone(), json!({"$nor": [{"a": 5}, {"b": 5}]})));
        assert!(m(doc, json!({"a": {"$exists": true}, "c": {"$exists": false}})));
    }

    #[test]
    fn test_elem_match_forms() {
        let doc = json!({"Pets": [{"Age": 2}, {"Age": 7}], "Nums": [1, 6]});
        assert!(m(doc.clone(), json!({"Pets": {"$elemMatch": {"Age": {"$gt": 5}}}})));
        assert!(!m(doc.clone(), json!({"Pets": {"$elemMatch": {"Age": {"$gt": 9}}}})));
        assert!(m(doc, json!({"Nums": {"$elemMatch": {"$gt": 5, "$lt": 7}}})));
    }

    #[test]
    fn test_expr_with_variables() {
        let doc = json!({"DeptId": 3});
        let mut vars = Variables::new();
        vars.insert("k0".to_string(), json!(3));
        let filter = json!({"$expr": {"$eq": ["$DeptId", "$$k0"]}});
        assert!(matches_filter_with_vars(&doc, &filter, &vars).unwrap());
        vars.insert("k0".to_string(), json!(4));
        assert!(!matches_filter_with_vars(&doc, &filter, &vars).unwrap());
    }

    #[test]
    fn test_sentinel_filter_never_matches() {
        let filter = crate::pipeline::always_false_filter();
        assert!(!m(json!({"a": 1}), filter));
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        assert!(matches_filter(&json!({"a": 1}), &json!({"a": {"$near": 1}})).is_err());
    }
}
