// ironlinq-core/src/memory/expression.rs
//! Aggregation expression evaluator
//!
//! Evaluates the project-dialect expressions (`{"$add": ["$Age", 1]}`) against one
//! document. Missing fields evaluate to null. Integer arithmetic stays integral as long
//! as every operand is an integer.

use super::operators::regex_match_with_options;
use crate::codec;
use crate::error::{LinqError, Result};
use crate::value_utils::{canonical_json_string, compare_bson, resolve_path, values_equal};
use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// `$$name` bindings visible to an expression
pub type Variables = AHashMap<String, Value>;

fn invalid(message: impl Into<String>) -> LinqError {
    LinqError::Store(message.into())
}

/// Truthiness used by `$cond`, `$and`, `$filter` and `$expr`
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if codec::is_date(value) => "date",
        Value::Object(_) if codec::oid_hex(value).is_some() => "objectId",
        Value::Object(_) => "object",
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Whole results of rounding operators come back as integers
fn whole_or_float(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        float(f)
    }
}

fn as_f64(value: &Value, op: &str) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        invalid(format!(
            "{} only supports numeric types, not {}",
            op,
            type_name(value)
        ))
    })
}

fn as_str<'v>(value: &'v Value, op: &str) -> Result<&'v str> {
    value.as_str().ok_or_else(|| {
        invalid(format!(
            "{} requires a string argument, found: {}",
            op,
            type_name(value)
        ))
    })
}

fn as_array<'v>(value: &'v Value, op: &str) -> Result<&'v Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(invalid(format!(
            "The argument to {} must be an array. Type of argument is {}",
            op,
            type_name(other)
        ))),
    }
}

fn arg<'v>(args: &'v [Value], index: usize, op: &str) -> Result<&'v Value> {
    args.get(index)
        .ok_or_else(|| invalid(format!("{} expects at least {} arguments", op, index + 1)))
}

fn date_of(value: &Value, op: &str) -> Result<DateTime<Utc>> {
    codec::value_to_date(value).ok_or_else(|| {
        invalid(format!(
            "can't convert from BSON type {} to Date in {}",
            type_name(value),
            op
        ))
    })
}

fn round_half_even(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    let y = x * scale;
    let floor = y.floor();
    let diff = y - floor;
    let rounded = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if floor % 2.0 == 0.0 {
        floor
    } else {
        floor + 1.0
    };
    rounded / scale
}

/// Evaluates expressions against a root document and a set of variables
#[derive(Clone)]
pub struct Evaluator<'a> {
    root: &'a Value,
    vars: Variables,
}

impl<'a> Evaluator<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self::with_vars(root, Variables::new())
    }

    pub fn with_vars(root: &'a Value, vars: Variables) -> Self {
        Evaluator { root, vars }
    }

    fn scoped<I>(&self, bindings: I) -> Evaluator<'a>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut scope = self.clone();
        scope.vars.extend(bindings);
        scope
    }

    fn variable(&self, reference: &str) -> Result<Value> {
        let (name, path) = match reference.split_once('.') {
            Some((name, path)) => (name, Some(path)),
            None => (reference, None),
        };
        let base = match name {
            "ROOT" | "CURRENT" => self.root.clone(),
            other => self
                .vars
                .get(other)
                .cloned()
                .ok_or_else(|| invalid(format!("Use of undefined variable: {}", other)))?,
        };
        Ok(match path {
            Some(path) => resolve_path(&base, path).unwrap_or(Value::Null),
            None => base,
        })
    }

    pub fn evaluate(&self, expr: &Value) -> Result<Value> {
        match expr {
            Value::String(s) if s.starts_with("$$") => self.variable(&s[2..]),
            Value::String(s) if s.starts_with('$') => {
                Ok(resolve_path(self.root, &s[1..]).unwrap_or(Value::Null))
            }
            Value::Array(items) => Ok(Value::Array(
                items.iter().map(|e| self.evaluate(e)).collect::<Result<_>>()?,
            )),
            Value::Object(_) if codec::is_date(expr) || codec::oid_hex(expr).is_some() => {
                Ok(expr.clone())
            }
            Value::Object(map) => match map.iter().next() {
                Some((op, operand)) if map.len() == 1 && op.starts_with('$') => {
                    self.operator(op, operand)
                }
                _ => {
                    let mut out = Map::new();
                    for (key, value) in map {
                        out.insert(key.clone(), self.evaluate(value)?);
                    }
                    Ok(Value::Object(out))
                }
            },
            other => Ok(other.clone()),
        }
    }

    /// Operands in list form: `[a, b]` or a single bare operand
    fn args(&self, operand: &Value) -> Result<Vec<Value>> {
        match operand {
            Value::Array(items) => items.iter().map(|e| self.evaluate(e)).collect(),
            other => Ok(vec![self.evaluate(other)?]),
        }
    }

    /// Named operand of an object-form operator
    fn field(&self, spec: &Value, name: &str, op: &str) -> Result<Value> {
        match spec.get(name) {
            Some(expr) => self.evaluate(expr),
            None => Err(invalid(format!("{} requires '{}'", op, name))),
        }
    }

    fn optional_field(&self, spec: &Value, name: &str) -> Result<Option<Value>> {
        spec.get(name).map(|e| self.evaluate(e)).transpose()
    }

    fn operator(&self, op: &str, operand: &Value) -> Result<Value> {
        match op {
            "$literal" => Ok(operand.clone()),
            "$cond" => self.cond(operand),
            "$ifNull" => {
                let args = self.args(operand)?;
                Ok(args
                    .iter()
                    .find(|v| !v.is_null())
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "$and" => {
                for item in self.args(operand)? {
                    if !is_truthy(&item) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "$or" => Ok(Value::Bool(self.args(operand)?.iter().any(is_truthy))),
            "$not" => {
                let args = self.args(operand)?;
                Ok(Value::Bool(!is_truthy(arg(&args, 0, op)?)))
            }
            "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
                let args = self.args(operand)?;
                let ord = compare_bson(arg(&args, 0, op)?, arg(&args, 1, op)?);
                Ok(match op {
                    "$eq" => Value::Bool(ord == Ordering::Equal),
                    "$ne" => Value::Bool(ord != Ordering::Equal),
                    "$gt" => Value::Bool(ord == Ordering::Greater),
                    "$gte" => Value::Bool(ord != Ordering::Less),
                    "$lt" => Value::Bool(ord == Ordering::Less),
                    "$lte" => Value::Bool(ord != Ordering::Greater),
                    _ => Value::from(ord as i64),
                })
            }
            "$let" => {
                let vars = operand
                    .get("vars")
                    .and_then(Value::as_object)
                    .ok_or_else(|| invalid("$let requires 'vars'"))?;
                let mut bindings = Vec::with_capacity(vars.len());
                for (name, expr) in vars {
                    bindings.push((name.clone(), self.evaluate(expr)?));
                }
                let body = operand
                    .get("in")
                    .ok_or_else(|| invalid("$let requires 'in'"))?;
                self.scoped(bindings).evaluate(body)
            }
            "$mergeObjects" => {
                let mut out = Map::new();
                for item in self.args(operand)? {
                    match item {
                        Value::Object(fields) => out.extend(fields),
                        Value::Null => {}
                        other => {
                            return Err(invalid(format!(
                                "$mergeObjects requires object inputs, but input is of type {}",
                                type_name(&other)
                            )))
                        }
                    }
                }
                Ok(Value::Object(out))
            }
            _ => {
                if let Some(value) = self.arithmetic(op, operand)? {
                    return Ok(value);
                }
                if let Some(value) = self.string_op(op, operand)? {
                    return Ok(value);
                }
                if let Some(value) = self.array_op(op, operand)? {
                    return Ok(value);
                }
                if let Some(value) = self.date_op(op, operand)? {
                    return Ok(value);
                }
                if let Some(value) = self.math_op(op, operand)? {
                    return Ok(value);
                }
                Err(invalid(format!("Unrecognized expression '{}'", op)))
            }
        }
    }

    fn cond(&self, operand: &Value) -> Result<Value> {
        let (test, if_true, if_false) = match operand {
            Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
            Value::Object(_) => (
                operand.get("if").ok_or_else(|| invalid("$cond requires 'if'"))?,
                operand.get("then").ok_or_else(|| invalid("$cond requires 'then'"))?,
                operand.get("else").ok_or_else(|| invalid("$cond requires 'else'"))?,
            ),
            _ => return Err(invalid("$cond needs exactly 3 arguments")),
        };
        if is_truthy(&self.evaluate(test)?) {
            self.evaluate(if_true)
        } else {
            self.evaluate(if_false)
        }
    }

    // ========================================================================
    // ARITHMETIC
    // ========================================================================

    fn arithmetic(&self, op: &str, operand: &Value) -> Result<Option<Value>> {
        let args = match op {
            "$add" | "$subtract" | "$multiply" | "$divide" | "$mod" | "$pow" => {
                self.args(operand)?
            }
            _ => return Ok(None),
        };
        if args.iter().any(Value::is_null) {
            return Ok(Some(Value::Null));
        }
        let value = match op {
            "$add" => add(&args)?,
            "$multiply" => {
                if args.iter().all(|v| v.as_i64().is_some()) {
                    let product = args
                        .iter()
                        .filter_map(Value::as_i64)
                        .try_fold(1i64, |acc, n| acc.checked_mul(n));
                    match product {
                        Some(p) => Value::from(p),
                        None => float(args.iter().filter_map(Value::as_f64).product()),
                    }
                } else {
                    let mut product = 1.0;
                    for v in &args {
                        product *= as_f64(v, op)?;
                    }
                    float(product)
                }
            }
            "$subtract" => subtract(arg(&args, 0, op)?, arg(&args, 1, op)?)?,
            "$divide" => {
                let divisor = as_f64(arg(&args, 1, op)?, op)?;
                if divisor == 0.0 {
                    return Err(invalid("can't $divide by zero"));
                }
                float(as_f64(arg(&args, 0, op)?, op)? / divisor)
            }
            "$mod" => {
                let (a, b) = (arg(&args, 0, op)?, arg(&args, 1, op)?);
                match (a.as_i64(), b.as_i64()) {
                    (Some(_), Some(0)) => return Err(invalid("can't $mod by zero")),
                    (Some(x), Some(y)) => Value::from(x.wrapping_rem(y)),
                    _ => {
                        let divisor = as_f64(b, op)?;
                        if divisor == 0.0 {
                            return Err(invalid("can't $mod by zero"));
                        }
                        float(as_f64(a, op)? % divisor)
                    }
                }
            }
            _ => {
                let (base, exp) = (arg(&args, 0, op)?, arg(&args, 1, op)?);
                let exact = match (base.as_i64(), exp.as_i64()) {
                    (Some(b), Some(e)) if e >= 0 => u32::try_from(e).ok().and_then(|e| b.checked_pow(e)),
                    _ => None,
                };
                match exact {
                    Some(n) => Value::from(n),
                    None => float(as_f64(base, op)?.powf(as_f64(exp, op)?)),
                }
            }
        };
        Ok(Some(value))
    }

    // ========================================================================
    // STRINGS
    // ========================================================================

    fn string_op(&self, op: &str, operand: &Value) -> Result<Option<Value>> {
        let value = match op {
            "$concat" => {
                let args = self.args(operand)?;
                if args.iter().any(Value::is_null) {
                    return Ok(Some(Value::Null));
                }
                let mut out = String::new();
                for part in &args {
                    out.push_str(as_str(part, op)?);
                }
                Value::String(out)
            }
            "$toString" => {
                let args = self.args(operand)?;
                match arg(&args, 0, op)? {
                    Value::Null => Value::Null,
                    other => Value::String(to_display_string(other)),
                }
            }
            "$toUpper" | "$toLower" => {
                let args = self.args(operand)?;
                let text = match arg(&args, 0, op)? {
                    Value::Null => String::new(),
                    other => to_display_string(other),
                };
                Value::String(if op == "$toUpper" {
                    text.to_uppercase()
                } else {
                    text.to_lowercase()
                })
            }
            "$trim" | "$ltrim" | "$rtrim" => {
                let input = self.field(operand, "input", op)?;
                if input.is_null() {
                    return Ok(Some(Value::Null));
                }
                let text = as_str(&input, op)?;
                let chars = self.optional_field(operand, "chars")?;
                let trimmed = match chars {
                    Some(Value::String(set)) => {
                        let hit = |c: char| set.contains(c);
                        match op {
                            "$trim" => text.trim_matches(hit),
                            "$ltrim" => text.trim_start_matches(hit),
                            _ => text.trim_end_matches(hit),
                        }
                    }
                    _ => match op {
                        "$trim" => text.trim(),
                        "$ltrim" => text.trim_start(),
                        _ => text.trim_end(),
                    },
                };
                Value::String(trimmed.to_string())
            }
            "$strLenCP" => {
                let args = self.args(operand)?;
                Value::from(as_str(arg(&args, 0, op)?, op)?.chars().count() as i64)
            }
            "$substrCP" => {
                let args = self.args(operand)?;
                let text = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::String(String::new()))),
                    other => to_display_string(other),
                };
                let start = as_f64(arg(&args, 1, op)?, op)?.max(0.0) as usize;
                let count = as_f64(arg(&args, 2, op)?, op)?.max(0.0) as usize;
                Value::String(text.chars().skip(start).take(count).collect())
            }
            "$indexOfCP" => {
                let args = self.args(operand)?;
                let text = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_str(other, op)?,
                };
                let needle: Vec<char> = as_str(arg(&args, 1, op)?, op)?.chars().collect();
                let chars: Vec<char> = text.chars().collect();
                let start = match args.get(2) {
                    Some(v) => as_f64(v, op)?.max(0.0) as usize,
                    None => 0,
                };
                let end = match args.get(3) {
                    Some(v) => (as_f64(v, op)?.max(0.0) as usize).min(chars.len()),
                    None => chars.len(),
                };
                let found = (start..=end.saturating_sub(needle.len()))
                    .filter(|&i| i + needle.len() <= end)
                    .find(|&i| chars[i..i + needle.len()] == needle[..]);
                Value::from(found.map_or(-1, |i| i as i64))
            }
            "$split" => {
                let args = self.args(operand)?;
                let text = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_str(other, op)?,
                };
                let separator = as_str(arg(&args, 1, op)?, op)?;
                if separator.is_empty() {
                    return Err(invalid("$split requires a non-empty separator"));
                }
                Value::Array(
                    text.split(separator)
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                )
            }
            "$replaceAll" => {
                let input = self.field(operand, "input", op)?;
                let find = self.field(operand, "find", op)?;
                let replacement = self.field(operand, "replacement", op)?;
                if input.is_null() || find.is_null() || replacement.is_null() {
                    return Ok(Some(Value::Null));
                }
                Value::String(as_str(&input, op)?.replace(as_str(&find, op)?, as_str(&replacement, op)?))
            }
            "$regexMatch" => {
                let input = self.field(operand, "input", op)?;
                let pattern = self.field(operand, "regex", op)?;
                let options = self.optional_field(operand, "options")?;
                let options = options.as_ref().and_then(Value::as_str).unwrap_or("");
                match input {
                    Value::String(text) => {
                        Value::Bool(regex_match_with_options(&text, as_str(&pattern, op)?, options)?)
                    }
                    _ => Value::Bool(false),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    // ========================================================================
    // ARRAYS
    // ========================================================================

    fn array_op(&self, op: &str, operand: &Value) -> Result<Option<Value>> {
        let value = match op {
            "$size" => {
                let args = self.args(operand)?;
                Value::from(as_array(arg(&args, 0, op)?, op)?.len() as i64)
            }
            "$arrayElemAt" => {
                let args = self.args(operand)?;
                let items = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_array(other, op)?,
                };
                let index = arg(&args, 1, op)?
                    .as_i64()
                    .ok_or_else(|| invalid("$arrayElemAt's second argument must be an integer"))?;
                let position = if index < 0 {
                    items.len() as i64 + index
                } else {
                    index
                };
                usize::try_from(position)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            "$first" | "$last" => {
                let args = self.args(operand)?;
                let items = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_array(other, op)?,
                };
                let item = if op == "$first" {
                    items.first()
                } else {
                    items.last()
                };
                item.cloned().unwrap_or(Value::Null)
            }
            "$slice" => {
                let args = self.args(operand)?;
                let items = match arg(&args, 0, op)? {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_array(other, op)?,
                };
                let len = items.len() as i64;
                let first = as_f64(arg(&args, 1, op)?, op)? as i64;
                let (start, count) = match args.get(2) {
                    Some(n) => {
                        let start = if first < 0 { (len + first).max(0) } else { first.min(len) };
                        (start, as_f64(n, op)?.max(0.0) as i64)
                    }
                    None if first < 0 => ((len + first).max(0), -first),
                    None => (0, first),
                };
                Value::Array(
                    items
                        .iter()
                        .skip(start as usize)
                        .take(count as usize)
                        .cloned()
                        .collect(),
                )
            }
            "$reverseArray" => {
                let args = self.args(operand)?;
                match arg(&args, 0, op)? {
                    Value::Null => Value::Null,
                    other => Value::Array(as_array(other, op)?.iter().rev().cloned().collect()),
                }
            }
            "$concatArrays" => {
                let args = self.args(operand)?;
                if args.iter().any(Value::is_null) {
                    return Ok(Some(Value::Null));
                }
                let mut out = Vec::new();
                for part in &args {
                    out.extend(as_array(part, op)?.iter().cloned());
                }
                Value::Array(out)
            }
            "$setUnion" | "$setIntersection" | "$setDifference" => {
                let args = self.args(operand)?;
                if args.iter().any(Value::is_null) {
                    return Ok(Some(Value::Null));
                }
                let sets = args
                    .iter()
                    .map(|a| as_array(a, op))
                    .collect::<Result<Vec<_>>>()?;
                Value::Array(set_operation(op, &sets))
            }
            "$in" => {
                let args = self.args(operand)?;
                let item = arg(&args, 0, op)?;
                let items = match arg(&args, 1, op)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(invalid(format!(
                            "$in requires an array as a second argument, found: {}",
                            type_name(other)
                        )))
                    }
                };
                Value::Bool(items.iter().any(|e| values_equal(e, item)))
            }
            "$range" => {
                let args = self.args(operand)?;
                let start = as_f64(arg(&args, 0, op)?, op)? as i64;
                let end = as_f64(arg(&args, 1, op)?, op)? as i64;
                let step = match args.get(2) {
                    Some(v) => as_f64(v, op)? as i64,
                    None => 1,
                };
                if step == 0 {
                    return Err(invalid("$range requires a non-zero step value"));
                }
                let mut out = Vec::new();
                let mut current = start;
                while (step > 0 && current < end) || (step < 0 && current > end) {
                    out.push(Value::from(current));
                    current += step;
                }
                Value::Array(out)
            }
            "$filter" | "$map" => {
                let input = self.field(operand, "input", op)?;
                let items = match &input {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_array(other, op)?,
                };
                let name = operand
                    .get("as")
                    .and_then(Value::as_str)
                    .unwrap_or("this")
                    .to_string();
                let body_key = if op == "$filter" { "cond" } else { "in" };
                let body = operand
                    .get(body_key)
                    .ok_or_else(|| invalid(format!("{} requires '{}'", op, body_key)))?;
                let mut out = Vec::new();
                for item in items {
                    let scope = self.scoped([(name.clone(), item.clone())]);
                    let result = scope.evaluate(body)?;
                    if op == "$map" {
                        out.push(result);
                    } else if is_truthy(&result) {
                        out.push(item.clone());
                    }
                }
                Value::Array(out)
            }
            "$reduce" => {
                let input = self.field(operand, "input", op)?;
                let items = match &input {
                    Value::Null => return Ok(Some(Value::Null)),
                    other => as_array(other, op)?,
                };
                let mut acc = self.field(operand, "initialValue", op)?;
                let body = operand
                    .get("in")
                    .ok_or_else(|| invalid("$reduce requires 'in'"))?;
                for item in items {
                    let scope = self.scoped([
                        ("value".to_string(), acc),
                        ("this".to_string(), item.clone()),
                    ]);
                    acc = scope.evaluate(body)?;
                }
                acc
            }
            "$sum" | "$avg" | "$min" | "$max" => {
                let args = self.args(operand)?;
                let values: Vec<Value> = match args.as_slice() {
                    [Value::Array(items)] => items.clone(),
                    _ => args,
                };
                fold_values(op, &values)
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    // ========================================================================
    // DATES
    // ========================================================================

    fn date_op(&self, op: &str, operand: &Value) -> Result<Option<Value>> {
        let value = match op {
            "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second"
            | "$millisecond" | "$dayOfYear" | "$dayOfWeek" => {
                let args = self.args(operand)?;
                let input = arg(&args, 0, op)?;
                if input.is_null() {
                    return Ok(Some(Value::Null));
                }
                let date = date_of(input, op)?;
                let part = match op {
                    "$year" => date.year() as i64,
                    "$month" => date.month() as i64,
                    "$dayOfMonth" => date.day() as i64,
                    "$hour" => date.hour() as i64,
                    "$minute" => date.minute() as i64,
                    "$second" => date.second() as i64,
                    "$millisecond" => date.timestamp_subsec_millis() as i64,
                    "$dayOfYear" => date.ordinal() as i64,
                    _ => date.weekday().number_from_sunday() as i64,
                };
                Value::from(part)
            }
            "$dateFromParts" => {
                let part = |name: &str, default: i64| -> Result<i64> {
                    match self.optional_field(operand, name)? {
                        None | Some(Value::Null) => Ok(default),
                        Some(v) => Ok(as_f64(&v, op)? as i64),
                    }
                };
                let year = i32::try_from(part("year", 1970)?)
                    .map_err(|_| invalid("year out of range"))?;
                let start = NaiveDate::from_ymd_opt(year, 1, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| Utc.from_utc_datetime(&d))
                    .ok_or_else(|| invalid("invalid date parts"))?;
                // months and days beyond their range carry over
                let base = add_months(codec::date_to_value(&start), part("month", 1)? - 1)?;
                let offset = (part("day", 1)? - 1) * codec::MILLIS_PER_DAY
                    + part("hour", 0)? * 3_600_000
                    + part("minute", 0)? * 60_000
                    + part("second", 0)? * 1000
                    + part("millisecond", 0)?;
                let base_millis =
                    codec::date_millis(&base).unwrap_or_else(|| start.timestamp_millis());
                codec::millis_to_value(base_millis + offset)
            }
            "$dateAdd" => {
                let start = self.field(operand, "startDate", op)?;
                let unit = self.field(operand, "unit", op)?;
                let amount = self.field(operand, "amount", op)?;
                if start.is_null() || unit.is_null() || amount.is_null() {
                    return Ok(Some(Value::Null));
                }
                let amount = amount
                    .as_i64()
                    .or_else(|| amount.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(|| invalid("$dateAdd requires an integral 'amount'"))?;
                let date = date_of(&start, op)?;
                let step = |ms: i64| codec::millis_to_value(date.timestamp_millis() + amount * ms);
                match as_str(&unit, op)? {
                    "year" => add_months(start, amount * 12)?,
                    "quarter" => add_months(start, amount * 3)?,
                    "month" => add_months(start, amount)?,
                    "week" => step(7 * codec::MILLIS_PER_DAY),
                    "day" => step(codec::MILLIS_PER_DAY),
                    "hour" => step(3_600_000),
                    "minute" => step(60_000),
                    "second" => step(1000),
                    "millisecond" => step(1),
                    other => return Err(invalid(format!("unknown time unit value: {}", other))),
                }
            }
            "$toDate" => {
                let args = self.args(operand)?;
                match arg(&args, 0, op)? {
                    Value::Null => Value::Null,
                    v if codec::is_date(v) => v.clone(),
                    v if codec::oid_hex(v).is_some() => match codec::ObjectId::from_value(v) {
                        Some(oid) => codec::date_to_value(&oid.creation_time()),
                        None => return Err(invalid("invalid object id")),
                    },
                    Value::Number(n) => codec::millis_to_value(
                        n.as_i64()
                            .or_else(|| n.as_f64().map(|f| f as i64))
                            .unwrap_or_default(),
                    ),
                    Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                        Ok(dt) => codec::millis_to_value(dt.timestamp_millis()),
                        Err(e) => return Err(invalid(format!("Error parsing date string '{}': {}", s, e))),
                    },
                    other => {
                        return Err(invalid(format!(
                            "Unsupported conversion from {} to date in $convert",
                            type_name(other)
                        )))
                    }
                }
            }
            "$toLong" => {
                let args = self.args(operand)?;
                match arg(&args, 0, op)? {
                    Value::Null => Value::Null,
                    v if codec::is_date(v) => Value::from(codec::date_millis(v).unwrap_or_default()),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => Value::from(i),
                        None => Value::from(n.as_f64().map_or(0, |f| f.trunc() as i64)),
                    },
                    Value::Bool(b) => Value::from(*b as i64),
                    Value::String(s) => Value::from(
                        s.trim()
                            .parse::<i64>()
                            .map_err(|_| invalid(format!("Failed to parse number '{}' in $convert", s)))?,
                    ),
                    other => {
                        return Err(invalid(format!(
                            "Unsupported conversion from {} to long in $convert",
                            type_name(other)
                        )))
                    }
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    // ========================================================================
    // MATH
    // ========================================================================

    fn math_op(&self, op: &str, operand: &Value) -> Result<Option<Value>> {
        let unary: Option<fn(f64) -> f64> = match op {
            "$sqrt" => Some(f64::sqrt),
            "$exp" => Some(f64::exp),
            "$ln" => Some(f64::ln),
            "$log10" => Some(f64::log10),
            "$sin" => Some(f64::sin),
            "$cos" => Some(f64::cos),
            "$tan" => Some(f64::tan),
            "$asin" => Some(f64::asin),
            "$acos" => Some(f64::acos),
            "$atan" => Some(f64::atan),
            _ => None,
        };
        let known = unary.is_some()
            || matches!(
                op,
                "$abs" | "$ceil" | "$floor" | "$round" | "$trunc" | "$log" | "$atan2"
            );
        if !known {
            return Ok(None);
        }

        let args = self.args(operand)?;
        let x = arg(&args, 0, op)?;
        if x.is_null() {
            return Ok(Some(Value::Null));
        }
        if let Some(f) = unary {
            return Ok(Some(float(f(as_f64(x, op)?))));
        }
        let value = match op {
            "$abs" => match x.as_i64() {
                Some(i) => Value::from(i.checked_abs().ok_or_else(|| invalid("$abs overflow"))?),
                None => float(as_f64(x, op)?.abs()),
            },
            "$ceil" | "$floor" if x.as_i64().is_some() => x.clone(),
            "$ceil" => whole_or_float(as_f64(x, op)?.ceil()),
            "$floor" => whole_or_float(as_f64(x, op)?.floor()),
            "$round" | "$trunc" => {
                let digits = match args.get(1) {
                    Some(d) => as_f64(d, op)? as i32,
                    None => 0,
                };
                if x.as_i64().is_some() && digits >= 0 {
                    return Ok(Some(x.clone()));
                }
                let f = as_f64(x, op)?;
                let result = if op == "$round" {
                    round_half_even(f, digits)
                } else {
                    let scale = 10f64.powi(digits);
                    (f * scale).trunc() / scale
                };
                if digits <= 0 {
                    whole_or_float(result)
                } else {
                    float(result)
                }
            }
            "$log" => {
                let base = as_f64(arg(&args, 1, op)?, op)?;
                float(as_f64(x, op)?.log(base))
            }
            _ => {
                let other = as_f64(arg(&args, 1, op)?, op)?;
                float(as_f64(x, op)?.atan2(other))
            }
        };
        Ok(Some(value))
    }
}

fn add(args: &[Value]) -> Result<Value> {
    let mut date: Option<i64> = None;
    let mut int_sum: Option<i64> = Some(0);
    let mut float_sum = 0.0;
    for value in args {
        if let Some(millis) = codec::date_millis(value) {
            if date.replace(millis).is_some() {
                return Err(invalid("only one date allowed in an $add expression"));
            }
            continue;
        }
        let f = as_f64(value, "$add")?;
        float_sum += f;
        int_sum = match (int_sum, value.as_i64()) {
            (Some(acc), Some(i)) => acc.checked_add(i),
            _ => None,
        };
    }
    Ok(match (date, int_sum) {
        (Some(millis), _) => codec::millis_to_value(millis + float_sum.round() as i64),
        (None, Some(i)) => Value::from(i),
        (None, None) => float(float_sum),
    })
}

fn subtract(a: &Value, b: &Value) -> Result<Value> {
    match (codec::date_millis(a), codec::date_millis(b)) {
        (Some(x), Some(y)) => Ok(Value::from(x - y)),
        (Some(x), None) => Ok(codec::millis_to_value(
            x - as_f64(b, "$subtract")?.round() as i64,
        )),
        (None, Some(_)) => Err(invalid("can't $subtract a date from a number")),
        (None, None) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Ok(x
                .checked_sub(y)
                .map_or_else(|| float(x as f64 - y as f64), Value::from)),
            _ => Ok(float(as_f64(a, "$subtract")? - as_f64(b, "$subtract")?)),
        },
    }
}

/// Calendar-aware month arithmetic that clamps the day to the end of the target month
fn add_months(start: Value, months: i64) -> Result<Value> {
    let date = date_of(&start, "$dateAdd")?;
    let shifted = if months >= 0 {
        u32::try_from(months)
            .ok()
            .and_then(|m| date.checked_add_months(Months::new(m)))
    } else {
        u32::try_from(-months)
            .ok()
            .and_then(|m| date.checked_sub_months(Months::new(m)))
    };
    shifted
        .map(|d| codec::date_to_value(&d))
        .ok_or_else(|| invalid("date overflow in $dateAdd"))
}

fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        v if codec::is_date(v) => codec::value_to_date(v)
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_default(),
        v if codec::oid_hex(v).is_some() => codec::oid_hex(v).unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

fn set_operation(op: &str, sets: &[&Vec<Value>]) -> Vec<Value> {
    let mut seen = AHashSet::new();
    let mut out = Vec::new();
    let key_sets: Vec<AHashSet<String>> = sets
        .iter()
        .map(|s| s.iter().map(canonical_json_string).collect())
        .collect();
    let candidates: Box<dyn Iterator<Item = &Value>> = match op {
        "$setUnion" => Box::new(sets.iter().flat_map(|s| s.iter())),
        _ => Box::new(sets.first().into_iter().flat_map(|s| s.iter())),
    };
    for item in candidates {
        let key = canonical_json_string(item);
        let keep = match op {
            "$setIntersection" => key_sets[1..].iter().all(|s| s.contains(&key)),
            "$setDifference" => !key_sets.get(1).map_or(false, |s| s.contains(&key)),
            _ => true,
        };
        if keep && seen.insert(key) {
            out.push(item.clone());
        }
    }
    out
}

/// `$sum`/`$avg`/`$min`/`$max` over a list of values; shared with the group stage
pub(crate) fn fold_values(op: &str, values: &[Value]) -> Value {
    match op {
        "$sum" | "$avg" => {
            let numbers: Vec<&Value> = values.iter().filter(|v| v.is_number()).collect();
            if op == "$avg" {
                if numbers.is_empty() {
                    return Value::Null;
                }
                let total: f64 = numbers.iter().filter_map(|v| v.as_f64()).sum();
                return float(total / numbers.len() as f64);
            }
            let ints = numbers
                .iter()
                .try_fold(0i64, |acc, v| v.as_i64().and_then(|i| acc.checked_add(i)));
            match ints {
                Some(total) => Value::from(total),
                None => float(numbers.iter().filter_map(|v| v.as_f64()).sum()),
            }
        }
        _ => {
            let mut best: Option<&Value> = None;
            for value in values.iter().filter(|v| !v.is_null()) {
                best = match best {
                    None => Some(value),
                    Some(current) => {
                        let ord = compare_bson(value, current);
                        let better = if op == "$min" {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        };
                        Some(if better { value } else { current })
                    }
                };
            }
            best.cloned().unwrap_or(Value::Null)
        }
    }
}
