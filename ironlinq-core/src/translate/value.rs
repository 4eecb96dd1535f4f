// ironlinq-core/src/translate/value.rs
// Lambda bodies → aggregation expressions

use super::{escape_regex, Translator};
use crate::codec;
use crate::error::{LinqError, Result};
use crate::expr::{BinaryOp, Declaring, Expr, ExprType, RegexOptions, UnaryOp};
use serde_json::{json, Map, Value};

/// Milliseconds per unit of the `AddXxx` date helpers
const DATE_ADD_MILLIS: &[(&str, f64)] = &[
    ("AddDays", 86_400_000.0),
    ("AddHours", 3_600_000.0),
    ("AddMinutes", 60_000.0),
    ("AddSeconds", 1_000.0),
    ("AddMilliseconds", 1.0),
];

/// Date parts with a direct operator
const DATE_PARTS: &[(&str, &str)] = &[
    ("Year", "$year"),
    ("Month", "$month"),
    ("Day", "$dayOfMonth"),
    ("Hour", "$hour"),
    ("Minute", "$minute"),
    ("Second", "$second"),
    ("Millisecond", "$millisecond"),
    ("DayOfYear", "$dayOfYear"),
];

/// Seconds per unit of the `TotalXxx` duration members
const DURATION_TOTALS: &[(&str, f64)] = &[
    ("TotalDays", 86_400.0),
    ("TotalHours", 3_600.0),
    ("TotalMinutes", 60.0),
    ("TotalSeconds", 1.0),
];

/// Single-argument math functions
const MATH_UNARY: &[(&str, &str)] = &[
    ("Abs", "$abs"),
    ("Ceiling", "$ceil"),
    ("Floor", "$floor"),
    ("Sqrt", "$sqrt"),
    ("Exp", "$exp"),
    ("Log10", "$log10"),
    ("Sin", "$sin"),
    ("Cos", "$cos"),
    ("Tan", "$tan"),
    ("Asin", "$asin"),
    ("Acos", "$acos"),
    ("Atan", "$atan"),
];

/// `{ name: args }`
pub(crate) fn op(name: &str, args: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(name.to_string(), args);
    Value::Object(doc)
}

fn lookup<T: Copy>(table: &[(&str, T)], key: &str) -> Option<T> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Operator name for a binary node
fn binary_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "$add",
        BinaryOp::Subtract => "$subtract",
        BinaryOp::Multiply => "$multiply",
        BinaryOp::Divide => "$divide",
        BinaryOp::Modulo => "$mod",
        BinaryOp::Power => "$pow",
        BinaryOp::Equal => "$eq",
        BinaryOp::NotEqual => "$ne",
        BinaryOp::GreaterThan => "$gt",
        BinaryOp::GreaterThanOrEqual => "$gte",
        BinaryOp::LessThan => "$lt",
        BinaryOp::LessThanOrEqual => "$lte",
        BinaryOp::AndAlso | BinaryOp::And => "$and",
        BinaryOp::OrElse | BinaryOp::Or => "$or",
    }
}

pub(crate) fn comparison_operator(op: BinaryOp) -> &'static str {
    binary_operator(op)
}

/// A constant inside an aggregation expression
pub(crate) fn literal(value: &Value) -> Value {
    match value {
        Value::String(s) if s.starts_with('$') => op("$literal", value.clone()),
        Value::Object(_) if codec::is_date(value) || codec::oid_hex(value).is_some() => {
            value.clone()
        }
        Value::Object(_) => op("$literal", value.clone()),
        Value::Array(items) if items.iter().any(|v| literal(v) != *v) => {
            op("$literal", value.clone())
        }
        other => other.clone(),
    }
}

/// A constant at the root of a projection field, where a bare number or bool would be
/// read as an inclusion flag
fn lifted_literal(value: &Value) -> Value {
    match value {
        Value::Number(_) => json!({ "$add": [value] }),
        Value::String(s) if !s.starts_with('$') => json!({ "$concat": [value] }),
        Value::Bool(_) => json!({ "$or": [value, false] }),
        other => op("$literal", other.clone()),
    }
}

fn constant_string(expr: &Expr) -> Option<&str> {
    expr.as_constant().and_then(Value::as_str)
}

fn zero_of(ty: &ExprType) -> Value {
    match ty.underlying() {
        ExprType::Bool => json!(false),
        ExprType::String => json!(""),
        t if t.is_numeric() || t.is_duration() => json!(0),
        _ => Value::Null,
    }
}

impl Translator {
    /// Translate an expression into an aggregation expression
    pub(crate) fn translate_value(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Constant { value, .. } => Ok(literal(value)),
            Expr::Parameter { .. } => Ok(Value::String(self.resolve_field(expr)?.to_expression())),
            Expr::Member { target, member, .. } => {
                if self.is_field_chain(expr) {
                    return Ok(Value::String(self.resolve_field(expr)?.to_expression()));
                }
                self.translate_member(target, &member.name)
            }
            Expr::Unary { op: UnaryOp::Not, operand, .. } => {
                Ok(json!({ "$not": [self.translate_value(operand)?] }))
            }
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
                ..
            } => Ok(json!({ "$multiply": [-1, self.translate_value(operand)?] })),
            Expr::Binary {
                op: bin,
                left,
                right,
                ty,
            } => self.translate_binary(*bin, left, right, ty),
            Expr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => Ok(json!({ "$cond": [
                self.translate_value(test)?,
                self.translate_value(if_true)?,
                self.translate_value(if_false)?,
            ] })),
            Expr::Call { .. } => self.translate_call(expr),
            Expr::Convert { operand, ty } => self.translate_convert(operand, ty),
            Expr::Coalesce { left, right, .. } => Ok(json!({ "$ifNull": [
                self.translate_value(left)?,
                self.translate_value(right)?,
            ] })),
            Expr::ArrayLength { operand } => {
                Ok(json!({ "$size": self.translate_value(operand)? }))
            }
            Expr::New { fields, .. } => {
                let mut doc = Map::new();
                for field in fields {
                    let value = self.project_value(&field.value)?;
                    doc.insert(field.member.field_name().to_string(), value);
                }
                Ok(Value::Object(doc))
            }
            Expr::Collection { .. } | Expr::Lambda { .. } => Err(LinqError::unsupported(
                format!("{} in a value position: {}", expr.kind_name(), expr),
            )),
        }
    }

    /// Value of a projected field; constants are lifted into no-op expressions
    pub(crate) fn project_value(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Constant { value, .. } => Ok(lifted_literal(value)),
            other => self.translate_value(other),
        }
    }

    fn translate_member(&mut self, target: &Expr, name: &str) -> Result<Value> {
        let target_ty = target.ty();
        let value = self.translate_value(target)?;

        if target_ty.is_string() && name == "Length" {
            return Ok(json!({ "$strLenCP": value }));
        }
        if target_ty.is_date() {
            if let Some(operator) = lookup(DATE_PARTS, name) {
                return Ok(op(operator, value));
            }
            return match name {
                // Sunday = 0
                "DayOfWeek" => Ok(json!({ "$subtract": [{ "$dayOfWeek": value }, 1] })),
                "Date" => Ok(json!({ "$dateFromParts": {
                    "year": { "$year": value },
                    "month": { "$month": value },
                    "day": { "$dayOfMonth": value },
                } })),
                "TimeOfDay" => Ok(json!({ "$divide": [
                    { "$mod": [{ "$toLong": value }, codec::MILLIS_PER_DAY] },
                    codec::MILLIS_PER_DURATION_UNIT,
                ] })),
                other => Err(LinqError::unsupported(format!("DateTime member {}", other))),
            };
        }
        if target_ty.is_duration() {
            if let Some(seconds) = lookup(DURATION_TOTALS, name) {
                return Ok(if seconds == 1.0 {
                    value
                } else {
                    json!({ "$divide": [value, seconds] })
                });
            }
            if name == "TotalMilliseconds" {
                return Ok(json!({ "$multiply": [value, codec::MILLIS_PER_DURATION_UNIT] }));
            }
            let whole = |divisor: f64| json!({ "$trunc": { "$divide": [value.clone(), divisor] } });
            return match name {
                "Days" => Ok(whole(86_400.0)),
                "Hours" => Ok(json!({ "$mod": [whole(3_600.0), 24] })),
                "Minutes" => Ok(json!({ "$mod": [whole(60.0), 60] })),
                "Seconds" => Ok(json!({ "$mod": [{ "$trunc": value.clone() }, 60] })),
                "Milliseconds" => Ok(json!({ "$mod": [
                    { "$trunc": { "$multiply": [value.clone(), codec::MILLIS_PER_DURATION_UNIT] } },
                    1000,
                ] })),
                other => Err(LinqError::unsupported(format!("TimeSpan member {}", other))),
            };
        }
        if target_ty.is_object_id() && name == "CreationTime" {
            return Ok(json!({ "$toDate": value }));
        }
        if target_ty.is_nullable() {
            match name {
                "Value" => return Ok(value),
                "HasValue" => return Ok(json!({ "$ne": [value, null] })),
                _ => {}
            }
        }
        if target_ty.is_array() && (name == "Count" || name == "Length") {
            return Ok(json!({ "$size": value }));
        }
        if target_ty.is_document() {
            // member of a computed document
            let var = self.pipeline.temp_name("v");
            return Ok(json!({ "$let": {
                "vars": op(&var, value),
                "in": format!("$${}.{}", var, name),
            } }));
        }
        Err(LinqError::unsupported(format!(
            "member {} of {}",
            name, target_ty
        )))
    }

    fn translate_binary(
        &mut self,
        bin: BinaryOp,
        left: &Expr,
        right: &Expr,
        ty: &ExprType,
    ) -> Result<Value> {
        let (lt, rt) = (left.ty(), right.ty());

        if bin == BinaryOp::Add && (ty.is_string() || lt.is_string() || rt.is_string()) {
            let mut parts = Vec::new();
            self.concat_parts(left, &mut parts)?;
            self.concat_parts(right, &mut parts)?;
            return Ok(json!({ "$concat": parts }));
        }

        if bin.is_logical() {
            let mut operands = Vec::new();
            self.flatten_logical(bin, left, &mut operands)?;
            self.flatten_logical(bin, right, &mut operands)?;
            return Ok(op(binary_operator(bin), Value::Array(operands)));
        }

        let l = self.translate_value(left)?;
        let r = self.translate_value(right)?;
        let to_millis = |v: Value| json!({ "$multiply": [v, codec::MILLIS_PER_DURATION_UNIT] });

        match bin {
            BinaryOp::Add | BinaryOp::Subtract if lt.is_date() && rt.is_duration() => {
                Ok(op(binary_operator(bin), json!([l, to_millis(r)])))
            }
            BinaryOp::Add if lt.is_duration() && rt.is_date() => {
                Ok(json!({ "$add": [to_millis(l), r] }))
            }
            BinaryOp::Subtract if lt.is_date() && rt.is_date() => Ok(json!({ "$divide": [
                { "$subtract": [l, r] },
                codec::MILLIS_PER_DURATION_UNIT,
            ] })),
            BinaryOp::Divide if lt.is_integral() && rt.is_integral() => {
                Ok(json!({ "$trunc": { "$divide": [l, r] } }))
            }
            other => Ok(op(binary_operator(other), json!([l, r]))),
        }
    }

    fn flatten_logical(&mut self, bin: BinaryOp, expr: &Expr, out: &mut Vec<Value>) -> Result<()> {
        match expr {
            Expr::Binary {
                op: inner,
                left,
                right,
                ..
            } if binary_operator(*inner) == binary_operator(bin) => {
                self.flatten_logical(bin, left, out)?;
                self.flatten_logical(bin, right, out)
            }
            other => {
                out.push(self.translate_value(other)?);
                Ok(())
            }
        }
    }

    fn concat_parts(&mut self, expr: &Expr, parts: &mut Vec<Value>) -> Result<()> {
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                left,
                right,
                ty,
            } if ty.is_string() => {
                self.concat_parts(left, parts)?;
                self.concat_parts(right, parts)
            }
            other => {
                let part = self.concat_operand(other)?;
                parts.push(part);
                Ok(())
            }
        }
    }

    /// Concatenation operand: null becomes "", non-strings are stringified
    fn concat_operand(&mut self, expr: &Expr) -> Result<Value> {
        if let Some(s) = constant_string(expr) {
            return Ok(literal(&Value::String(s.to_string())));
        }
        if let Some(Value::Null) = expr.as_constant() {
            return Ok(json!(""));
        }
        let value = self.translate_value(expr)?;
        Ok(if expr.ty().is_string() {
            json!({ "$ifNull": [value, ""] })
        } else {
            json!({ "$ifNull": [{ "$toString": value }, ""] })
        })
    }

    fn translate_convert(&mut self, operand: &Expr, ty: &ExprType) -> Result<Value> {
        let from = operand.ty();
        let value = self.translate_value(operand)?;
        if ty.is_integral() && from.is_numeric() && !from.is_integral() {
            return Ok(json!({ "$trunc": value }));
        }
        if ty.is_string() && !from.is_string() {
            return Ok(json!({ "$toString": value }));
        }
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    fn translate_call(&mut self, expr: &Expr) -> Result<Value> {
        if Self::is_grouping_aggregate(expr) {
            let field = self.grouping_aggregate(expr)?;
            return Ok(Value::String(format!("${}", field)));
        }
        let (declaring, method, object, args) = match expr {
            Expr::Call {
                declaring,
                method,
                object,
                args,
                ..
            } => (*declaring, method.as_str(), object.as_deref(), args.as_slice()),
            other => return Err(LinqError::contract(format!("call on {}", other.kind_name()))),
        };
        match declaring {
            Declaring::Queryable => Err(LinqError::unsupported(format!(
                "query operator {} inside a lambda",
                method
            ))),
            Declaring::Enumerable => self.sequence_call(method, args),
            Declaring::String => self.string_static_call(method, args),
            Declaring::Math => self.math_call(method, args),
            Declaring::Regex => self.regex_call(method, args),
            Declaring::Instance => {
                let object = object.ok_or_else(|| {
                    LinqError::contract(format!("instance method {} without receiver", method))
                })?;
                self.instance_call(object, method, args)
            }
        }
    }

    fn arg(args: &[Expr], index: usize, method: &str) -> Result<Expr> {
        args.get(index).cloned().ok_or_else(|| {
            LinqError::contract(format!("{} expects argument {}", method, index + 1))
        })
    }

    fn sequence_call(&mut self, method: &str, args: &[Expr]) -> Result<Value> {
        match method {
            "Range" => {
                let start = self.translate_value(&Self::arg(args, 0, method)?)?;
                let count = self.translate_value(&Self::arg(args, 1, method)?)?;
                return Ok(json!({ "$range": [start.clone(), { "$add": [start, count] }] }));
            }
            "Repeat" => {
                let element = self.translate_value(&Self::arg(args, 0, method)?)?;
                let count = self.translate_value(&Self::arg(args, 1, method)?)?;
                let var = self.pipeline.temp_name("v");
                return Ok(json!({ "$map": {
                    "input": { "$range": [0, count] },
                    "as": var,
                    "in": element,
                } }));
            }
            _ => {}
        }

        let source_expr = Self::arg(args, 0, method)?;
        let source = self.translate_value(&source_expr)?;
        let safe_source = json!({ "$ifNull": [source.clone(), []] });
        let lambda = args.get(1).filter(|a| a.as_lambda().is_some());

        match (method, lambda) {
            ("Where", Some(predicate)) => self.filter_array(source, predicate),
            ("Select", Some(selector)) => self.map_array(source, selector),
            ("Any", None) => Ok(json!({ "$gt": [{ "$size": safe_source }, 0] })),
            ("Any", Some(predicate)) => {
                let matching = self.filter_array(safe_source, predicate)?;
                Ok(json!({ "$gt": [{ "$size": matching }, 0] }))
            }
            ("All", Some(predicate)) => {
                let matching = self.filter_array(safe_source.clone(), predicate)?;
                Ok(json!({ "$eq": [{ "$size": matching }, { "$size": safe_source }] }))
            }
            ("Count" | "LongCount", None) => Ok(json!({ "$size": source })),
            ("Count" | "LongCount", Some(predicate)) => {
                Ok(json!({ "$size": self.filter_array(source, predicate)? }))
            }
            ("Contains", None) => {
                let item = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$in": [item, source] }))
            }
            ("First" | "FirstOrDefault", None) => Ok(json!({ "$arrayElemAt": [source, 0] })),
            ("First" | "FirstOrDefault", Some(predicate)) => {
                Ok(json!({ "$arrayElemAt": [self.filter_array(source, predicate)?, 0] }))
            }
            ("Last" | "LastOrDefault", None) => Ok(json!({ "$arrayElemAt": [source, -1] })),
            ("Last" | "LastOrDefault", Some(predicate)) => {
                Ok(json!({ "$arrayElemAt": [self.filter_array(source, predicate)?, -1] }))
            }
            ("ElementAt" | "ElementAtOrDefault", None) => {
                let index = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$arrayElemAt": [source, index] }))
            }
            ("Take", None) => {
                let count = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$slice": [source, { "$max": [count, 0] }] }))
            }
            ("Skip", None) => {
                let count = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$slice": [
                    source.clone(),
                    count,
                    { "$max": [{ "$size": source }, 1] },
                ] }))
            }
            ("Reverse", None) => Ok(json!({ "$reverseArray": source })),
            ("Distinct", None) => Ok(json!({ "$setUnion": [source, []] })),
            ("Union" | "Intersect" | "Except" | "Concat", None) => {
                let other = self.translate_value(&Self::arg(args, 1, method)?)?;
                let operator = match method {
                    "Union" => "$setUnion",
                    "Intersect" => "$setIntersection",
                    "Except" => "$setDifference",
                    _ => "$concatArrays",
                };
                Ok(op(operator, json!([source, other])))
            }
            ("Sum" | "Average" | "Min" | "Max", selector) => {
                let operator = match method {
                    "Sum" => "$sum",
                    "Average" => "$avg",
                    "Min" => "$min",
                    _ => "$max",
                };
                let input = match selector {
                    Some(selector) => self.map_array(source, selector)?,
                    None => source,
                };
                Ok(op(operator, input))
            }
            ("ToList" | "ToArray" | "AsEnumerable" | "AsQueryable", None) => Ok(source),
            _ => Err(LinqError::unsupported(format!(
                "method Enumerable.{} with {} arguments",
                method,
                args.len()
            ))),
        }
    }

    fn filter_array(&mut self, input: Value, predicate: &Expr) -> Result<Value> {
        self.with_lambda_var(predicate, |t, var, body| {
            let cond = t.translate_value(body)?;
            Ok(json!({ "$filter": { "input": input, "as": var, "cond": cond } }))
        })
    }

    fn map_array(&mut self, input: Value, selector: &Expr) -> Result<Value> {
        self.with_lambda_var(selector, |t, var, body| {
            let mapped = t.translate_value(body)?;
            Ok(json!({ "$map": { "input": input, "as": var, "in": mapped } }))
        })
    }

    fn string_static_call(&mut self, method: &str, args: &[Expr]) -> Result<Value> {
        match method {
            "IsNullOrEmpty" => {
                let s = self.translate_value(&Self::arg(args, 0, method)?)?;
                Ok(json!({ "$or": [
                    { "$eq": [{ "$ifNull": [s.clone(), null] }, null] },
                    { "$eq": [s, ""] },
                ] }))
            }
            "IsNullOrWhiteSpace" => {
                let s = self.translate_value(&Self::arg(args, 0, method)?)?;
                Ok(json!({ "$or": [
                    { "$eq": [{ "$ifNull": [s.clone(), null] }, null] },
                    { "$eq": [{ "$trim": { "input": s } }, ""] },
                ] }))
            }
            "Concat" => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(self.concat_operand(arg)?);
                }
                Ok(json!({ "$concat": parts }))
            }
            "Compare" => {
                let a = self.translate_value(&Self::arg(args, 0, method)?)?;
                let b = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$cmp": [a, b] }))
            }
            "Equals" => {
                let a = self.translate_value(&Self::arg(args, 0, method)?)?;
                let b = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$eq": [a, b] }))
            }
            "Join" => {
                let separator = self.translate_value(&Self::arg(args, 0, method)?)?;
                let items = self.translate_value(&Self::arg(args, 1, method)?)?;
                let var = self.pipeline.temp_name("v");
                // leading separator is cut off after the reduce
                let joined = json!({ "$reduce": {
                    "input": items,
                    "initialValue": "",
                    "in": { "$concat": ["$$value", separator.clone(), { "$toString": "$$this" }] },
                } });
                Ok(json!({ "$let": {
                    "vars": op(&var, joined),
                    "in": { "$substrCP": [
                        format!("$${}", var),
                        { "$strLenCP": separator },
                        { "$strLenCP": format!("$${}", var) },
                    ] },
                } }))
            }
            other => Err(LinqError::unsupported(format!("method String.{}", other))),
        }
    }

    fn math_call(&mut self, method: &str, args: &[Expr]) -> Result<Value> {
        let x = self.translate_value(&Self::arg(args, 0, method)?)?;
        if let Some(operator) = lookup(MATH_UNARY, method) {
            return Ok(op(operator, x));
        }
        let second = match args.get(1) {
            Some(arg) => Some(self.translate_value(arg)?),
            None => None,
        };
        match (method, second) {
            ("Log", None) => Ok(json!({ "$ln": x })),
            ("Log", Some(base)) => Ok(json!({ "$log": [x, base] })),
            ("Pow", Some(y)) => Ok(json!({ "$pow": [x, y] })),
            ("Atan2", Some(other)) => Ok(json!({ "$atan2": [x, other] })),
            ("Round", None) => Ok(json!({ "$round": [x, 0] })),
            ("Round", Some(digits)) => Ok(json!({ "$round": [x, digits] })),
            ("Truncate", None) => Ok(json!({ "$trunc": x })),
            ("Min", Some(y)) => Ok(json!({ "$min": [x, y] })),
            ("Max", Some(y)) => Ok(json!({ "$max": [x, y] })),
            ("Sign", None) => Ok(json!({ "$cond": [
                { "$gt": [x.clone(), 0] },
                1,
                { "$cond": [{ "$lt": [x, 0] }, -1, 0] },
            ] })),
            (other, _) => Err(LinqError::unsupported(format!(
                "method Math.{} with {} arguments",
                other,
                args.len()
            ))),
        }
    }

    fn regex_call(&mut self, method: &str, args: &[Expr]) -> Result<Value> {
        if method != "IsMatch" {
            return Err(LinqError::unsupported(format!("method Regex.{}", method)));
        }
        let input = self.translate_value(&Self::arg(args, 0, method)?)?;
        let pattern = self.translate_value(&Self::arg(args, 1, method)?)?;
        let mut body = Map::new();
        body.insert("input".to_string(), input);
        body.insert("regex".to_string(), pattern);
        if let Some(options) = args.get(2) {
            let letters = regex_option_letters(options)?;
            if !letters.is_empty() {
                body.insert("options".to_string(), Value::String(letters));
            }
        }
        Ok(op("$regexMatch", Value::Object(body)))
    }

    fn instance_call(&mut self, object: &Expr, method: &str, args: &[Expr]) -> Result<Value> {
        let object_ty = object.ty();

        if object_ty.is_array() && method == "Contains" {
            let source = self.translate_value(object)?;
            let item = self.translate_value(&Self::arg(args, 0, method)?)?;
            return Ok(json!({ "$in": [item, source] }));
        }
        if object_ty.is_date() {
            return self.date_call(object, method, args);
        }

        let value = self.translate_value(object)?;
        match method {
            "Equals" => {
                let other = self.translate_value(&Self::arg(args, 0, method)?)?;
                return Ok(json!({ "$eq": [value, other] }));
            }
            "CompareTo" => {
                let other = self.translate_value(&Self::arg(args, 0, method)?)?;
                return Ok(json!({ "$cmp": [value, other] }));
            }
            "ToString" => {
                return Ok(if object_ty.is_string() {
                    value
                } else {
                    json!({ "$toString": value })
                });
            }
            "GetValueOrDefault" => {
                let fallback = match args.first() {
                    Some(arg) => self.translate_value(arg)?,
                    None => zero_of(&object_ty),
                };
                return Ok(json!({ "$ifNull": [value, fallback] }));
            }
            _ => {}
        }

        if object_ty.is_duration() {
            let other = args.first().map(|a| self.translate_value(a)).transpose()?;
            return match (method, other) {
                ("Add", Some(other)) => Ok(json!({ "$add": [value, other] })),
                ("Subtract", Some(other)) => Ok(json!({ "$subtract": [value, other] })),
                ("Negate", None) => Ok(json!({ "$multiply": [-1, value] })),
                ("Duration", None) => Ok(json!({ "$abs": value })),
                (other, _) => Err(LinqError::unsupported(format!("method TimeSpan.{}", other))),
            };
        }
        if object_ty.is_string() {
            return self.string_call(value, method, args);
        }
        Err(LinqError::unsupported(format!(
            "method {}.{}",
            object_ty, method
        )))
    }

    fn string_call(&mut self, s: Value, method: &str, args: &[Expr]) -> Result<Value> {
        match method {
            "ToUpper" | "ToUpperInvariant" => Ok(json!({ "$toUpper": s })),
            "ToLower" | "ToLowerInvariant" => Ok(json!({ "$toLower": s })),
            "Trim" | "TrimStart" | "TrimEnd" => {
                let operator = match method {
                    "Trim" => "$trim",
                    "TrimStart" => "$ltrim",
                    _ => "$rtrim",
                };
                let mut body = Map::new();
                body.insert("input".to_string(), s);
                if !args.is_empty() {
                    body.insert("chars".to_string(), Value::String(trim_chars(args)?));
                }
                Ok(op(operator, Value::Object(body)))
            }
            "Replace" => {
                let find = self.translate_value(&Self::arg(args, 0, method)?)?;
                let replacement = self.translate_value(&Self::arg(args, 1, method)?)?;
                Ok(json!({ "$replaceAll": {
                    "input": s,
                    "find": find,
                    "replacement": replacement,
                } }))
            }
            "Split" => {
                let separator = match args {
                    [single] => single,
                    _ => {
                        return Err(LinqError::unsupported(
                            "String.Split with more than one separator or options",
                        ))
                    }
                };
                let separator = match separator.as_constant() {
                    Some(Value::Array(items)) if items.len() == 1 => literal(&items[0]),
                    Some(Value::Array(_)) => {
                        return Err(LinqError::unsupported(
                            "String.Split with more than one separator or options",
                        ))
                    }
                    _ => self.translate_value(separator)?,
                };
                Ok(json!({ "$split": [s, separator] }))
            }
            "Substring" => {
                let start = self.translate_value(&Self::arg(args, 0, method)?)?;
                let length = match args.get(1) {
                    Some(length) => self.translate_value(length)?,
                    None => json!({ "$subtract": [{ "$strLenCP": s.clone() }, start.clone()] }),
                };
                Ok(json!({ "$substrCP": [s, start, length] }))
            }
            "IndexOf" => {
                let needle = self.translate_value(&Self::arg(args, 0, method)?)?;
                match args.get(1) {
                    Some(start) => {
                        let start = self.translate_value(start)?;
                        Ok(json!({ "$indexOfCP": [s, needle, start] }))
                    }
                    None => Ok(json!({ "$indexOfCP": [s, needle] })),
                }
            }
            "Contains" => {
                let needle = self.translate_value(&Self::arg(args, 0, method)?)?;
                Ok(json!({ "$ne": [{ "$indexOfCP": [s, needle] }, -1] }))
            }
            "StartsWith" => {
                let prefix = self.translate_value(&Self::arg(args, 0, method)?)?;
                Ok(json!({ "$eq": [
                    { "$substrCP": [s, 0, { "$strLenCP": prefix.clone() }] },
                    prefix,
                ] }))
            }
            "EndsWith" => {
                let suffix_expr = Self::arg(args, 0, method)?;
                if let Some(suffix) = constant_string(&suffix_expr) {
                    return Ok(json!({ "$regexMatch": {
                        "input": s,
                        "regex": format!("{}$", escape_regex(suffix)),
                    } }));
                }
                let suffix = self.translate_value(&suffix_expr)?;
                let s_len = json!({ "$strLenCP": s.clone() });
                let suffix_len = json!({ "$strLenCP": suffix.clone() });
                Ok(json!({ "$cond": [
                    { "$lt": [s_len.clone(), suffix_len.clone()] },
                    false,
                    { "$eq": [
                        { "$substrCP": [s, { "$subtract": [s_len, suffix_len.clone()] }, suffix_len] },
                        suffix,
                    ] },
                ] }))
            }
            other => Err(LinqError::unsupported(format!("method String.{}", other))),
        }
    }

    fn date_call(&mut self, object: &Expr, method: &str, args: &[Expr]) -> Result<Value> {
        let date = self.translate_value(object)?;
        let amount_expr = Self::arg(args, 0, method)?;
        let amount = self.translate_value(&amount_expr)?;

        if let Some(millis) = lookup(DATE_ADD_MILLIS, method) {
            return Ok(json!({ "$add": [date, { "$multiply": [amount, millis] }] }));
        }
        match method {
            "AddMonths" | "AddYears" => {
                let unit = if method == "AddMonths" { "month" } else { "year" };
                Ok(json!({ "$dateAdd": {
                    "startDate": date,
                    "unit": unit,
                    "amount": amount,
                } }))
            }
            "Add" => Ok(json!({ "$add": [
                date,
                { "$multiply": [amount, codec::MILLIS_PER_DURATION_UNIT] },
            ] })),
            "Subtract" if amount_expr.ty().is_date() => Ok(json!({ "$divide": [
                { "$subtract": [date, amount] },
                codec::MILLIS_PER_DURATION_UNIT,
            ] })),
            "Subtract" => Ok(json!({ "$subtract": [
                date,
                { "$multiply": [amount, codec::MILLIS_PER_DURATION_UNIT] },
            ] })),
            other => Err(LinqError::unsupported(format!("method DateTime.{}", other))),
        }
    }
}

/// Letters for a constant regex-options argument
pub(crate) fn regex_option_letters(options: &Expr) -> Result<String> {
    let bits = options
        .as_constant()
        .and_then(Value::as_u64)
        .ok_or_else(|| LinqError::unsupported("non-constant regex options"))?;
    Ok(RegexOptions::from_bits_truncate(bits as u32).to_option_letters())
}

/// Characters passed to Trim/TrimStart/TrimEnd
fn trim_chars(args: &[Expr]) -> Result<String> {
    let mut chars = String::new();
    for arg in args {
        match arg.as_constant() {
            Some(Value::String(s)) => chars.push_str(s),
            Some(Value::Array(items)) => {
                for item in items {
                    chars.push_str(item.as_str().ok_or_else(|| {
                        LinqError::unsupported("non-character trim argument")
                    })?);
                }
            }
            _ => return Err(LinqError::unsupported("non-constant trim characters")),
        }
    }
    Ok(chars)
}

#[cfg(test)]
mod tests {
    use super::super::Translator;
    use super::*;
    use crate::expr::builder::*;

    fn t() -> Translator {
        Translator::new("people", ExprType::entity("Person"))
    }

    fn p() -> Expr {
        param("p", ExprType::entity("Person"))
    }

    #[test]
    fn test_arithmetic_and_integer_division() {
        let age = p().member("Age", ExprType::Int);
        assert_eq!(
            t().translate_value(&age.plus(int(1))).unwrap(),
            json!({"$add": ["$Age", 1]})
        );
        assert_eq!(
            t().translate_value(&age.divided_by(int(2))).unwrap(),
            json!({"$trunc": {"$divide": ["$Age", 2]}})
        );
        let score = p().member("Score", ExprType::Double);
        assert_eq!(
            t().translate_value(&score.divided_by(double(2.0))).unwrap(),
            json!({"$divide": ["$Score", 2.0]})
        );
    }

    #[test]
    fn test_string_concat_guards_nulls() {
        let e = p()
            .member("First", ExprType::String)
            .plus(string(" "))
            .plus(p().member("Age", ExprType::Int));
        assert_eq!(
            t().translate_value(&e).unwrap(),
            json!({"$concat": [
                {"$ifNull": ["$First", ""]},
                " ",
                {"$ifNull": [{"$toString": "$Age"}, ""]}
            ]})
        );
    }

    #[test]
    fn test_date_parts_and_arithmetic() {
        let born = p().member("Born", ExprType::DateTime);
        assert_eq!(
            t().translate_value(&born.member("Year", ExprType::Int)).unwrap(),
            json!({"$year": "$Born"})
        );
        assert_eq!(
            t().translate_value(&born.member("DayOfWeek", ExprType::Int)).unwrap(),
            json!({"$subtract": [{"$dayOfWeek": "$Born"}, 1]})
        );
        assert_eq!(
            t().translate_value(&born.call("AddDays", vec![int(2)], ExprType::DateTime))
                .unwrap(),
            json!({"$add": ["$Born", {"$multiply": [2, 86_400_000.0]}]})
        );
        assert_eq!(
            t().translate_value(&born.call("AddMonths", vec![int(1)], ExprType::DateTime))
                .unwrap(),
            json!({"$dateAdd": {"startDate": "$Born", "unit": "month", "amount": 1}})
        );
        let other = p().member("Hired", ExprType::DateTime);
        assert_eq!(
            t().translate_value(&other.minus(born)).unwrap(),
            json!({"$divide": [{"$subtract": ["$Hired", "$Born"]}, 1000.0]})
        );
    }

    #[test]
    fn test_duration_totals() {
        let span = p().member("Span", ExprType::Duration);
        assert_eq!(
            t().translate_value(&span.member("TotalHours", ExprType::Double)).unwrap(),
            json!({"$divide": ["$Span", 3600.0]})
        );
        assert_eq!(
            t().translate_value(&span.member("TotalSeconds", ExprType::Double)).unwrap(),
            json!("$Span")
        );
    }

    #[test]
    fn test_sequence_operators_mint_distinct_vars() {
        let pets = p().member("Pets", ExprType::array(ExprType::entity("Pet")));
        let x = param("x", ExprType::entity("Pet"));
        let e = pets
            .seq(
                "Where",
                vec![lambda(&["x"], x.member("Age", ExprType::Int).gt(int(1)))],
                ExprType::array(ExprType::entity("Pet")),
            )
            .seq(
                "Select",
                vec![lambda(&["x"], x.member("Name", ExprType::String))],
                ExprType::array(ExprType::String),
            );
        assert_eq!(
            t().translate_value(&e).unwrap(),
            json!({"$map": {
                "input": {"$filter": {"input": "$Pets", "as": "v0", "cond": {"$gt": ["$$v0.Age", 1]}}},
                "as": "v1",
                "in": "$$v1.Name"
            }})
        );
    }

    #[test]
    fn test_take_from_array_never_counts_from_the_end() {
        let tags = p().member("Tags", ExprType::array(ExprType::String));
        let take = tags.seq("Take", vec![int(-2)], ExprType::array(ExprType::String));
        assert_eq!(
            t().translate_value(&take).unwrap(),
            json!({"$slice": ["$Tags", {"$max": [-2, 0]}]})
        );
    }

    #[test]
    fn test_any_and_all_guard_missing_arrays() {
        let tags = p().member("Tags", ExprType::array(ExprType::String));
        let x = param("x", ExprType::String);
        let all = tags.seq(
            "All",
            vec![lambda(&["x"], x.not_equals(string("")))],
            ExprType::Bool,
        );
        assert_eq!(
            t().translate_value(&all).unwrap(),
            json!({"$eq": [
                {"$size": {"$filter": {
                    "input": {"$ifNull": ["$Tags", []]},
                    "as": "v0",
                    "cond": {"$ne": ["$$v0", ""]}
                }}},
                {"$size": {"$ifNull": ["$Tags", []]}}
            ]})
        );
    }

    #[test]
    fn test_string_methods() {
        let name = p().member("Name", ExprType::String);
        assert_eq!(
            t().translate_value(&name.call("ToUpper", vec![], ExprType::String)).unwrap(),
            json!({"$toUpper": "$Name"})
        );
        assert_eq!(
            t().translate_value(&name.call("Trim", vec![string("x")], ExprType::String))
                .unwrap(),
            json!({"$trim": {"input": "$Name", "chars": "x"}})
        );
        assert_eq!(
            t().translate_value(&name.call("Substring", vec![int(1), int(2)], ExprType::String))
                .unwrap(),
            json!({"$substrCP": ["$Name", 1, 2]})
        );
        assert_eq!(
            t().translate_value(&name.call("EndsWith", vec![string(".x")], ExprType::Bool))
                .unwrap(),
            json!({"$regexMatch": {"input": "$Name", "regex": "\\.x$"}})
        );
        assert_eq!(
            t().translate_value(&name.member("Length", ExprType::Int)).unwrap(),
            json!({"$strLenCP": "$Name"})
        );
    }

    #[test]
    fn test_math_and_casts() {
        let score = p().member("Score", ExprType::Double);
        assert_eq!(
            t().translate_value(&score.cast(ExprType::Int)).unwrap(),
            json!({"$trunc": "$Score"})
        );
        let sign = static_call(Declaring::Math, "Sign", vec![score.clone()], ExprType::Int);
        assert_eq!(
            t().translate_value(&sign).unwrap(),
            json!({"$cond": [{"$gt": ["$Score", 0]}, 1, {"$cond": [{"$lt": ["$Score", 0]}, -1, 0]}]})
        );
        let abs = static_call(Declaring::Math, "Abs", vec![score], ExprType::Double);
        assert_eq!(t().translate_value(&abs).unwrap(), json!({"$abs": "$Score"}));
    }

    #[test]
    fn test_conditional_and_coalesce() {
        let age = p().member("Age", ExprType::Int);
        let nick = p().member("Nick", ExprType::String);
        let e = condition(age.gt(int(17)), string("adult"), nick.coalesce(string("kid")));
        assert_eq!(
            t().translate_value(&e).unwrap(),
            json!({"$cond": [{"$gt": ["$Age", 17]}, "adult", {"$ifNull": ["$Nick", "kid"]}]})
        );
    }

    #[test]
    fn test_literals_are_protected() {
        assert_eq!(literal(&json!("$notAField")), json!({"$literal": "$notAField"}));
        assert_eq!(literal(&json!({"a": 1})), json!({"$literal": {"a": 1}}));
        assert_eq!(literal(&json!({"$date": 5})), json!({"$date": 5}));
        assert_eq!(lifted_literal(&json!(3)), json!({"$add": [3]}));
        assert_eq!(lifted_literal(&json!("x")), json!({"$concat": ["x"]}));
        assert_eq!(lifted_literal(&json!(true)), json!({"$or": [true, false]}));
        assert_eq!(lifted_literal(&Value::Null), json!({"$literal": null}));
    }

    #[test]
    fn test_regex_is_match_options() {
        let name = p().member("Name", ExprType::String);
        let e = static_call(
            Declaring::Regex,
            "IsMatch",
            vec![name, string("^a"), int(17)],
            ExprType::Bool,
        );
        assert_eq!(
            t().translate_value(&e).unwrap(),
            json!({"$regexMatch": {"input": "$Name", "regex": "^a", "options": "is"}})
        );
    }

    #[test]
    fn test_unsupported_names_node() {
        let name = p().member("Name", ExprType::String);
        let err = t()
            .translate_value(&name.call("PadLeft", vec![int(3)], ExprType::String))
            .unwrap_err();
        assert!(err.to_string().contains("PadLeft"));
    }
}
