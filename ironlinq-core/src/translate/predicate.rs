// ironlinq-core/src/translate/predicate.rs
// Boolean lambda bodies → match-dialect filters
//
// Plain field/literal shapes use the match dialect directly (so they can use indexes);
// everything else is wrapped in `$expr` around the value translation.

use super::value::{comparison_operator, op, regex_option_letters};
use super::{escape_regex, Translator};
use crate::codec::{self, ObjectId};
use crate::error::{LinqError, Result};
use crate::expr::{BinaryOp, Declaring, Expr, UnaryOp};
use crate::pipeline::{always_false_filter, is_always_false_filter};
use serde_json::{json, Map, Value};

fn field_filter(path: &str, condition: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(path.to_string(), condition);
    Value::Object(doc)
}

fn is_empty_filter(filter: &Value) -> bool {
    filter.as_object().map_or(false, Map::is_empty)
}

fn is_zero(expr: &Expr) -> bool {
    expr.as_constant().and_then(Value::as_f64) == Some(0.0)
}

/// Operands of `String.Compare(a, b)` / `a.CompareTo(b)`
fn compare_operands(expr: &Expr) -> Option<(&Expr, &Expr)> {
    match expr {
        Expr::Call {
            declaring: Declaring::String,
            method,
            args,
            ..
        } if method == "Compare" && args.len() == 2 => Some((&args[0], &args[1])),
        Expr::Call {
            declaring: Declaring::Instance,
            method,
            object: Some(object),
            args,
            ..
        } if method == "CompareTo" && args.len() == 1 => Some((object, &args[0])),
        _ => None,
    }
}

/// Identifier whose `CreationTime` is read
fn creation_time_target(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::Member { target, member, .. }
            if member.name == "CreationTime" && target.ty().is_object_id() =>
        {
            Some(target)
        }
        _ => None,
    }
}

/// Array whose length is read (`.Length`, `.Count`, `.Count()`)
fn array_length_operand(expr: &Expr) -> Option<&Expr> {
    match expr {
        Expr::ArrayLength { operand } => Some(operand),
        Expr::Member { target, member, .. }
            if target.ty().is_array() && (member.name == "Count" || member.name == "Length") =>
        {
            Some(target)
        }
        Expr::Call {
            declaring: Declaring::Enumerable,
            method,
            args,
            ..
        } if method == "Count" && args.len() == 1 && args[0].ty().is_array() => Some(&args[0]),
        _ => None,
    }
}

/// Source and item of a membership test
fn contains_operands(expr: &Expr) -> Option<(&Expr, &Expr)> {
    match expr {
        Expr::Call {
            declaring: Declaring::Enumerable,
            method,
            args,
            ..
        } if method == "Contains" && args.len() == 2 => Some((&args[0], &args[1])),
        Expr::Call {
            declaring: Declaring::Instance,
            method,
            object: Some(object),
            args,
            ..
        } if method == "Contains" && args.len() == 1 && !object.ty().is_string() => {
            Some((object, &args[0]))
        }
        _ => None,
    }
}

/// A constant list (or null) on the source side of a membership test
fn constant_list(expr: &Expr) -> Option<&Value> {
    match expr.as_constant()? {
        value @ (Value::Array(_) | Value::Null) => Some(value),
        _ => None,
    }
}

impl Translator {
    /// Filter for a predicate body; `None` when it always holds
    pub(crate) fn translate_filter(&mut self, body: &Expr) -> Result<Option<Value>> {
        let filter = self.predicate(body)?;
        Ok(if is_empty_filter(&filter) {
            None
        } else {
            Some(filter)
        })
    }

    fn predicate(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Constant {
                value: Value::Bool(true),
                ..
            } => Ok(json!({})),
            Expr::Constant {
                value: Value::Bool(false),
                ..
            } => Ok(always_false_filter()),
            Expr::Binary { op: bin, .. } if bin.is_conjunction() => self.junction(*bin, expr),
            Expr::Binary { op: bin, .. } if bin.is_disjunction() => self.junction(*bin, expr),
            Expr::Binary {
                op: bin,
                left,
                right,
                ..
            } if bin.is_comparison() => self.comparison(*bin, left, right),
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => self.negation(operand),
            Expr::Call { .. } => self.call_predicate(expr),
            Expr::Member { .. } | Expr::Parameter { .. } | Expr::Convert { .. }
                if expr.ty().is_bool() =>
            {
                match self.match_path(expr)? {
                    Some(path) => Ok(field_filter(&path, json!(true))),
                    None => self.expr_filter(expr),
                }
            }
            other => self.expr_filter(other),
        }
    }

    fn expr_filter(&mut self, expr: &Expr) -> Result<Value> {
        Ok(json!({ "$expr": self.translate_value(expr)? }))
    }

    fn junction(&mut self, bin: BinaryOp, expr: &Expr) -> Result<Value> {
        let mut operands = Vec::new();
        collect_junction(bin, expr, &mut operands);
        let conjunction = bin.is_conjunction();

        let mut clauses = Vec::with_capacity(operands.len());
        for operand in operands {
            let clause = self.predicate(operand)?;
            if is_empty_filter(&clause) {
                if conjunction {
                    continue;
                }
                return Ok(json!({}));
            }
            if is_always_false_filter(&clause) {
                if conjunction {
                    return Ok(always_false_filter());
                }
                continue;
            }
            clauses.push(clause);
        }
        Ok(match clauses.len() {
            0 if conjunction => json!({}),
            0 => always_false_filter(),
            1 => clauses.remove(0),
            _ if conjunction => json!({ "$and": clauses }),
            _ => json!({ "$or": clauses }),
        })
    }

    fn negation(&mut self, operand: &Expr) -> Result<Value> {
        if let Expr::Unary {
            op: UnaryOp::Not,
            operand: inner,
            ..
        } = operand
        {
            return self.predicate(inner);
        }
        if let Some((source, item)) = contains_operands(operand) {
            if let Some(list) = constant_list(source) {
                if let Some(path) = self.match_path(item)? {
                    return Ok(field_filter(&path, json!({ "$nin": list })));
                }
            }
        }
        let inner = self.predicate(operand)?;
        if is_empty_filter(&inner) {
            return Ok(always_false_filter());
        }
        if is_always_false_filter(&inner) {
            return Ok(json!({}));
        }
        if let Some(e) = inner.as_object().filter(|o| o.len() == 1).and_then(|o| o.get("$expr")) {
            return Ok(json!({ "$expr": { "$not": [e] } }));
        }
        Ok(json!({ "$nor": [inner] }))
    }

    fn comparison(&mut self, bin: BinaryOp, left: &Expr, right: &Expr) -> Result<Value> {
        // String.Compare(a, b) <op> 0
        if let Some((a, b)) = compare_operands(left) {
            if is_zero(right) {
                return self.comparison(bin, a, b);
            }
        }
        if let Some((a, b)) = compare_operands(right) {
            if is_zero(left) {
                return self.comparison(bin.flip(), a, b);
            }
        }

        if let (Some(id), Some(date)) = (creation_time_target(left), right.as_constant()) {
            return self.creation_time_range(bin, id, date);
        }
        if let (Some(date), Some(id)) = (left.as_constant(), creation_time_target(right)) {
            return self.creation_time_range(bin.flip(), id, date);
        }

        if let Some(filter) = self.length_comparison(bin, left, right)? {
            return Ok(filter);
        }
        if let Some(filter) = self.length_comparison(bin.flip(), right, left)? {
            return Ok(filter);
        }

        if let Some(value) = right.as_constant() {
            if let Some(path) = self.match_path(left)? {
                return Ok(field_filter(&path, op(comparison_operator(bin), value.clone())));
            }
        }
        if let Some(value) = left.as_constant() {
            if let Some(path) = self.match_path(right)? {
                return Ok(field_filter(
                    &path,
                    op(comparison_operator(bin.flip()), value.clone()),
                ));
            }
        }

        let l = self.translate_value(left)?;
        let r = self.translate_value(right)?;
        Ok(json!({ "$expr": op(comparison_operator(bin), json!([l, r])) }))
    }

    /// `arr.Length == n` → `$size`; other operators fall back to `$expr`
    fn length_comparison(
        &mut self,
        bin: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Option<Value>> {
        let (array, size) = match (array_length_operand(left), right.as_constant()) {
            (Some(array), Some(size)) if size.is_i64() || size.is_u64() => (array, size),
            _ => return Ok(None),
        };
        let path = match self.match_path(array)? {
            Some(path) => path,
            None => return Ok(None),
        };
        Ok(match bin {
            BinaryOp::Equal => Some(field_filter(&path, json!({ "$size": size }))),
            BinaryOp::NotEqual => Some(field_filter(
                &path,
                json!({ "$not": { "$size": size } }),
            )),
            _ => None,
        })
    }

    /// Creation-time comparisons become ranges over the identifier itself
    fn creation_time_range(&mut self, bin: BinaryOp, id: &Expr, date: &Value) -> Result<Value> {
        let path = self.match_path(id)?.ok_or_else(|| {
            LinqError::unsupported(format!("CreationTime of computed value {}", id))
        })?;
        let when = codec::value_to_date(date).ok_or_else(|| {
            LinqError::unsupported(format!("CreationTime compared with non-date {}", date))
        })?;
        let lower = ObjectId::min_for(&when).to_value();
        let upper = ObjectId::max_for(&when).to_value();
        Ok(match bin {
            BinaryOp::Equal => field_filter(&path, json!({ "$gte": lower, "$lte": upper })),
            BinaryOp::GreaterThan => field_filter(&path, json!({ "$gt": upper })),
            BinaryOp::GreaterThanOrEqual => field_filter(&path, json!({ "$gte": lower })),
            BinaryOp::LessThan => field_filter(&path, json!({ "$lt": lower })),
            BinaryOp::LessThanOrEqual => field_filter(&path, json!({ "$lte": upper })),
            BinaryOp::NotEqual => json!({ "$or": [
                field_filter(&path, json!({ "$lt": lower })),
                field_filter(&path, json!({ "$gt": upper })),
            ] }),
            other => {
                return Err(LinqError::contract(format!(
                    "{} is not a comparison",
                    other.symbol()
                )))
            }
        })
    }

    fn call_predicate(&mut self, expr: &Expr) -> Result<Value> {
        let (declaring, method, object, args) = match expr {
            Expr::Call {
                declaring,
                method,
                object,
                args,
                ..
            } => (*declaring, method.as_str(), object.as_deref(), args.as_slice()),
            other => return self.expr_filter(other),
        };

        if let Some((source, item)) = contains_operands(expr) {
            if let Some(list) = constant_list(source) {
                if let Some(path) = self.match_path(item)? {
                    return Ok(field_filter(&path, json!({ "$in": list })));
                }
            }
            if let (Some(path), Some(value)) = (self.match_path(source)?, item.as_constant()) {
                return Ok(field_filter(&path, json!({ "$eq": value })));
            }
            return self.expr_filter(expr);
        }

        match (declaring, method, object, args) {
            (Declaring::String, "IsNullOrEmpty", None, [s]) => {
                if let Some(path) = self.match_path(s)? {
                    return Ok(json!({ "$or": [
                        field_filter(&path, Value::Null),
                        field_filter(&path, json!("")),
                    ] }));
                }
            }
            (Declaring::String, "IsNullOrWhiteSpace", None, [s]) => {
                if let Some(path) = self.match_path(s)? {
                    return Ok(json!({ "$or": [
                        field_filter(&path, Value::Null),
                        field_filter(&path, json!({ "$regex": "^\\s*$" })),
                    ] }));
                }
            }
            (Declaring::String, "Equals", None, [a, b]) => {
                return self.comparison(BinaryOp::Equal, a, b);
            }
            (Declaring::Instance, "Equals", Some(object), [other]) => {
                return self.comparison(BinaryOp::Equal, object, other);
            }
            (Declaring::Instance, "Contains" | "StartsWith" | "EndsWith", Some(object), [arg])
                if object.ty().is_string() =>
            {
                if let (Some(path), Some(Value::String(text))) =
                    (self.match_path(object)?, arg.as_constant())
                {
                    let escaped = escape_regex(text);
                    let pattern = match method {
                        "StartsWith" => format!("^{}", escaped),
                        "EndsWith" => format!("{}$", escaped),
                        _ => escaped,
                    };
                    return Ok(field_filter(&path, json!({ "$regex": pattern })));
                }
            }
            (Declaring::Regex, "IsMatch", None, [input, pattern, rest @ ..]) if rest.len() <= 1 => {
                if let (Some(path), Some(Value::String(pattern))) =
                    (self.match_path(input)?, pattern.as_constant())
                {
                    let mut condition = Map::new();
                    condition.insert("$regex".to_string(), Value::String(pattern.clone()));
                    if let Some(options) = rest.first() {
                        let letters = regex_option_letters(options)?;
                        if !letters.is_empty() {
                            condition.insert("$options".to_string(), Value::String(letters));
                        }
                    }
                    return Ok(field_filter(&path, Value::Object(condition)));
                }
            }
            _ => {}
        }
        self.expr_filter(expr)
    }
}

fn collect_junction<'a>(bin: BinaryOp, expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            op: inner,
            left,
            right,
            ..
        } if inner.is_conjunction() == bin.is_conjunction()
            && inner.is_disjunction() == bin.is_disjunction() =>
        {
            collect_junction(bin, left, out);
            collect_junction(bin, right, out);
        }
        other => out.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Translator;
    use super::*;
    use crate::expr::builder::*;
    use crate::expr::ExprType;
    use chrono::{TimeZone, Utc};

    fn t() -> Translator {
        Translator::new("people", ExprType::entity("Person"))
    }

    fn p() -> Expr {
        param("p", ExprType::entity("Person"))
    }

    fn age() -> Expr {
        p().member("Age", ExprType::Int)
    }

    fn filter(body: &Expr) -> Value {
        t().translate_filter(body).unwrap().unwrap_or(json!({}))
    }

    #[test]
    fn test_field_literal_comparison() {
        assert_eq!(filter(&age().gt(int(25))), json!({"Age": {"$gt": 25}}));
        assert_eq!(
            filter(&p().member("Name", ExprType::String).equals(string("Ann"))),
            json!({"Name": {"$eq": "Ann"}})
        );
    }

    #[test]
    fn test_literal_on_left_flips_operator() {
        assert_eq!(filter(&int(25).lt(age())), json!({"Age": {"$gt": 25}}));
        assert_eq!(filter(&int(25).ge(age())), json!({"Age": {"$lte": 25}}));
    }

    #[test]
    fn test_string_compare_pseudo_comparison() {
        let name = p().member("Name", ExprType::String);
        let cmp = static_call(
            Declaring::String,
            "Compare",
            vec![name.clone(), string("M")],
            ExprType::Int,
        );
        assert_eq!(filter(&cmp.gt(int(0))), json!({"Name": {"$gt": "M"}}));
        assert_eq!(filter(&int(0).gt(cmp)), json!({"Name": {"$lt": "M"}}));
        let cmp_to = name.call("CompareTo", vec![string("M")], ExprType::Int);
        assert_eq!(filter(&cmp_to.le(int(0))), json!({"Name": {"$lte": "M"}}));
    }

    #[test]
    fn test_conjunction_and_disjunction() {
        let name = p().member("Name", ExprType::String);
        let body = age()
            .gt(int(1))
            .and(age().lt(int(9)))
            .and(name.equals(string("x")));
        assert_eq!(
            filter(&body),
            json!({"$and": [
                {"Age": {"$gt": 1}},
                {"Age": {"$lt": 9}},
                {"Name": {"$eq": "x"}}
            ]})
        );
        let either = age().lt(int(1)).or(age().gt(int(9)));
        assert_eq!(
            filter(&either),
            json!({"$or": [{"Age": {"$lt": 1}}, {"Age": {"$gt": 9}}]})
        );
    }

    #[test]
    fn test_constant_predicates() {
        assert!(t().translate_filter(&boolean(true)).unwrap().is_none());
        assert_eq!(filter(&boolean(false)), always_false_filter());
        assert_eq!(filter(&boolean(true).and(age().gt(int(3)))), json!({"Age": {"$gt": 3}}));
    }

    #[test]
    fn test_negation() {
        assert_eq!(
            filter(&age().gt(int(3)).logical_not()),
            json!({"$nor": [{"Age": {"$gt": 3}}]})
        );
        let names = list(vec![json!("a"), json!("b")], ExprType::String);
        let member = names.seq(
            "Contains",
            vec![p().member("Name", ExprType::String)],
            ExprType::Bool,
        );
        assert_eq!(filter(&member), json!({"Name": {"$in": ["a", "b"]}}));
        assert_eq!(filter(&member.logical_not()), json!({"Name": {"$nin": ["a", "b"]}}));
    }

    #[test]
    fn test_bool_member_and_null_checks() {
        let active = p().member("Active", ExprType::Bool);
        assert_eq!(filter(&active), json!({"Active": true}));
        let name = p().member("Name", ExprType::String);
        let check = static_call(Declaring::String, "IsNullOrEmpty", vec![name], ExprType::Bool);
        assert_eq!(
            filter(&check),
            json!({"$or": [{"Name": null}, {"Name": ""}]})
        );
    }

    #[test]
    fn test_string_methods_become_regex() {
        let name = p().member("Name", ExprType::String);
        assert_eq!(
            filter(&name.call("StartsWith", vec![string("A.")], ExprType::Bool)),
            json!({"Name": {"$regex": "^A\\."}})
        );
        assert_eq!(
            filter(&name.call("Contains", vec![string("nn")], ExprType::Bool)),
            json!({"Name": {"$regex": "nn"}})
        );
        let is_match = static_call(
            Declaring::Regex,
            "IsMatch",
            vec![name, string("^a"), int(1)],
            ExprType::Bool,
        );
        assert_eq!(
            filter(&is_match),
            json!({"Name": {"$regex": "^a", "$options": "i"}})
        );
    }

    #[test]
    fn test_array_size_rules() {
        let pets = p().member("Pets", ExprType::array(ExprType::entity("Pet")));
        assert_eq!(
            filter(&pets.member("Count", ExprType::Int).equals(int(2))),
            json!({"Pets": {"$size": 2}})
        );
        assert_eq!(
            filter(&pets.length().not_equals(int(0))),
            json!({"Pets": {"$not": {"$size": 0}}})
        );
        assert_eq!(
            filter(&pets.length().gt(int(1))),
            json!({"$expr": {"$gt": [{"$size": "$Pets"}, 1]}})
        );
    }

    #[test]
    fn test_creation_time_ranges() {
        let id = p().id_member("Id", ExprType::ObjectId);
        let created = id.member("CreationTime", ExprType::DateTime);
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let lower = ObjectId::min_for(&when).to_value();
        let upper = ObjectId::max_for(&when).to_value();
        assert_eq!(
            filter(&created.equals(date(&when))),
            json!({"_id": {"$gte": lower, "$lte": upper}})
        );
        assert_eq!(filter(&created.gt(date(&when))), json!({"_id": {"$gt": upper}}));
        assert_eq!(filter(&date(&when).gt(created.clone())), json!({"_id": {"$lt": lower}}));
        assert_eq!(
            filter(&created.not_equals(date(&when))),
            json!({"$or": [{"_id": {"$lt": lower}}, {"_id": {"$gt": upper}}]})
        );
    }

    #[test]
    fn test_computed_sides_use_expr() {
        let body = age().plus(int(1)).gt(p().member("Limit", ExprType::Int));
        assert_eq!(
            filter(&body),
            json!({"$expr": {"$gt": [{"$add": ["$Age", 1]}, "$Limit"]}})
        );
        let year = p()
            .member("Born", ExprType::DateTime)
            .member("Year", ExprType::Int);
        assert_eq!(
            filter(&year.equals(int(2000))),
            json!({"$expr": {"$eq": [{"$year": "$Born"}, 2000]}})
        );
    }
}
