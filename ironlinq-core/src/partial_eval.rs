// ironlinq-core/src/partial_eval.rs
//! Partial evaluator
//!
//! Folds closed sub-trees (no parameter references) into constants before translation.
//! Anything that cannot be folded exactly is left untouched.

use crate::expr::{BinaryOp, Expr, ExprType, NewField, UnaryOp};
use crate::value_utils::{compare_values, values_equal};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Fold every closed sub-tree of `expr`. Returns the rewritten tree and whether
/// anything changed.
pub fn partial_evaluate(expr: &Expr) -> (Expr, bool) {
    let mut changed = false;
    let out = fold(expr, &mut changed);
    (out, changed)
}

fn folded(value: Value, ty: ExprType) -> Expr {
    Expr::Constant { value, ty }
}

fn literal(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Constant { value, .. } => Some(value),
        _ => None,
    }
}

fn fold_box(expr: &Expr, changed: &mut bool) -> Box<Expr> {
    Box::new(fold(expr, changed))
}

fn fold(expr: &Expr, changed: &mut bool) -> Expr {
    match expr {
        Expr::Collection { .. } | Expr::Constant { .. } | Expr::Parameter { .. } => expr.clone(),
        Expr::Member { target, member, ty } => {
            let target = fold(target, changed);
            if let Some(Value::Object(fields)) = literal(&target) {
                let value = fields
                    .get(&member.name)
                    .or_else(|| fields.get(member.field_name()));
                if let Some(value) = value {
                    *changed = true;
                    return folded(value.clone(), ty.clone());
                }
            }
            Expr::Member {
                target: Box::new(target),
                member: member.clone(),
                ty: ty.clone(),
            }
        }
        Expr::Unary { op, operand, ty } => {
            let operand = fold(operand, changed);
            if let Some(value) = literal(&operand).and_then(|v| fold_unary(*op, v)) {
                *changed = true;
                return folded(value, ty.clone());
            }
            Expr::Unary {
                op: *op,
                operand: Box::new(operand),
                ty: ty.clone(),
            }
        }
        Expr::Binary {
            op,
            left,
            right,
            ty,
        } => {
            let left = fold(left, changed);
            let right = fold(right, changed);
            if let (Some(l), Some(r)) = (literal(&left), literal(&right)) {
                if let Some(value) = fold_binary(*op, l, r, ty) {
                    *changed = true;
                    return folded(value, ty.clone());
                }
            }
            Expr::Binary {
                op: *op,
                left: Box::new(left),
                right: Box::new(right),
                ty: ty.clone(),
            }
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
            ty,
        } => {
            let test = fold(test, changed);
            match literal(&test) {
                Some(Value::Bool(true)) => {
                    *changed = true;
                    return fold(if_true, changed);
                }
                Some(Value::Bool(false)) => {
                    *changed = true;
                    return fold(if_false, changed);
                }
                _ => Expr::Conditional {
                    test: Box::new(test),
                    if_true: fold_box(if_true, changed),
                    if_false: fold_box(if_false, changed),
                    ty: ty.clone(),
                },
            }
        }
        Expr::Coalesce { left, right, ty } => {
            let left = fold(left, changed);
            let right = fold(right, changed);
            match literal(&left) {
                Some(Value::Null) => {
                    *changed = true;
                    return right;
                }
                Some(value) => {
                    *changed = true;
                    return folded(value.clone(), ty.clone());
                }
                None => Expr::Coalesce {
                    left: Box::new(left),
                    right: Box::new(right),
                    ty: ty.clone(),
                },
            }
        }
        Expr::ArrayLength { operand } => {
            let operand = fold(operand, changed);
            if let Some(Value::Array(items)) = literal(&operand) {
                *changed = true;
                return folded(Value::from(items.len() as i64), ExprType::Int);
            }
            Expr::ArrayLength {
                operand: Box::new(operand),
            }
        }
        Expr::Convert { operand, ty } => {
            let operand = fold(operand, changed);
            if let Some(value) = literal(&operand).and_then(|v| convert_number(v, ty)) {
                *changed = true;
                return folded(value, ty.clone());
            }
            Expr::Convert {
                operand: Box::new(operand),
                ty: ty.clone(),
            }
        }
        Expr::Call {
            declaring,
            method,
            object,
            args,
            ty,
        } => Expr::Call {
            declaring: *declaring,
            method: method.clone(),
            object: object.as_ref().map(|o| fold_box(o, changed)),
            args: args.iter().map(|a| fold(a, changed)).collect(),
            ty: ty.clone(),
        },
        Expr::Lambda { params, body } => Expr::Lambda {
            params: params.clone(),
            body: fold_box(body, changed),
        },
        Expr::New { fields, ty } => Expr::New {
            fields: fields
                .iter()
                .map(|f| NewField {
                    member: f.member.clone(),
                    value: fold(&f.value, changed),
                })
                .collect(),
            ty: ty.clone(),
        },
    }
}

fn fold_unary(op: UnaryOp, value: &Value) -> Option<Value> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Some(Value::Bool(!b)),
        (UnaryOp::Negate, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.checked_neg().map(Value::from)
            } else {
                n.as_f64().and_then(|f| Number::from_f64(-f)).map(Value::Number)
            }
        }
        _ => None,
    }
}

fn fold_binary(op: BinaryOp, left: &Value, right: &Value, ty: &ExprType) -> Option<Value> {
    match op {
        BinaryOp::Equal => Some(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEqual => Some(Value::Bool(!values_equal(left, right))),
        BinaryOp::GreaterThan
        | BinaryOp::GreaterThanOrEqual
        | BinaryOp::LessThan
        | BinaryOp::LessThanOrEqual => {
            let ord = compare_values(left, right)?;
            let result = match op {
                BinaryOp::GreaterThan => ord == Ordering::Greater,
                BinaryOp::GreaterThanOrEqual => ord != Ordering::Less,
                BinaryOp::LessThan => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            };
            Some(Value::Bool(result))
        }
        BinaryOp::AndAlso | BinaryOp::And => Some(Value::Bool(left.as_bool()? && right.as_bool()?)),
        BinaryOp::OrElse | BinaryOp::Or => Some(Value::Bool(left.as_bool()? || right.as_bool()?)),
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(Value::String(format!("{}{}", a, b))),
            _ => fold_arithmetic(op, left, right, ty),
        },
        _ => fold_arithmetic(op, left, right, ty),
    }
}

fn number(value: &Value) -> Option<&Number> {
    match value {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn fold_arithmetic(op: BinaryOp, left: &Value, right: &Value, ty: &ExprType) -> Option<Value> {
    let (l, r) = (number(left)?, number(right)?);
    if ty.is_integral() {
        let (a, b) = (l.as_i64()?, r.as_i64()?);
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Subtract => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Divide => a.checked_div(b),
            BinaryOp::Modulo => a.checked_rem(b),
            BinaryOp::Power => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            _ => None,
        };
        return result.map(Value::from);
    }
    let (a, b) = (l.as_f64()?, r.as_f64()?);
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if b != 0.0 => a / b,
        BinaryOp::Modulo if b != 0.0 => a % b,
        BinaryOp::Power => a.powf(b),
        _ => return None,
    };
    Number::from_f64(result).map(Value::Number)
}

/// Numeric casts of a literal; everything else keeps its `Convert` node
fn convert_number(value: &Value, ty: &ExprType) -> Option<Value> {
    let n = number(value)?;
    match ty.underlying() {
        ExprType::Int | ExprType::Long => match n.as_i64() {
            Some(i) => Some(Value::from(i)),
            None => {
                let f = n.as_f64()?.trunc();
                (f >= i64::MIN as f64 && f <= i64::MAX as f64).then(|| Value::from(f as i64))
            }
        },
        ExprType::Double | ExprType::Decimal => Number::from_f64(n.as_f64()?).map(Value::Number),
        _ => None,
    }
}
