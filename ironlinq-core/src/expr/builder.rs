// ironlinq-core/src/expr/builder.rs
//! Fluent constructors for expression trees
//!
//! ```
//! use ironlinq_core::expr::builder::*;
//! use ironlinq_core::expr::ExprType;
//!
//! let people = collection("people", "Person");
//! let p = param("p", ExprType::entity("Person"));
//! let query = people
//!     .filter(lambda(&["p"], p.member("Age", ExprType::Int).gt(int(25))))
//!     .select(lambda(&["p"], p.member("Name", ExprType::String)));
//! assert_eq!(query.to_string(), "people.Where(p => (p.Age > 25)).Select(p => p.Name)");
//! ```

use super::{BinaryOp, Declaring, Expr, ExprType, MemberInfo, NewField, UnaryOp};
use chrono::{DateTime, Utc};
use serde_json::Value;

// ============================================================================
// LEAVES
// ============================================================================

pub fn collection(name: &str, item_type: &str) -> Expr {
    Expr::Collection {
        name: name.to_string(),
        item_type: ExprType::entity(item_type),
    }
}

pub fn param(name: &str, ty: ExprType) -> Expr {
    Expr::Parameter {
        name: name.to_string(),
        ty,
    }
}

pub fn constant(value: impl Into<Value>, ty: ExprType) -> Expr {
    Expr::Constant {
        value: value.into(),
        ty,
    }
}

pub fn int(value: i64) -> Expr {
    constant(value, ExprType::Int)
}

pub fn double(value: f64) -> Expr {
    constant(value, ExprType::Double)
}

pub fn string(value: &str) -> Expr {
    constant(value, ExprType::String)
}

pub fn boolean(value: bool) -> Expr {
    constant(value, ExprType::Bool)
}

pub fn null(ty: ExprType) -> Expr {
    constant(Value::Null, ty)
}

pub fn date(value: &DateTime<Utc>) -> Expr {
    constant(crate::codec::date_to_value(value), ExprType::DateTime)
}

/// Constant list, e.g. the captured right-hand side of `names.Contains(p.Name)`
pub fn list(values: Vec<Value>, element: ExprType) -> Expr {
    constant(Value::Array(values), ExprType::array(element))
}

pub fn lambda(params: &[&str], body: Expr) -> Expr {
    Expr::Lambda {
        params: params.iter().map(|p| p.to_string()).collect(),
        body: Box::new(body),
    }
}

pub fn condition(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
    let ty = if_true.ty();
    Expr::Conditional {
        test: Box::new(test),
        if_true: Box::new(if_true),
        if_false: Box::new(if_false),
        ty,
    }
}

/// Anonymous object: `new { A = .., B = .. }`
pub fn new_object(fields: Vec<(&str, Expr)>) -> Expr {
    Expr::New {
        fields: fields
            .into_iter()
            .map(|(name, value)| NewField {
                member: MemberInfo::named(name),
                value,
            })
            .collect(),
        ty: ExprType::Anonymous,
    }
}

/// Nominal member-init with explicit member metadata
pub fn new_entity(type_name: &str, fields: Vec<(MemberInfo, Expr)>) -> Expr {
    Expr::New {
        fields: fields
            .into_iter()
            .map(|(member, value)| NewField { member, value })
            .collect(),
        ty: ExprType::entity(type_name),
    }
}

pub fn static_call(declaring: Declaring, method: &str, args: Vec<Expr>, ty: ExprType) -> Expr {
    Expr::Call {
        declaring,
        method: method.to_string(),
        object: None,
        args,
        ty,
    }
}

/// `Enumerable.Range(start, count)`
pub fn range(start: Expr, count: Expr) -> Expr {
    static_call(
        Declaring::Enumerable,
        "Range",
        vec![start, count],
        ExprType::array(ExprType::Int),
    )
}

// ============================================================================
// COMPOSITION
// ============================================================================

fn element_of(ty: &ExprType) -> ExprType {
    ty.element().cloned().unwrap_or(ExprType::Object)
}

fn lambda_result(lambda: &Expr) -> ExprType {
    match lambda {
        Expr::Lambda { body, .. } => body.ty(),
        other => other.ty(),
    }
}

impl Expr {
    pub fn member(&self, name: &str, ty: ExprType) -> Expr {
        self.member_with(MemberInfo::named(name), ty)
    }

    /// Member carrying the identifier attribute (stored as `_id`)
    pub fn id_member(&self, name: &str, ty: ExprType) -> Expr {
        self.member_with(MemberInfo::identifier(name), ty)
    }

    pub fn member_with(&self, member: MemberInfo, ty: ExprType) -> Expr {
        Expr::Member {
            target: Box::new(self.clone()),
            member,
            ty,
        }
    }

    fn binary(&self, op: BinaryOp, rhs: Expr, ty: ExprType) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self.clone()),
            right: Box::new(rhs),
            ty,
        }
    }

    pub fn equals(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::Equal, rhs, ExprType::Bool)
    }

    pub fn not_equals(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::NotEqual, rhs, ExprType::Bool)
    }

    pub fn gt(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThan, rhs, ExprType::Bool)
    }

    pub fn ge(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThanOrEqual, rhs, ExprType::Bool)
    }

    pub fn lt(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::LessThan, rhs, ExprType::Bool)
    }

    pub fn le(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::LessThanOrEqual, rhs, ExprType::Bool)
    }

    pub fn compare(&self, op: BinaryOp, rhs: Expr) -> Expr {
        self.binary(op, rhs, ExprType::Bool)
    }

    pub fn and(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::AndAlso, rhs, ExprType::Bool)
    }

    pub fn or(&self, rhs: Expr) -> Expr {
        self.binary(BinaryOp::OrElse, rhs, ExprType::Bool)
    }

    pub fn logical_not(&self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self.clone()),
            ty: ExprType::Bool,
        }
    }

    pub fn negate(&self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Negate,
            operand: Box::new(self.clone()),
            ty: self.ty(),
        }
    }

    fn arithmetic(&self, op: BinaryOp, rhs: Expr) -> Expr {
        let (lt, rt) = (self.ty(), rhs.ty());
        let ty = if lt.is_string() || rt.is_string() {
            ExprType::String
        } else if lt.is_date() && rt.is_date() {
            ExprType::Duration
        } else if lt.is_date() || rt.is_date() {
            ExprType::DateTime
        } else if lt.is_integral() && !rt.is_integral() {
            rt
        } else {
            lt
        };
        self.binary(op, rhs, ty)
    }

    pub fn plus(&self, rhs: Expr) -> Expr {
        self.arithmetic(BinaryOp::Add, rhs)
    }

    pub fn minus(&self, rhs: Expr) -> Expr {
        self.arithmetic(BinaryOp::Subtract, rhs)
    }

    pub fn times(&self, rhs: Expr) -> Expr {
        self.arithmetic(BinaryOp::Multiply, rhs)
    }

    pub fn divided_by(&self, rhs: Expr) -> Expr {
        self.arithmetic(BinaryOp::Divide, rhs)
    }

    pub fn modulo(&self, rhs: Expr) -> Expr {
        self.arithmetic(BinaryOp::Modulo, rhs)
    }

    pub fn cast(&self, ty: ExprType) -> Expr {
        Expr::Convert {
            operand: Box::new(self.clone()),
            ty,
        }
    }

    pub fn coalesce(&self, rhs: Expr) -> Expr {
        let ty = rhs.ty();
        Expr::Coalesce {
            left: Box::new(self.clone()),
            right: Box::new(rhs),
            ty,
        }
    }

    /// `arr.Length` on a true array
    pub fn length(&self) -> Expr {
        Expr::ArrayLength {
            operand: Box::new(self.clone()),
        }
    }

    /// Instance method call on this value
    pub fn call(&self, method: &str, args: Vec<Expr>, ty: ExprType) -> Expr {
        Expr::Call {
            declaring: Declaring::Instance,
            method: method.to_string(),
            object: Some(Box::new(self.clone())),
            args,
            ty,
        }
    }

    /// Sequence operator applied to this array value (`p.Pets.Any(..)`)
    pub fn seq(&self, method: &str, args: Vec<Expr>, ty: ExprType) -> Expr {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(self.clone());
        all.extend(args);
        static_call(Declaring::Enumerable, method, all, ty)
    }

    // ------------------------------------------------------------------------
    // Query operators
    // ------------------------------------------------------------------------

    fn query(&self, method: &str, args: Vec<Expr>, ty: ExprType) -> Expr {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(self.clone());
        all.extend(args);
        Expr::Call {
            declaring: Declaring::Queryable,
            method: method.to_string(),
            object: None,
            args: all,
            ty,
        }
    }

    fn element_type(&self) -> ExprType {
        element_of(&self.ty())
    }

    /// `Where(predicate)`
    pub fn filter(&self, predicate: Expr) -> Expr {
        self.query("Where", vec![predicate], self.ty())
    }

    pub fn select(&self, selector: Expr) -> Expr {
        let ty = ExprType::array(lambda_result(&selector));
        self.query("Select", vec![selector], ty)
    }

    pub fn select_many(&self, selector: Expr) -> Expr {
        let ty = ExprType::array(element_of(&lambda_result(&selector)));
        self.query("SelectMany", vec![selector], ty)
    }

    /// `SelectMany(collectionSelector, resultSelector)`
    pub fn select_many_with(&self, selector: Expr, result: Expr) -> Expr {
        let ty = ExprType::array(lambda_result(&result));
        self.query("SelectMany", vec![selector, result], ty)
    }

    pub fn order_by(&self, key: Expr) -> Expr {
        self.query("OrderBy", vec![key], self.ty())
    }

    pub fn order_by_descending(&self, key: Expr) -> Expr {
        self.query("OrderByDescending", vec![key], self.ty())
    }

    pub fn then_by(&self, key: Expr) -> Expr {
        self.query("ThenBy", vec![key], self.ty())
    }

    pub fn then_by_descending(&self, key: Expr) -> Expr {
        self.query("ThenByDescending", vec![key], self.ty())
    }

    pub fn take(&self, count: i64) -> Expr {
        self.query("Take", vec![int(count)], self.ty())
    }

    pub fn skip(&self, count: i64) -> Expr {
        self.query("Skip", vec![int(count)], self.ty())
    }

    pub fn distinct(&self) -> Expr {
        self.query("Distinct", vec![], self.ty())
    }

    pub fn group_by(&self, key: Expr) -> Expr {
        let ty = ExprType::array(ExprType::grouping(
            lambda_result(&key),
            self.element_type(),
        ));
        self.query("GroupBy", vec![key], ty)
    }

    pub fn join(&self, inner: Expr, outer_key: Expr, inner_key: Expr, result: Expr) -> Expr {
        let ty = ExprType::array(lambda_result(&result));
        self.query("Join", vec![inner, outer_key, inner_key, result], ty)
    }

    pub fn of_type(&self, type_name: &str) -> Expr {
        self.query(
            "OfType",
            vec![],
            ExprType::array(ExprType::entity(type_name)),
        )
    }

    pub fn count(&self) -> Expr {
        self.query("Count", vec![], ExprType::Int)
    }

    pub fn count_where(&self, predicate: Expr) -> Expr {
        self.query("Count", vec![predicate], ExprType::Int)
    }

    pub fn long_count(&self) -> Expr {
        self.query("LongCount", vec![], ExprType::Long)
    }

    pub fn any(&self) -> Expr {
        self.query("Any", vec![], ExprType::Bool)
    }

    pub fn any_where(&self, predicate: Expr) -> Expr {
        self.query("Any", vec![predicate], ExprType::Bool)
    }

    fn aggregate(&self, method: &str, selector: Option<Expr>) -> Expr {
        match selector {
            Some(selector) => {
                let ty = lambda_result(&selector);
                let ty = if method == "Average" && ty.is_integral() {
                    ExprType::Double
                } else {
                    ty
                };
                self.query(method, vec![selector], ty)
            }
            None => {
                let ty = self.element_type();
                self.query(method, vec![], ty)
            }
        }
    }

    pub fn sum(&self, selector: Option<Expr>) -> Expr {
        self.aggregate("Sum", selector)
    }

    pub fn min(&self, selector: Option<Expr>) -> Expr {
        self.aggregate("Min", selector)
    }

    pub fn max(&self, selector: Option<Expr>) -> Expr {
        self.aggregate("Max", selector)
    }

    pub fn average(&self, selector: Option<Expr>) -> Expr {
        self.aggregate("Average", selector)
    }

    fn element_operator(&self, method: &str, predicate: Option<Expr>) -> Expr {
        let ty = self.element_type();
        self.query(method, predicate.into_iter().collect(), ty)
    }

    pub fn first(&self) -> Expr {
        self.element_operator("First", None)
    }

    pub fn first_where(&self, predicate: Expr) -> Expr {
        self.element_operator("First", Some(predicate))
    }

    pub fn first_or_default(&self) -> Expr {
        self.element_operator("FirstOrDefault", None)
    }

    pub fn single(&self) -> Expr {
        self.element_operator("Single", None)
    }

    pub fn single_where(&self, predicate: Expr) -> Expr {
        self.element_operator("Single", Some(predicate))
    }

    pub fn single_or_default(&self) -> Expr {
        self.element_operator("SingleOrDefault", None)
    }
}
