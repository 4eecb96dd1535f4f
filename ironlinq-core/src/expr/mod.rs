// ironlinq-core/src/expr/mod.rs
//! Query expression trees
//!
//! A query arrives as a closed tree of [`Expr`] nodes: the outermost node is the last
//! operator of a method-call chain (`people.Where(..).Select(..)`), the innermost is the
//! [`Expr::Collection`] the chain starts from. Every value-producing node carries its
//! static [`ExprType`], which is what the translators dispatch on.
//!
//! Trees are serde-serializable so they can be handed over as JSON (see the CLI).

pub mod builder;
mod display;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// TYPES
// ============================================================================

/// Static type of an expression node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprType {
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    String,
    DateTime,
    /// Time span, stored as seconds
    Duration,
    ObjectId,
    Nullable(Box<ExprType>),
    Array(Box<ExprType>),
    /// Nominal document type (entity or nested class)
    Entity(String),
    /// Compiler-generated multi-field shape
    Anonymous,
    /// Result element of a group-by: key plus member elements
    Grouping {
        key: Box<ExprType>,
        element: Box<ExprType>,
    },
    Object,
}

impl ExprType {
    pub fn nullable(inner: ExprType) -> Self {
        ExprType::Nullable(Box::new(inner))
    }

    pub fn array(element: ExprType) -> Self {
        ExprType::Array(Box::new(element))
    }

    pub fn entity(name: &str) -> Self {
        ExprType::Entity(name.to_string())
    }

    pub fn grouping(key: ExprType, element: ExprType) -> Self {
        ExprType::Grouping {
            key: Box::new(key),
            element: Box::new(element),
        }
    }

    /// Strips one level of `Nullable`
    pub fn underlying(&self) -> &ExprType {
        match self {
            ExprType::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, ExprType::Nullable(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.underlying(),
            ExprType::Int | ExprType::Long | ExprType::Double | ExprType::Decimal
        )
    }

    pub fn is_integral(&self) -> bool {
        matches!(self.underlying(), ExprType::Int | ExprType::Long)
    }

    pub fn is_string(&self) -> bool {
        matches!(self.underlying(), ExprType::String)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.underlying(), ExprType::Bool)
    }

    pub fn is_date(&self) -> bool {
        matches!(self.underlying(), ExprType::DateTime)
    }

    pub fn is_duration(&self) -> bool {
        matches!(self.underlying(), ExprType::Duration)
    }

    pub fn is_object_id(&self) -> bool {
        matches!(self.underlying(), ExprType::ObjectId)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ExprType::Array(_))
    }

    pub fn is_grouping(&self) -> bool {
        matches!(self, ExprType::Grouping { .. })
    }

    /// Document-shaped values: their members are plain sub-fields
    pub fn is_document(&self) -> bool {
        matches!(
            self.underlying(),
            ExprType::Entity(_) | ExprType::Anonymous | ExprType::Object
        )
    }

    /// Element type of arrays and groupings
    pub fn element(&self) -> Option<&ExprType> {
        match self {
            ExprType::Array(element) => Some(element),
            ExprType::Grouping { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn entity_name(&self) -> Option<&str> {
        match self.underlying() {
            ExprType::Entity(name) => Some(name),
            _ => None,
        }
    }
}

// ============================================================================
// MEMBERS
// ============================================================================

/// Field name of the document identifier
pub const ID_FIELD: &str = "_id";

/// Metadata of a member (property/field) read or initialized by the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_identifier: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_name: Option<String>,
}

impl MemberInfo {
    pub fn named(name: &str) -> Self {
        MemberInfo {
            name: name.to_string(),
            is_identifier: false,
            element_name: None,
        }
    }

    pub fn identifier(name: &str) -> Self {
        MemberInfo {
            is_identifier: true,
            ..Self::named(name)
        }
    }

    pub fn aliased(name: &str, element_name: &str) -> Self {
        MemberInfo {
            element_name: Some(element_name.to_string()),
            ..Self::named(name)
        }
    }

    /// Stored field name: identifier attribute, then alias, then the declared name
    pub fn field_name(&self) -> &str {
        if self.is_identifier {
            ID_FIELD
        } else if let Some(alias) = &self.element_name {
            alias
        } else {
            &self.name
        }
    }
}

// ============================================================================
// OPERATORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    AndAlso,
    OrElse,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            BinaryOp::AndAlso | BinaryOp::OrElse | BinaryOp::And | BinaryOp::Or
        )
    }

    pub fn is_conjunction(&self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::And)
    }

    pub fn is_disjunction(&self) -> bool {
        matches!(self, BinaryOp::OrElse | BinaryOp::Or)
    }

    /// Mirror of a comparison when its operands swap sides (`5 < x` ⇔ `x > 5`).
    ///
    /// Involution: `op.flip().flip() == op`; equality operators are fixed points.
    pub fn flip(&self) -> BinaryOp {
        match self {
            BinaryOp::GreaterThan => BinaryOp::LessThan,
            BinaryOp::LessThan => BinaryOp::GreaterThan,
            BinaryOp::GreaterThanOrEqual => BinaryOp::LessThanOrEqual,
            BinaryOp::LessThanOrEqual => BinaryOp::GreaterThanOrEqual,
            other => *other,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "**",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }
}

/// Owner of a called method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Declaring {
    /// Query operators; these form the chain turned into pipeline stages
    Queryable,
    /// In-memory sequence operators applied to array values (first argument is the source)
    Enumerable,
    /// Static string helpers (`String.IsNullOrEmpty`, `String.Concat`, ...)
    String,
    Math,
    Regex,
    /// Instance method, dispatched on the receiver's type
    Instance,
}

bitflags! {
    /// Regex options as carried by `Regex.IsMatch(input, pattern, options)` constants
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegexOptions: u32 {
        const IGNORE_CASE = 1;
        const MULTILINE = 2;
        const SINGLELINE = 16;
    }
}

impl RegexOptions {
    /// Option letters understood by `$regex` / `$regexMatch`
    pub fn to_option_letters(&self) -> String {
        let mut letters = String::new();
        if self.contains(RegexOptions::IGNORE_CASE) {
            letters.push('i');
        }
        if self.contains(RegexOptions::MULTILINE) {
            letters.push('m');
        }
        if self.contains(RegexOptions::SINGLELINE) {
            letters.push('s');
        }
        letters
    }
}

// ============================================================================
// NODES
// ============================================================================

/// Initializer of one output field in a `New` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewField {
    pub member: MemberInfo,
    pub value: Expr,
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "camelCase")]
pub enum Expr {
    /// Constant reference to a collection; the root of every query chain
    Collection { name: String, item_type: ExprType },
    Constant { value: Value, ty: ExprType },
    Parameter { name: String, ty: ExprType },
    Member {
        target: Box<Expr>,
        member: MemberInfo,
        ty: ExprType,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        ty: ExprType,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        ty: ExprType,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
        ty: ExprType,
    },
    Call {
        declaring: Declaring,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object: Option<Box<Expr>>,
        #[serde(default)]
        args: Vec<Expr>,
        ty: ExprType,
    },
    /// Cast to `ty`
    Convert { operand: Box<Expr>, ty: ExprType },
    Coalesce {
        left: Box<Expr>,
        right: Box<Expr>,
        ty: ExprType,
    },
    ArrayLength { operand: Box<Expr> },
    Lambda { params: Vec<String>, body: Box<Expr> },
    /// Anonymous (`ty == Anonymous`) or nominal member-init construction
    New { fields: Vec<NewField>, ty: ExprType },
}

impl Expr {
    /// Static type of the node
    pub fn ty(&self) -> ExprType {
        match self {
            Expr::Collection { item_type, .. } => ExprType::array(item_type.clone()),
            Expr::Constant { ty, .. }
            | Expr::Parameter { ty, .. }
            | Expr::Member { ty, .. }
            | Expr::Unary { ty, .. }
            | Expr::Binary { ty, .. }
            | Expr::Conditional { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::Convert { ty, .. }
            | Expr::Coalesce { ty, .. }
            | Expr::New { ty, .. } => ty.clone(),
            Expr::ArrayLength { .. } => ExprType::Int,
            Expr::Lambda { body, .. } => body.ty(),
        }
    }

    /// Node kind, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Collection { .. } => "Collection",
            Expr::Constant { .. } => "Constant",
            Expr::Parameter { .. } => "Parameter",
            Expr::Member { .. } => "MemberAccess",
            Expr::Unary { .. } => "Unary",
            Expr::Binary { .. } => "Binary",
            Expr::Conditional { .. } => "Conditional",
            Expr::Call { .. } => "Call",
            Expr::Convert { .. } => "Convert",
            Expr::Coalesce { .. } => "Coalesce",
            Expr::ArrayLength { .. } => "ArrayLength",
            Expr::Lambda { .. } => "Lambda",
            Expr::New { .. } => "New",
        }
    }

    /// Literal payload of a constant, looking through casts
    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expr::Constant { value, .. } => Some(value),
            Expr::Convert { operand, .. } => operand.as_constant(),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.as_constant().is_some()
    }

    /// Parameter names and body of a lambda
    pub fn as_lambda(&self) -> Option<(&[String], &Expr)> {
        match self {
            Expr::Lambda { params, body } => Some((params, body)),
            _ => None,
        }
    }

    /// Collection the query chain starts from
    pub fn root_collection(&self) -> Option<(&str, &ExprType)> {
        match self {
            Expr::Collection { name, item_type } => Some((name, item_type)),
            Expr::Call {
                declaring: Declaring::Queryable,
                args,
                ..
            } => args.first()?.root_collection(),
            _ => None,
        }
    }

    /// True if no parameter is referenced anywhere below this node
    pub fn is_closed(&self) -> bool {
        match self {
            Expr::Parameter { .. } | Expr::Lambda { .. } | Expr::Collection { .. } => false,
            Expr::Constant { .. } => true,
            Expr::Member { target, .. } => target.is_closed(),
            Expr::Unary { operand, .. }
            | Expr::Convert { operand, .. }
            | Expr::ArrayLength { operand } => operand.is_closed(),
            Expr::Binary { left, right, .. } | Expr::Coalesce { left, right, .. } => {
                left.is_closed() && right.is_closed()
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => test.is_closed() && if_true.is_closed() && if_false.is_closed(),
            Expr::Call { object, args, .. } => {
                object.as_ref().map_or(true, |o| o.is_closed()) && args.iter().all(Expr::is_closed)
            }
            Expr::New { fields, .. } => fields.iter().all(|f| f.value.is_closed()),
        }
    }
}
