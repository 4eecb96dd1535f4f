// ironlinq-core/src/expr/display.rs
// Source-like rendering of expression trees, used by diagnostics and the query log.

use super::{Declaring, Expr, ExprType, UnaryOp};
use std::fmt;

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Bool => write!(f, "bool"),
            ExprType::Int => write!(f, "int"),
            ExprType::Long => write!(f, "long"),
            ExprType::Double => write!(f, "double"),
            ExprType::Decimal => write!(f, "decimal"),
            ExprType::String => write!(f, "string"),
            ExprType::DateTime => write!(f, "DateTime"),
            ExprType::Duration => write!(f, "TimeSpan"),
            ExprType::ObjectId => write!(f, "ObjectId"),
            ExprType::Nullable(inner) => write!(f, "{}?", inner),
            ExprType::Array(element) => write!(f, "IEnumerable<{}>", element),
            ExprType::Entity(name) => write!(f, "{}", name),
            ExprType::Anonymous => write!(f, "<>anonymous"),
            ExprType::Grouping { key, element } => write!(f, "IGrouping<{}, {}>", key, element),
            ExprType::Object => write!(f, "object"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Collection { name, .. } => write!(f, "{}", name),
            Expr::Constant { value, .. } => write!(f, "{}", value),
            Expr::Parameter { name, .. } => write!(f, "{}", name),
            Expr::Member { target, member, .. } => write!(f, "{}.{}", target, member.name),
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Negate => write!(f, "-{}", operand),
            },
            Expr::Binary {
                op, left, right, ..
            } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => write!(f, "({} ? {} : {})", test, if_true, if_false),
            Expr::Call {
                declaring,
                method,
                object,
                args,
                ..
            } => match (declaring, object) {
                (_, Some(object)) => {
                    write!(f, "{}.{}(", object, method)?;
                    write_list(f, args)?;
                    write!(f, ")")
                }
                (Declaring::Queryable, None) | (Declaring::Enumerable, None)
                    if !args.is_empty() && method != "Range" && method != "Repeat" =>
                {
                    write!(f, "{}.{}(", args[0], method)?;
                    write_list(f, &args[1..])?;
                    write!(f, ")")
                }
                (declaring, None) => {
                    let owner = match declaring {
                        Declaring::String => "String",
                        Declaring::Math => "Math",
                        Declaring::Regex => "Regex",
                        Declaring::Queryable => "Queryable",
                        Declaring::Enumerable | Declaring::Instance => "Enumerable",
                    };
                    write!(f, "{}.{}(", owner, method)?;
                    write_list(f, args)?;
                    write!(f, ")")
                }
            },
            Expr::Convert { operand, ty } => write!(f, "({}){}", ty, operand),
            Expr::Coalesce { left, right, .. } => write!(f, "({} ?? {})", left, right),
            Expr::ArrayLength { operand } => write!(f, "{}.Length", operand),
            Expr::Lambda { params, body } => {
                if params.len() == 1 {
                    write!(f, "{} => {}", params[0], body)
                } else {
                    write!(f, "({}) => {}", params.join(", "), body)
                }
            }
            Expr::New { fields, ty } => {
                match ty {
                    ExprType::Anonymous => write!(f, "new {{ ")?,
                    other => write!(f, "new {} {{ ", other)?,
                }
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", field.member.name, field.value)?;
                }
                write!(f, " }}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::*;
    use super::super::{Declaring, ExprType};

    #[test]
    fn test_render_query_chain() {
        let people = collection("people", "Person");
        let p = param("p", ExprType::entity("Person"));
        let q = people
            .filter(lambda(&["p"], p.member("Age", ExprType::Int).gt(int(25))))
            .order_by(lambda(&["p"], p.member("Name", ExprType::String)))
            .take(10);
        assert_eq!(
            q.to_string(),
            "people.Where(p => (p.Age > 25)).OrderBy(p => p.Name).Take(10)"
        );
    }

    #[test]
    fn test_render_static_and_new() {
        let p = param("p", ExprType::entity("Person"));
        let call = static_call(
            Declaring::String,
            "IsNullOrEmpty",
            vec![p.member("Name", ExprType::String)],
            ExprType::Bool,
        );
        assert_eq!(call.to_string(), "String.IsNullOrEmpty(p.Name)");

        let shape = new_object(vec![
            ("Name", p.member("Name", ExprType::String)),
            ("Double", p.member("Age", ExprType::Int).times(int(2))),
        ]);
        assert_eq!(shape.to_string(), "new { Name = p.Name, Double = (p.Age * 2) }");
        assert_eq!(
            p.member("Age", ExprType::Int).cast(ExprType::Double).to_string(),
            "(double)p.Age"
        );
    }
}
