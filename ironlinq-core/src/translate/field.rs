// ironlinq-core/src/translate/field.rs
// Member chains → document field paths

use super::Translator;
use crate::error::{LinqError, Result};
use crate::expr::{Expr, ID_FIELD};
use crate::pipeline::{Envelope, FieldRef, RESULT_FIELD};

impl Translator {
    /// Location of an unbound lambda parameter: the scalar carrier or the document root
    fn unbound_param(&self) -> FieldRef {
        match self.param_envelope {
            Envelope::Scalar => FieldRef::Path(RESULT_FIELD.to_string()),
            Envelope::Document | Envelope::Grouped => FieldRef::Root,
        }
    }

    pub(crate) fn unbound_param_expression(&self) -> String {
        self.unbound_param().to_expression()
    }

    /// True if `expr` resolves to a stored field rather than a computed value
    pub(crate) fn is_field_chain(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Parameter { .. } => true,
            Expr::Convert { operand, ty } => {
                let from = operand.ty();
                let passthrough = (from.is_numeric() && ty.is_numeric())
                    || from.underlying() == ty.underlying();
                passthrough && self.is_field_chain(operand)
            }
            Expr::Member { target, member, .. } => {
                let target_ty = target.ty();
                if target_ty.is_grouping() {
                    member.name == "Key" && self.is_field_chain(target)
                } else if target_ty.is_nullable() && member.name == "Value" {
                    self.is_field_chain(target)
                } else if target_ty.is_document() {
                    self.is_field_chain(target)
                } else {
                    false
                }
            }
            Expr::Call { .. } => Self::is_grouping_aggregate(expr),
            _ => false,
        }
    }

    /// Resolve a member chain to where it lives.
    ///
    /// Naming: identifier members map to `_id`, then an explicit element name wins over
    /// the declared name. A group's `Key` is `_id`; aggregates over group members resolve
    /// to their accumulator field.
    pub(crate) fn resolve_field(&mut self, expr: &Expr) -> Result<FieldRef> {
        match expr {
            Expr::Parameter { name, .. } => Ok(self
                .pipeline
                .prefix_for(name)
                .cloned()
                .unwrap_or_else(|| self.unbound_param())),
            Expr::Convert { operand, .. } => self.resolve_field(operand),
            Expr::Member { target, member, .. } => {
                let target_ty = target.ty();
                if target_ty.is_date() {
                    return Err(LinqError::unsupported(format!(
                        "member {} of a DateTime value as a field reference",
                        member.name
                    )));
                }
                if target_ty.is_object_id() && member.name == "CreationTime" {
                    return self.resolve_field(target);
                }
                if target_ty.is_nullable() && member.name == "Value" {
                    return self.resolve_field(target);
                }
                if target_ty.is_grouping() {
                    if member.name != "Key" {
                        return Err(LinqError::unsupported(format!(
                            "member {} of a grouping",
                            member.name
                        )));
                    }
                    return Ok(self.resolve_field(target)?.child(ID_FIELD));
                }
                Ok(self.resolve_field(target)?.child(member.field_name()))
            }
            Expr::Call { .. } if Self::is_grouping_aggregate(expr) => {
                let field = self.grouping_aggregate(expr)?;
                Ok(FieldRef::Path(field))
            }
            other => Err(LinqError::unsupported(format!(
                "{} as a field reference: {}",
                other.kind_name(),
                other
            ))),
        }
    }

    /// Plain field path for the match dialect, `None` if `expr` is computed
    pub(crate) fn match_path(&mut self, expr: &Expr) -> Result<Option<String>> {
        if !self.is_field_chain(expr) {
            return Ok(None);
        }
        Ok(self.resolve_field(expr)?.as_path().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Translator;
    use crate::expr::builder::*;
    use crate::expr::{ExprType, MemberInfo};
    use crate::pipeline::{Envelope, FieldRef};

    fn person() -> crate::expr::Expr {
        param("p", ExprType::entity("Person"))
    }

    #[test]
    fn test_member_chain_paths() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        let city = person()
            .member("Address", ExprType::entity("Address"))
            .member("City", ExprType::String);
        assert_eq!(t.resolve_field(&city).unwrap(), FieldRef::Path("Address.City".into()));
    }

    #[test]
    fn test_identifier_and_alias_naming() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        let id = person().id_member("Key", ExprType::ObjectId);
        assert_eq!(t.resolve_field(&id).unwrap(), FieldRef::Path("_id".into()));
        let aliased = person().member_with(MemberInfo::aliased("Age", "age"), ExprType::Int);
        assert_eq!(t.resolve_field(&aliased).unwrap(), FieldRef::Path("age".into()));
    }

    #[test]
    fn test_bare_parameter_follows_envelope() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        assert_eq!(t.resolve_field(&person()).unwrap(), FieldRef::Root);
        t.param_envelope = Envelope::Scalar;
        let x = param("x", ExprType::Int);
        assert_eq!(t.resolve_field(&x).unwrap(), FieldRef::Path("_result_".into()));
        let a = param("a", ExprType::entity("Address"));
        assert_eq!(
            t.resolve_field(&a.member("City", ExprType::String)).unwrap(),
            FieldRef::Path("_result_.City".into())
        );
    }

    #[test]
    fn test_grouping_key_is_id() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        t.param_envelope = Envelope::Grouped;
        let g = param("g", ExprType::grouping(ExprType::String, ExprType::entity("Person")));
        let key = g.member("Key", ExprType::String);
        assert_eq!(t.resolve_field(&key).unwrap(), FieldRef::Path("_id".into()));
        assert_eq!(t.match_path(&key).unwrap(), Some("_id".into()));
    }

    #[test]
    fn test_date_member_rejected() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        let year = person()
            .member("Born", ExprType::DateTime)
            .member("Year", ExprType::Int);
        assert!(t.resolve_field(&year).is_err());
        assert_eq!(t.match_path(&year).unwrap(), None);
    }

    #[test]
    fn test_computed_members_are_not_paths() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        let len = person()
            .member("Name", ExprType::String)
            .member("Length", ExprType::Int);
        assert_eq!(t.match_path(&len).unwrap(), None);
    }

    #[test]
    fn test_numeric_cast_is_transparent() {
        let mut t = Translator::new("people", ExprType::entity("Person"));
        let age = person().member("Age", ExprType::Int).cast(ExprType::Double);
        assert_eq!(t.match_path(&age).unwrap(), Some("Age".into()));
    }
}
