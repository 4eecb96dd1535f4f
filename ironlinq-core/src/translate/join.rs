// ironlinq-core/src/translate/join.rs
// Join(inner, outerKey, innerKey, result) → $lookup + $unwind + projection

use super::{is_identity, lambda_parts, Translator};
use crate::error::{LinqError, Result};
use crate::expr::Expr;
use crate::pipeline::{Envelope, FieldRef, Stage, StageKind, JOINED_FIELD};
use serde_json::{json, Map, Value};

/// Key expressions of a join side: the fields of a composite `new { .. }` key, or the
/// key itself
fn key_parts(body: &Expr) -> Vec<&Expr> {
    match body {
        Expr::New { fields, .. } => fields.iter().map(|f| &f.value).collect(),
        other => vec![other],
    }
}

impl Translator {
    pub(crate) fn emit_join(&mut self, args: &[Expr]) -> Result<()> {
        let (inner, outer_key, inner_key, result) = match args {
            [inner, outer_key, inner_key, result] => (inner, outer_key, inner_key, result),
            _ => {
                return Err(LinqError::contract(format!(
                    "Join expects 4 arguments, got {}",
                    args.len()
                )))
            }
        };
        let from = match inner {
            Expr::Collection { name, .. } => name.clone(),
            other => {
                return Err(LinqError::contract(format!(
                    "join inner source must be a collection, found {}",
                    other.kind_name()
                )))
            }
        };

        let (_, outer_body) = lambda_parts(outer_key, 1)?;
        let (_, inner_body) = lambda_parts(inner_key, 1)?;
        let outer_keys = key_parts(outer_body);
        let inner_keys = key_parts(inner_body);
        if outer_keys.len() != inner_keys.len() {
            return Err(LinqError::contract(format!(
                "join key count mismatch: {} outer vs {} inner",
                outer_keys.len(),
                inner_keys.len()
            )));
        }

        let mut lets = Map::new();
        let mut conditions = Vec::with_capacity(outer_keys.len());
        for (outer, inner) in outer_keys.into_iter().zip(inner_keys) {
            let var = self.pipeline.temp_name("k");
            lets.insert(var.clone(), self.translate_value(outer)?);
            // inner keys read the looked-up document
            let inner_value =
                self.with_param_envelope(Envelope::Document, |t| t.translate_value(inner))?;
            conditions.push(json!({ "$eq": [inner_value, format!("$${}", var)] }));
        }
        let condition = if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            json!({ "$and": conditions })
        };

        self.pipeline.push(Stage::new(
            StageKind::Lookup,
            json!({
                "from": from,
                "let": Value::Object(lets),
                "pipeline": [{ "$match": { "$expr": condition } }],
                "as": JOINED_FIELD,
            }),
        ));
        // unmatched outer rows drop out here
        self.pipeline.push(Stage::new(
            StageKind::Unwind,
            json!(format!("${}", JOINED_FIELD)),
        ));

        let (params, body) = lambda_parts(result, 2)?;
        if is_identity(params, body) {
            let mut drop_joined = Map::new();
            drop_joined.insert(JOINED_FIELD.to_string(), json!(0));
            self.pipeline
                .push(Stage::new(StageKind::Project, Value::Object(drop_joined)));
            return Ok(());
        }
        let inner_param = params[1].clone();
        let outer_params = params[..1].to_vec();
        self.scoped(
            vec![(inner_param, FieldRef::Path(JOINED_FIELD.to_string()))],
            |t| t.emit_projection(&outer_params, body),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::translate;
    use crate::error::LinqError;
    use crate::expr::builder::*;
    use crate::expr::ExprType;
    use serde_json::json;

    fn sides() -> (crate::expr::Expr, crate::expr::Expr, crate::expr::Expr, crate::expr::Expr) {
        let people = collection("people", "Person");
        let depts = collection("depts", "Dept");
        let p = param("p", ExprType::entity("Person"));
        let d = param("d", ExprType::entity("Dept"));
        (people, depts, p, d)
    }

    #[test]
    fn test_join_emits_lookup_unwind_project() {
        let (people, depts, p, d) = sides();
        let q = people.join(
            depts,
            lambda(&["p"], p.member("DeptId", ExprType::Int)),
            lambda(&["d"], d.id_member("Id", ExprType::Int)),
            lambda(
                &["p", "d"],
                new_object(vec![
                    ("Name", p.member("Name", ExprType::String)),
                    ("Dept", d.member("Title", ExprType::String)),
                ]),
            ),
        );
        let q = translate(&q).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$lookup": {
                    "from": "depts",
                    "let": {"k0": "$DeptId"},
                    "pipeline": [{"$match": {"$expr": {"$eq": ["$_id", "$$k0"]}}}],
                    "as": "__JOINED__"
                }}),
                json!({"$unwind": "$__JOINED__"}),
                json!({"$project": {"Name": "$Name", "Dept": "$__JOINED__.Title", "_id": 0}}),
            ]
        );
    }

    #[test]
    fn test_join_selecting_inner_promotes_it() {
        let (people, depts, p, d) = sides();
        let q = people.join(
            depts,
            lambda(&["p"], p.member("DeptId", ExprType::Int)),
            lambda(&["d"], d.id_member("Id", ExprType::Int)),
            lambda(&["p", "d"], d.clone()),
        );
        let q = translate(&q).unwrap();
        assert_eq!(
            q.pipeline()[2],
            json!({"$replaceRoot": {"newRoot": "$__JOINED__"}})
        );
    }

    #[test]
    fn test_composite_keys_and_mismatch() {
        let (people, depts, p, d) = sides();
        let q = people.join(
            depts.clone(),
            lambda(
                &["p"],
                new_object(vec![
                    ("A", p.member("DeptId", ExprType::Int)),
                    ("B", p.member("Site", ExprType::String)),
                ]),
            ),
            lambda(
                &["d"],
                new_object(vec![
                    ("A", d.id_member("Id", ExprType::Int)),
                    ("B", d.member("Site", ExprType::String)),
                ]),
            ),
            lambda(&["p", "d"], p.clone()),
        );
        let q = translate(&q).unwrap();
        assert_eq!(
            q.pipeline()[0]["$lookup"]["pipeline"][0]["$match"]["$expr"],
            json!({"$and": [{"$eq": ["$_id", "$$k0"]}, {"$eq": ["$Site", "$$k1"]}]})
        );

        let bad = people.join(
            depts,
            lambda(&["p"], new_object(vec![("A", p.member("DeptId", ExprType::Int))])),
            lambda(
                &["d"],
                new_object(vec![
                    ("A", d.id_member("Id", ExprType::Int)),
                    ("B", d.member("Site", ExprType::String)),
                ]),
            ),
            lambda(&["p", "d"], p.clone()),
        );
        assert!(matches!(
            translate(&bad).unwrap_err(),
            LinqError::ContractViolation(_)
        ));
    }

    #[test]
    fn test_inner_must_be_collection() {
        let (people, depts, p, d) = sides();
        let q = people.join(
            depts.take(3),
            lambda(&["p"], p.member("DeptId", ExprType::Int)),
            lambda(&["d"], d.id_member("Id", ExprType::Int)),
            lambda(&["p", "d"], p.clone()),
        );
        assert!(matches!(
            translate(&q).unwrap_err(),
            LinqError::ContractViolation(_)
        ));
    }
}
