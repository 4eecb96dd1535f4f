// ironlinq-core/src/translate/stages.rs
// Query operators → pipeline stages

use super::{is_identity, lambda_parts, Translator};
use crate::error::{LinqError, Result};
use crate::expr::{Declaring, Expr, ExprType, ID_FIELD};
use crate::pipeline::{
    always_false_filter, Envelope, FieldRef, ResultShape, Stage, StageKind,
    DISCRIMINATOR_FIELD, RESULT_FIELD,
};
use serde_json::{json, Map, Value};

/// Prefix of temporary sort-key fields
const SORT_KEY_PREFIX: &str = "__sort";

fn single_field(name: &str, value: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(name.to_string(), value);
    Value::Object(doc)
}

/// `{_id: null, _result_: <accumulator>}`
fn scalar_group(accumulator: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(ID_FIELD.to_string(), Value::Null);
    doc.insert(RESULT_FIELD.to_string(), accumulator);
    Value::Object(doc)
}

fn scalar_projection(value: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(ID_FIELD.to_string(), json!(0));
    doc.insert(RESULT_FIELD.to_string(), value);
    Value::Object(doc)
}

/// Exclusion-only projection dropping temporary sort keys
fn is_sort_cleanup(stage: &Stage) -> bool {
    stage.kind == StageKind::Project
        && stage.body.as_object().map_or(false, |o| {
            !o.is_empty() && o.keys().all(|k| k.starts_with(SORT_KEY_PREFIX))
        })
}

/// Constant count of Take/Skip; negative counts behave like zero
fn count_argument(arg: &Expr, method: &str) -> Result<i64> {
    arg.as_constant()
        .and_then(Value::as_i64)
        .map(|n| n.max(0))
        .ok_or_else(|| LinqError::unsupported(format!("{} with a non-constant count", method)))
}

impl Translator {
    /// Emit the stages of a query-operator chain, innermost operator first
    pub(crate) fn emit(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Collection { .. } => Ok(()),
            Expr::Call {
                declaring: Declaring::Queryable,
                method,
                args,
                ty,
                ..
            } => {
                let (source, rest) = args.split_first().ok_or_else(|| {
                    LinqError::contract(format!("query operator {} without a source", method))
                })?;
                self.emit(source)?;
                self.param_envelope = self.pipeline.envelope();
                self.emit_operator(method, rest, ty)
            }
            other => Err(LinqError::unsupported(format!(
                "{} as query source: {}",
                other.kind_name(),
                other
            ))),
        }
    }

    fn emit_operator(&mut self, method: &str, args: &[Expr], ty: &ExprType) -> Result<()> {
        match (method, args) {
            ("Where", [predicate]) => self.emit_where(predicate),
            ("Select", [selector]) => {
                let (params, body) = lambda_parts(selector, 1)?;
                self.emit_projection(params, body)
            }
            ("SelectMany", [selector]) => self.emit_select_many(selector, None),
            ("SelectMany", [selector, result]) => self.emit_select_many(selector, Some(result)),
            ("OrderBy", [key]) => self.emit_sort(key, 1, false),
            ("OrderByDescending", [key]) => self.emit_sort(key, -1, false),
            ("ThenBy", [key]) => self.emit_sort(key, 1, true),
            ("ThenByDescending", [key]) => self.emit_sort(key, -1, true),
            ("Take", [count]) => {
                let n = count_argument(count, method)?;
                if n == 0 {
                    self.pipeline
                        .push(Stage::new(StageKind::Match, always_false_filter()));
                } else {
                    self.pipeline.push(Stage::new(StageKind::Limit, json!(n)));
                }
                Ok(())
            }
            ("Skip", [count]) => {
                let n = count_argument(count, method)?;
                if n > 0 {
                    self.pipeline.push(Stage::new(StageKind::Skip, json!(n)));
                }
                Ok(())
            }
            ("GroupBy", [key]) => self.emit_group_by(key),
            ("Distinct", []) => self.emit_distinct(),
            ("Join", _) => self.emit_join(args),
            ("OfType", []) => self.emit_of_type(ty),
            ("Count" | "LongCount", [] | [_]) => {
                if let Some(predicate) = args.first() {
                    self.emit_where(predicate)?;
                }
                self.emit_count();
                self.pipeline.add_shape(ResultShape::AGGREGATE);
                Ok(())
            }
            ("Any", [] | [_]) => {
                if let Some(predicate) = args.first() {
                    self.emit_where(predicate)?;
                }
                self.pipeline.push(Stage::new(StageKind::Limit, json!(1)));
                self.emit_count();
                self.pipeline.add_shape(ResultShape::ANY);
                Ok(())
            }
            ("Sum" | "Min" | "Max" | "Average", [] | [_]) => {
                self.emit_aggregate(method, args.first())
            }
            ("First" | "FirstOrDefault" | "Single" | "SingleOrDefault", [] | [_]) => {
                if let Some(predicate) = args.first() {
                    self.emit_where(predicate)?;
                }
                let single = method.starts_with("Single");
                let limit = if single { 2 } else { 1 };
                self.pipeline.push(Stage::new(StageKind::Limit, json!(limit)));
                let mut shape = ResultShape::ONE_RESULT;
                shape |= if single {
                    ResultShape::SINGLE
                } else {
                    ResultShape::FIRST
                };
                if method.ends_with("OrDefault") {
                    shape |= ResultShape::OR_DEFAULT;
                }
                self.pipeline.add_shape(shape);
                Ok(())
            }
            _ => Err(LinqError::unsupported(format!(
                "method Queryable.{} with {} arguments",
                method,
                args.len()
            ))),
        }
    }

    fn emit_where(&mut self, predicate: &Expr) -> Result<()> {
        let (_, body) = lambda_parts(predicate, 1)?;
        if let Some(filter) = self.translate_filter(body)? {
            self.pipeline.push(Stage::new(StageKind::Match, filter));
        }
        Ok(())
    }

    /// Projection of a selector body; `params` lists parameters whose identity is a no-op
    pub(crate) fn emit_projection(&mut self, params: &[String], body: &Expr) -> Result<()> {
        if is_identity(params, body) {
            return Ok(());
        }
        match body {
            Expr::New { fields, .. } => {
                let mut doc = Map::new();
                for field in fields {
                    let value = self.project_value(&field.value)?;
                    doc.insert(field.member.field_name().to_string(), value);
                }
                if !doc.contains_key(ID_FIELD) {
                    doc.insert(ID_FIELD.to_string(), json!(0));
                }
                self.pipeline
                    .push(Stage::new(StageKind::Project, Value::Object(doc)));
                self.pipeline.set_envelope(Envelope::Document);
            }
            Expr::Parameter { ty, .. } if ty.is_document() => {
                match self.resolve_field(body)? {
                    FieldRef::Root => {}
                    other => {
                        self.pipeline.push(Stage::new(
                            StageKind::ReplaceRoot,
                            json!({ "newRoot": other.to_expression() }),
                        ));
                    }
                }
                self.pipeline.set_envelope(Envelope::Document);
            }
            other => {
                let value = self.project_value(other)?;
                self.pipeline
                    .push(Stage::new(StageKind::Project, scalar_projection(value)));
                self.pipeline.set_envelope(Envelope::Scalar);
            }
        }
        Ok(())
    }

    fn emit_select_many(&mut self, selector: &Expr, result: Option<&Expr>) -> Result<()> {
        let (_, body) = lambda_parts(selector, 1)?;

        // p => p.Pets.Select(x => ..)
        let (collection, nested) = match body {
            Expr::Call {
                declaring: Declaring::Enumerable,
                method,
                args,
                ..
            } if method == "Select" && args.len() == 2 => (&args[0], Some(&args[1])),
            other => (other, None),
        };
        let element_ty = collection.ty().element().cloned().unwrap_or(ExprType::Object);
        let path = match self.resolve_field(collection)? {
            FieldRef::Path(path) => path,
            other => {
                return Err(LinqError::unsupported(format!(
                    "SelectMany over computed collection {}",
                    other.to_expression()
                )))
            }
        };
        self.pipeline
            .push(Stage::new(StageKind::Unwind, json!(format!("${}", path))));

        let nested = match nested {
            Some(lambda) => {
                let (nested_params, nested_body) = lambda_parts(lambda, 1)?;
                if is_identity(nested_params, nested_body) {
                    None
                } else {
                    Some((nested_params[0].clone(), nested_body))
                }
            }
            None => None,
        };

        match (nested, result) {
            (None, None) => {
                if element_ty.is_document() {
                    self.pipeline.push(Stage::new(
                        StageKind::ReplaceRoot,
                        json!({ "newRoot": format!("${}", path) }),
                    ));
                    self.pipeline.set_envelope(Envelope::Document);
                } else {
                    if path != RESULT_FIELD {
                        self.pipeline.push(Stage::new(
                            StageKind::Project,
                            scalar_projection(json!(format!("${}", path))),
                        ));
                    }
                    self.pipeline.set_envelope(Envelope::Scalar);
                }
                Ok(())
            }
            (Some((element_param, nested_body)), None) => self.scoped(
                vec![(element_param, FieldRef::Path(path))],
                |t| t.emit_projection(&[], nested_body),
            ),
            (None, Some(result)) => {
                let (result_params, result_body) = lambda_parts(result, 2)?;
                let element_param = result_params[1].clone();
                let outer = result_params[..1].to_vec();
                self.scoped(vec![(element_param, FieldRef::Path(path))], |t| {
                    t.emit_projection(&outer, result_body)
                })
            }
            (Some(_), Some(_)) => Err(LinqError::unsupported(
                "SelectMany with both a nested projection and a result selector",
            )),
        }
    }

    fn emit_sort(&mut self, key: &Expr, direction: i64, then_by: bool) -> Result<()> {
        let (_, body) = lambda_parts(key, 1)?;
        let stored = if self.is_field_chain(body) {
            match self.resolve_field(body)? {
                FieldRef::Path(path) => Some(path),
                _ => None,
            }
        } else {
            None
        };
        let (field, computed) = match stored {
            Some(path) => (path, None),
            None => {
                let value = self.translate_value(body)?;
                (self.pipeline.temp_name(SORT_KEY_PREFIX), Some(value))
            }
        };
        let merge = |value: Value, field: &str| {
            Stage::new(
                StageKind::ReplaceRoot,
                json!({ "newRoot": { "$mergeObjects": ["$$ROOT", single_field(field, value)] } }),
            )
        };

        if !then_by {
            if let Some(value) = computed.clone() {
                self.pipeline.push(merge(value, &field));
            }
            self.pipeline.push(Stage::new(
                StageKind::Sort,
                single_field(&field, json!(direction)),
            ));
            if computed.is_some() {
                self.pipeline.push(Stage::new(
                    StageKind::Project,
                    single_field(&field, json!(0)),
                ));
            }
            return Ok(());
        }

        let sort_index = self
            .pipeline
            .last_index_of(StageKind::Sort)
            .ok_or_else(|| LinqError::contract("ThenBy without a preceding OrderBy"))?;
        {
            let sort = self.pipeline.stage_mut(sort_index)?.body_object_mut()?;
            if sort.contains_key(&field) {
                return Err(LinqError::unsupported(format!(
                    "ThenBy on field '{}' that is already sorted",
                    field
                )));
            }
            sort.insert(field.clone(), json!(direction));
        }
        if let Some(value) = computed {
            self.pipeline.insert(sort_index, merge(value, &field));
            let cleanup_index = sort_index + 2;
            let has_cleanup = self
                .pipeline
                .stages()
                .get(cleanup_index)
                .map_or(false, is_sort_cleanup);
            if has_cleanup {
                self.pipeline
                    .stage_mut(cleanup_index)?
                    .body_object_mut()?
                    .insert(field, json!(0));
            } else {
                self.pipeline.insert(
                    cleanup_index,
                    Stage::new(StageKind::Project, single_field(&field, json!(0))),
                );
            }
        }
        Ok(())
    }

    fn emit_group_by(&mut self, key: &Expr) -> Result<()> {
        let (params, body) = lambda_parts(key, 1)?;
        let id = if is_identity(params, body) {
            Value::String(self.unbound_param_expression())
        } else {
            self.translate_value(body)?
        };
        self.group_input = self.pipeline.envelope();
        let mut stage = Stage::new(StageKind::Group, single_field(ID_FIELD, id));
        stage.group_input = Some(self.group_input);
        self.pipeline.push(stage);
        self.pipeline.set_envelope(Envelope::Grouped);
        self.pipeline.add_shape(ResultShape::GROUPED);
        Ok(())
    }

    fn emit_distinct(&mut self) -> Result<()> {
        match self.pipeline.envelope() {
            Envelope::Scalar => {
                self.pipeline.push(Stage::new(
                    StageKind::Group,
                    single_field(ID_FIELD, json!(format!("${}", RESULT_FIELD))),
                ));
                self.pipeline.push(Stage::new(
                    StageKind::Project,
                    scalar_projection(json!(format!("${}", ID_FIELD))),
                ));
            }
            Envelope::Document => {
                self.pipeline.push(Stage::new(
                    StageKind::Group,
                    single_field(ID_FIELD, json!("$$ROOT")),
                ));
                self.pipeline.push(Stage::new(
                    StageKind::ReplaceRoot,
                    json!({ "newRoot": format!("${}", ID_FIELD) }),
                ));
            }
            Envelope::Grouped => return Err(LinqError::unsupported("Distinct over groupings")),
        }
        Ok(())
    }

    fn emit_of_type(&mut self, ty: &ExprType) -> Result<()> {
        let wanted = ty
            .element()
            .and_then(ExprType::entity_name)
            .ok_or_else(|| LinqError::contract(format!("OfType result {}", ty)))?;
        if self.root_type.entity_name() == Some(wanted) {
            return Ok(());
        }
        self.pipeline.push(Stage::new(
            StageKind::Match,
            single_field(DISCRIMINATOR_FIELD, json!(wanted)),
        ));
        Ok(())
    }

    fn emit_count(&mut self) {
        self.pipeline.push(Stage::new(
            StageKind::Group,
            scalar_group(json!({ "$sum": 1 })),
        ));
        self.pipeline.set_envelope(Envelope::Scalar);
    }

    fn emit_aggregate(&mut self, method: &str, selector: Option<&Expr>) -> Result<()> {
        let value = match selector {
            Some(selector) => {
                let (_, body) = lambda_parts(selector, 1)?;
                self.translate_value(body)?
            }
            None => Value::String(self.unbound_param_expression()),
        };
        let accumulator = match method {
            "Sum" => "$sum",
            "Min" => "$min",
            "Max" => "$max",
            _ => "$avg",
        };
        self.pipeline.push(Stage::new(
            StageKind::Group,
            scalar_group(single_field(accumulator, value)),
        ));
        self.pipeline.set_envelope(Envelope::Scalar);
        self.pipeline.add_shape(ResultShape::AGGREGATE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::translate;
    use crate::error::LinqError;
    use crate::expr::builder::*;
    use crate::expr::{Expr, ExprType};
    use crate::pipeline::{ResultShape, StageKind};
    use serde_json::json;

    fn people() -> Expr {
        collection("people", "Person")
    }

    fn p() -> Expr {
        param("p", ExprType::entity("Person"))
    }

    fn by(name: &str, ty: ExprType) -> Expr {
        lambda(&["p"], p().member(name, ty))
    }

    #[test]
    fn test_where_select_pipeline() {
        let q = people()
            .filter(lambda(&["p"], p().member("Age", ExprType::Int).gt(int(25))))
            .select(by("Name", ExprType::String));
        let q = translate(&q).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$match": {"Age": {"$gt": 25}}}),
                json!({"$project": {"_id": 0, "_result_": "$Name"}}),
            ]
        );
        assert_eq!(q.shape, ResultShape::ENUMERABLE);
    }

    #[test]
    fn test_order_skip_take_keep_call_order() {
        let q = people()
            .order_by(by("Name", ExprType::String))
            .skip(5)
            .take(10);
        let q = translate(&q).unwrap();
        assert_eq!(
            q.stage_kinds(),
            vec![StageKind::Sort, StageKind::Skip, StageKind::Limit]
        );
        assert_eq!(q.pipeline()[0], json!({"$sort": {"Name": 1}}));
    }

    #[test]
    fn test_then_by_extends_sort_and_rejects_repeats() {
        let q = people()
            .order_by(by("Name", ExprType::String))
            .then_by_descending(by("Age", ExprType::Int));
        let q = translate(&q).unwrap();
        assert_eq!(q.pipeline(), vec![json!({"$sort": {"Name": 1, "Age": -1}})]);

        let again = people()
            .order_by(by("Name", ExprType::String))
            .then_by(by("Name", ExprType::String));
        assert!(matches!(
            translate(&again).unwrap_err(),
            LinqError::Unsupported(_)
        ));
    }

    #[test]
    fn test_computed_sort_key_is_materialized_and_dropped() {
        let len = lambda(
            &["p"],
            p().member("Name", ExprType::String)
                .member("Length", ExprType::Int),
        );
        let q = translate(&people().order_by(len)).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$replaceRoot": {"newRoot": {"$mergeObjects": ["$$ROOT", {"__sort0": {"$strLenCP": "$Name"}}]}}}),
                json!({"$sort": {"__sort0": 1}}),
                json!({"$project": {"__sort0": 0}}),
            ]
        );

        let len = lambda(
            &["p"],
            p().member("Name", ExprType::String)
                .member("Length", ExprType::Int),
        );
        let q = translate(&people().order_by(by("Age", ExprType::Int)).then_by(len)).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$replaceRoot": {"newRoot": {"$mergeObjects": ["$$ROOT", {"__sort0": {"$strLenCP": "$Name"}}]}}}),
                json!({"$sort": {"Age": 1, "__sort0": 1}}),
                json!({"$project": {"__sort0": 0}}),
            ]
        );
    }

    #[test]
    fn test_anonymous_projection_suppresses_id() {
        let q = people().select(lambda(
            &["p"],
            new_object(vec![
                ("Name", p().member("Name", ExprType::String)),
                ("One", int(1)),
            ]),
        ));
        let q = translate(&q).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![json!({"$project": {"Name": "$Name", "One": {"$add": [1]}, "_id": 0}})]
        );

        let keep_id = people().select(lambda(
            &["p"],
            new_object(vec![("_id", p().id_member("Id", ExprType::ObjectId))]),
        ));
        let q = translate(&keep_id).unwrap();
        assert_eq!(q.pipeline(), vec![json!({"$project": {"_id": "$_id"}})]);
    }

    #[test]
    fn test_identity_select_is_noop() {
        let q = translate(&people().select(lambda(&["p"], p()))).unwrap();
        assert!(q.stages.is_empty());
    }

    #[test]
    fn test_distinct_per_envelope() {
        let q = translate(&people().distinct()).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$group": {"_id": "$$ROOT"}}),
                json!({"$replaceRoot": {"newRoot": "$_id"}}),
            ]
        );
        let q = translate(&people().select(by("Dept", ExprType::String)).distinct()).unwrap();
        assert_eq!(
            &q.pipeline()[1..],
            &[
                json!({"$group": {"_id": "$_result_"}}),
                json!({"$project": {"_id": 0, "_result_": "$_id"}}),
            ]
        );
    }

    #[test]
    fn test_count_any_and_aggregates() {
        let q = translate(&people().count()).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![json!({"$group": {"_id": null, "_result_": {"$sum": 1}}})]
        );
        assert!(q.shape.contains(ResultShape::AGGREGATE));

        let q = translate(&people().any_where(lambda(
            &["p"],
            p().member("Age", ExprType::Int).gt(int(60)),
        )))
        .unwrap();
        assert_eq!(
            q.stage_kinds(),
            vec![StageKind::Match, StageKind::Limit, StageKind::Group]
        );
        assert!(q.shape.contains(ResultShape::ANY));

        let q = translate(&people().sum(Some(by("Sal", ExprType::Int)))).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![json!({"$group": {"_id": null, "_result_": {"$sum": "$Sal"}}})]
        );
        let q = translate(&people().select(by("Sal", ExprType::Int)).max(None)).unwrap();
        assert_eq!(
            q.pipeline()[1],
            json!({"$group": {"_id": null, "_result_": {"$max": "$_result_"}}})
        );
    }

    #[test]
    fn test_element_operators_set_flags() {
        let q = translate(&people().first()).unwrap();
        assert_eq!(q.pipeline(), vec![json!({"$limit": 1})]);
        assert_eq!(q.shape, ResultShape::ONE_RESULT | ResultShape::FIRST);

        let q = translate(&people().single_or_default()).unwrap();
        assert_eq!(q.pipeline(), vec![json!({"$limit": 2})]);
        assert_eq!(
            q.shape,
            ResultShape::ONE_RESULT | ResultShape::SINGLE | ResultShape::OR_DEFAULT
        );
    }

    #[test]
    fn test_group_by_without_projection_collects_values() {
        let q = translate(&people().group_by(by("Dept", ExprType::String))).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![json!({"$group": {"_id": "$Dept", "values": {"$push": "$$ROOT"}}})]
        );
        assert!(q.shape.contains(ResultShape::GROUPED | ResultShape::ENUMERABLE));
    }

    #[test]
    fn test_composite_group_key() {
        let key = lambda(
            &["p"],
            new_object(vec![
                ("Dept", p().member("Dept", ExprType::String)),
                ("Site", p().member("Site", ExprType::String)),
            ]),
        );
        let q = translate(&people().group_by(key)).unwrap();
        assert_eq!(
            q.pipeline()[0]["$group"]["_id"],
            json!({"Dept": "$Dept", "Site": "$Site"})
        );
    }

    #[test]
    fn test_select_many_forms() {
        let pets = p().member("Pets", ExprType::array(ExprType::entity("Pet")));
        let q = translate(&people().select_many(lambda(&["p"], pets.clone()))).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$unwind": "$Pets"}),
                json!({"$replaceRoot": {"newRoot": "$Pets"}}),
            ]
        );

        let tags = p().member("Tags", ExprType::array(ExprType::String));
        let q = translate(&people().select_many(lambda(&["p"], tags))).unwrap();
        assert_eq!(
            q.pipeline(),
            vec![
                json!({"$unwind": "$Tags"}),
                json!({"$project": {"_id": 0, "_result_": "$Tags"}}),
            ]
        );

        let x = param("x", ExprType::entity("Pet"));
        let q = translate(&people().select_many_with(
            lambda(&["p"], pets),
            lambda(
                &["p", "x"],
                new_object(vec![
                    ("Owner", p().member("Name", ExprType::String)),
                    ("Pet", x.member("Name", ExprType::String)),
                ]),
            ),
        ))
        .unwrap();
        assert_eq!(
            q.pipeline()[1],
            json!({"$project": {"Owner": "$Name", "Pet": "$Pets.Name", "_id": 0}})
        );
    }

    #[test]
    fn test_select_many_identity_over_scalar_arrays() {
        let tags = by("Tags", ExprType::array(ExprType::String));
        let x = param("x", ExprType::array(ExprType::String));
        let q = people().select(tags).select_many(lambda(&["x"], x));
        let q = translate(&q).unwrap();
        assert_eq!(q.pipeline()[1], json!({"$unwind": "$_result_"}));
        assert_eq!(q.pipeline().len(), 2);
    }

    #[test]
    fn test_of_type() {
        let q = translate(&people().of_type("Person")).unwrap();
        assert!(q.stages.is_empty());
        let q = translate(&people().of_type("Employee")).unwrap();
        assert_eq!(q.pipeline(), vec![json!({"$match": {"_t": "Employee"}})]);
    }

    #[test]
    fn test_take_zero_and_unsupported_operator() {
        let q = translate(&people().take(0)).unwrap();
        assert!(q.is_always_empty());

        let reversed = static_call(
            crate::expr::Declaring::Queryable,
            "Reverse",
            vec![people()],
            ExprType::array(ExprType::entity("Person")),
        );
        let err = translate(&reversed).unwrap_err();
        assert!(err.to_string().contains("Reverse"));
    }
}
