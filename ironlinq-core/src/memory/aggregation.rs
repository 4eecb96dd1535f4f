// ironlinq-core/src/memory/aggregation.rs
// Aggregation pipeline implementation for the in-memory store

use super::expression::{fold_values, Evaluator, Variables};
use super::operators::matches_filter_with_vars;
use crate::error::{LinqError, Result};
use crate::options::QueryOptions;
use crate::value_utils::{
    canonical_json_string, compare_values_with_none, get_nested_value, remove_nested_value,
    resolve_path, set_nested_value, values_equal,
};
use ahash::AHashMap;
use serde_json::{Map, Value};
use std::time::Instant;

fn invalid(message: impl Into<String>) -> LinqError {
    LinqError::Store(message.into())
}

/// Read access to sibling collections, used by `$lookup`
pub trait CollectionSource: Send + Sync {
    fn snapshot(&self, collection: &str) -> Vec<Value>;
}

/// Per-execution state shared by every stage
pub struct ExecutionContext<'a> {
    source: &'a dyn CollectionSource,
    vars: Variables,
    options: &'a QueryOptions,
    started: Instant,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(source: &'a dyn CollectionSource, options: &'a QueryOptions) -> Self {
        ExecutionContext {
            source,
            vars: Variables::new(),
            options,
            started: Instant::now(),
        }
    }

    fn nested(&self, vars: Variables) -> ExecutionContext<'a> {
        ExecutionContext {
            source: self.source,
            vars,
            options: self.options,
            started: self.started,
        }
    }

    /// Fails once the caller cancelled or the time limit ran out
    fn checkpoint(&self) -> Result<()> {
        if self.options.is_cancelled() {
            return Err(LinqError::Cancelled);
        }
        match self.options.max_time {
            Some(limit) if self.started.elapsed() > limit => {
                Err(invalid("operation exceeded time limit"))
            }
            _ => Ok(()),
        }
    }
}

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    Group(GroupStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
    Unwind(UnwindStage),
    ReplaceRoot(ReplaceRootStage),
    Lookup(LookupStage),
}

/// $match stage - filter documents
#[derive(Debug, Clone)]
pub struct MatchStage {
    filter: Value,
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    exclude_id: bool,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Value),
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Value,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub struct Accumulator {
    op: AccumulatorOp,
    expr: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

/// $sort stage - sort documents
#[derive(Debug, Clone)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

#[derive(Debug, Clone, Copy)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// $limit stage - limit number of documents
#[derive(Debug, Clone)]
pub struct LimitStage {
    limit: usize,
}

/// $skip stage - skip documents
#[derive(Debug, Clone)]
pub struct SkipStage {
    skip: usize,
}

/// $unwind stage - one output document per array element
#[derive(Debug, Clone)]
pub struct UnwindStage {
    path: String,
    preserve_empty: bool,
}

/// $replaceRoot / $replaceWith stage
#[derive(Debug, Clone)]
pub struct ReplaceRootStage {
    new_root: Value,
}

/// $lookup stage, in equality or correlated sub-pipeline form
#[derive(Debug, Clone)]
pub struct LookupStage {
    from: String,
    target: String,
    join: LookupJoin,
}

#[derive(Debug, Clone)]
pub enum LookupJoin {
    Equality {
        local_field: String,
        foreign_field: String,
    },
    Correlated {
        bindings: Vec<(String, Value)>,
        pipeline: Pipeline,
    },
}

fn count_argument(spec: &Value, stage: &str) -> Result<usize> {
    spec.as_u64()
        .or_else(|| {
            spec.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        })
        .map(|n| n as usize)
        .ok_or_else(|| invalid(format!("{} must be a non-negative integer", stage)))
}

fn field_path<'v>(value: &'v Value, stage: &str) -> Result<&'v str> {
    match value.as_str() {
        Some(s) if s.starts_with('$') => Ok(&s[1..]),
        _ => Err(invalid(format!("{} path must be a field reference starting with $", stage))),
    }
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        match pipeline_json {
            Value::Array(stages) => Self::from_stages(stages),
            _ => Err(invalid("Pipeline must be an array")),
        }
    }

    pub fn from_stages(stages: &[Value]) -> Result<Self> {
        let stages = stages
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Execute pipeline on documents
    pub fn execute(&self, mut docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        for stage in &self.stages {
            ctx.checkpoint()?;
            docs = stage.execute(docs, ctx)?;
        }
        Ok(docs)
    }
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &Value) -> Result<Self> {
        let obj = stage_json
            .as_object()
            .ok_or_else(|| invalid("Stage must be an object"))?;
        let (stage_name, spec) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => return Err(invalid("Each stage must have exactly one operator")),
        };

        match stage_name.as_str() {
            "$match" => Ok(Stage::Match(MatchStage::from_json(spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::from_json(spec)?)),
            "$limit" => {
                let limit = count_argument(spec, "$limit")?;
                if limit == 0 {
                    return Err(invalid("the limit must be positive"));
                }
                Ok(Stage::Limit(LimitStage { limit }))
            }
            "$skip" => Ok(Stage::Skip(SkipStage {
                skip: count_argument(spec, "$skip")?,
            })),
            "$unwind" => Ok(Stage::Unwind(UnwindStage::from_json(spec)?)),
            "$replaceRoot" => {
                let new_root = spec
                    .get("newRoot")
                    .cloned()
                    .ok_or_else(|| invalid("$replaceRoot requires 'newRoot'"))?;
                Ok(Stage::ReplaceRoot(ReplaceRootStage { new_root }))
            }
            "$replaceWith" => Ok(Stage::ReplaceRoot(ReplaceRootStage {
                new_root: spec.clone(),
            })),
            "$lookup" => Ok(Stage::Lookup(LookupStage::from_json(spec)?)),
            _ => Err(invalid(format!(
                "Unrecognized pipeline stage name: '{}'",
                stage_name
            ))),
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        match self {
            Stage::Match(stage) => stage.execute(docs, ctx),
            Stage::Project(stage) => stage.execute(docs, ctx),
            Stage::Group(stage) => stage.execute(docs, ctx),
            Stage::Sort(stage) => Ok(stage.execute(docs)),
            Stage::Limit(stage) => Ok(docs.into_iter().take(stage.limit).collect()),
            Stage::Skip(stage) => Ok(docs.into_iter().skip(stage.skip).collect()),
            Stage::Unwind(stage) => Ok(stage.execute(docs)),
            Stage::ReplaceRoot(stage) => stage.execute(docs, ctx),
            Stage::Lookup(stage) => stage.execute(docs, ctx),
        }
    }
}

impl MatchStage {
    fn from_json(spec: &Value) -> Result<Self> {
        if !spec.is_object() {
            return Err(invalid("the match filter must be an expression in an object"));
        }
        Ok(MatchStage {
            filter: spec.clone(),
        })
    }

    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            if matches_filter_with_vars(&doc, &self.filter, &ctx.vars)? {
                results.push(doc);
            }
        }
        Ok(results)
    }
}

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| invalid("$project specification must be an object"))?;

        let mut fields = Vec::with_capacity(obj.len());
        let mut exclude_id = false;
        for (field, value) in obj {
            let action = match value {
                Value::Bool(true) => ProjectField::Include,
                Value::Bool(false) => ProjectField::Exclude,
                Value::Number(n) if n.as_f64() == Some(0.0) => ProjectField::Exclude,
                Value::Number(_) => ProjectField::Include,
                other => ProjectField::Computed(other.clone()),
            };
            if field == "_id" && matches!(action, ProjectField::Exclude) {
                exclude_id = true;
                continue;
            }
            fields.push((field.clone(), action));
        }

        let excludes = fields
            .iter()
            .any(|(_, action)| matches!(action, ProjectField::Exclude));
        let includes = fields
            .iter()
            .any(|(_, action)| !matches!(action, ProjectField::Exclude));
        if excludes && includes {
            return Err(invalid(
                "Invalid $project: cannot mix field exclusion with inclusion or computed fields",
            ));
        }

        Ok(ProjectStage { fields, exclude_id })
    }

    fn is_exclusion(&self) -> bool {
        self.fields
            .iter()
            .all(|(_, action)| matches!(action, ProjectField::Exclude))
    }

    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        docs.iter()
            .map(|doc| self.project_document(doc, ctx))
            .collect()
    }

    fn project_document(&self, doc: &Value, ctx: &ExecutionContext) -> Result<Value> {
        if self.is_exclusion() {
            let mut result = doc.clone();
            for (field, _) in &self.fields {
                remove_nested_value(&mut result, field);
            }
            if self.exclude_id {
                remove_nested_value(&mut result, "_id");
            }
            return Ok(result);
        }

        let mut result = Value::Object(Map::new());
        if !self.exclude_id && !self.fields.iter().any(|(f, _)| f == "_id") {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut result, "_id", id.clone());
            }
        }

        let evaluator = Evaluator::with_vars(doc, ctx.vars.clone());
        for (field, action) in &self.fields {
            match action {
                ProjectField::Include => {
                    if let Some(value) = resolve_path(doc, field) {
                        set_nested_value(&mut result, field, value);
                    }
                }
                // a bare path to a missing field leaves the output field out
                ProjectField::Computed(Value::String(path))
                    if path.starts_with('$') && !path.starts_with("$$") =>
                {
                    if let Some(value) = resolve_path(doc, &path[1..]) {
                        set_nested_value(&mut result, field, value);
                    }
                }
                ProjectField::Computed(expr) => {
                    set_nested_value(&mut result, field, evaluator.evaluate(expr)?);
                }
                ProjectField::Exclude => {}
            }
        }
        Ok(result)
    }
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| invalid("a group's fields must be specified in an object"))?;
        let id = obj
            .get("_id")
            .cloned()
            .ok_or_else(|| invalid("a group specification must include an _id"))?;

        let mut accumulators = Vec::new();
        for (field, value) in obj {
            if field == "_id" {
                continue;
            }
            accumulators.push((field.clone(), Accumulator::from_json(field, value)?));
        }

        Ok(GroupStage { id, accumulators })
    }

    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        // Step 1: Group documents by _id expression, in first-seen order
        let mut index: AHashMap<String, usize> = AHashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

        for doc in docs {
            let key = Evaluator::with_vars(&doc, ctx.vars.clone()).evaluate(&self.id)?;
            let canonical = canonical_json_string(&key);
            let slot = match index.get(&canonical) {
                Some(&slot) => slot,
                None => {
                    index.insert(canonical, groups.len());
                    groups.push((key, Vec::new()));
                    groups.len() - 1
                }
            };
            groups[slot].1.push(doc);
        }

        // Step 2: Compute accumulators for each group
        let mut results = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let mut result = Map::new();
            result.insert("_id".to_string(), key);
            for (field, accumulator) in &self.accumulators {
                result.insert(field.clone(), accumulator.compute(&members, ctx)?);
            }
            results.push(Value::Object(result));
        }
        Ok(results)
    }
}

impl Accumulator {
    fn from_json(field: &str, spec: &Value) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            invalid(format!("The field '{}' must be an accumulator object", field))
        })?;
        let (op, expr) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => {
                return Err(invalid(format!(
                    "The field '{}' must specify one accumulator",
                    field
                )))
            }
        };
        let op = match op.as_str() {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            other => return Err(invalid(format!("unknown group operator '{}'", other))),
        };
        Ok(Accumulator {
            op,
            expr: expr.clone(),
        })
    }

    fn compute(&self, docs: &[Value], ctx: &ExecutionContext) -> Result<Value> {
        let values = docs
            .iter()
            .map(|doc| Evaluator::with_vars(doc, ctx.vars.clone()).evaluate(&self.expr))
            .collect::<Result<Vec<_>>>()?;

        Ok(match self.op {
            AccumulatorOp::Sum => fold_values("$sum", &values),
            AccumulatorOp::Avg => fold_values("$avg", &values),
            AccumulatorOp::Min => fold_values("$min", &values),
            AccumulatorOp::Max => fold_values("$max", &values),
            AccumulatorOp::First => values.into_iter().next().unwrap_or(Value::Null),
            AccumulatorOp::Last => values.into_iter().last().unwrap_or(Value::Null),
            AccumulatorOp::Push => Value::Array(values),
            AccumulatorOp::AddToSet => {
                let mut seen = AHashMap::new();
                let mut unique = Vec::new();
                for value in values {
                    if seen.insert(canonical_json_string(&value), ()).is_none() {
                        unique.push(value);
                    }
                }
                Value::Array(unique)
            }
        })
    }
}

impl SortStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| invalid("the $sort key specification must be an object"))?;
        if obj.is_empty() {
            return Err(invalid("$sort stage must have at least one sort key"));
        }
        let mut fields = Vec::with_capacity(obj.len());
        for (field, direction) in obj {
            let direction = match direction.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => {
                    return Err(invalid(format!(
                        "$sort key ordering must be 1 (for ascending) or -1 (for descending): {}",
                        field
                    )))
                }
            };
            fields.push((field.clone(), direction));
        }
        Ok(SortStage { fields })
    }

    fn execute(&self, mut docs: Vec<Value>) -> Vec<Value> {
        // sort_by is stable, so ties keep their input order
        docs.sort_by(|a, b| {
            for (field, direction) in &self.fields {
                let ord = compare_values_with_none(
                    get_nested_value(a, field),
                    get_nested_value(b, field),
                );
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        docs
    }
}

impl UnwindStage {
    fn from_json(spec: &Value) -> Result<Self> {
        match spec {
            Value::String(_) => Ok(UnwindStage {
                path: field_path(spec, "$unwind")?.to_string(),
                preserve_empty: false,
            }),
            Value::Object(obj) => {
                let path = obj
                    .get("path")
                    .ok_or_else(|| invalid("no path specified to $unwind stage"))?;
                Ok(UnwindStage {
                    path: field_path(path, "$unwind")?.to_string(),
                    preserve_empty: obj
                        .get("preserveNullAndEmptyArrays")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            }
            _ => Err(invalid("expected either a string or an object as specification for $unwind stage")),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            match get_nested_value(&doc, &self.path).cloned() {
                Some(Value::Array(items)) if !items.is_empty() => {
                    for item in items {
                        let mut unwound = doc.clone();
                        set_nested_value(&mut unwound, &self.path, item);
                        results.push(unwound);
                    }
                }
                Some(Value::Array(_)) | Some(Value::Null) | None => {
                    if self.preserve_empty {
                        let mut kept = doc;
                        remove_nested_value(&mut kept, &self.path);
                        results.push(kept);
                    }
                }
                // a non-array value is treated as a single-element array
                Some(_) => results.push(doc),
            }
        }
        results
    }
}

impl ReplaceRootStage {
    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        docs.iter()
            .map(|doc| {
                match Evaluator::with_vars(doc, ctx.vars.clone()).evaluate(&self.new_root)? {
                    root @ Value::Object(_) => Ok(root),
                    other => Err(invalid(format!(
                        "'newRoot' expression must evaluate to an object, but resulting value was: {}",
                        other
                    ))),
                }
            })
            .collect()
    }
}

impl LookupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let text = |name: &str| -> Result<String> {
            spec.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("$lookup requires a string '{}'", name)))
        };
        let from = text("from")?;
        let target = text("as")?;

        let join = match spec.get("pipeline") {
            Some(pipeline) => {
                let bindings = match spec.get("let") {
                    Some(Value::Object(vars)) => {
                        vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    Some(_) => return Err(invalid("$lookup 'let' must be an object")),
                    None => Vec::new(),
                };
                LookupJoin::Correlated {
                    bindings,
                    pipeline: Pipeline::from_json(pipeline)?,
                }
            }
            None => LookupJoin::Equality {
                local_field: text("localField")?,
                foreign_field: text("foreignField")?,
            },
        };

        Ok(LookupStage { from, target, join })
    }

    fn execute(&self, docs: Vec<Value>, ctx: &ExecutionContext) -> Result<Vec<Value>> {
        let foreign = ctx.source.snapshot(&self.from);
        let mut results = Vec::with_capacity(docs.len());

        for mut doc in docs {
            ctx.checkpoint()?;
            let joined: Vec<Value> = match &self.join {
                LookupJoin::Equality {
                    local_field,
                    foreign_field,
                } => {
                    let local = resolve_path(&doc, local_field).unwrap_or(Value::Null);
                    foreign
                        .iter()
                        .filter(|candidate| {
                            let theirs =
                                resolve_path(candidate, foreign_field).unwrap_or(Value::Null);
                            lookup_keys_match(&local, &theirs)
                        })
                        .cloned()
                        .collect()
                }
                LookupJoin::Correlated { bindings, pipeline } => {
                    let evaluator = Evaluator::with_vars(&doc, ctx.vars.clone());
                    let mut vars = ctx.vars.clone();
                    for (name, expr) in bindings {
                        vars.insert(name.clone(), evaluator.evaluate(expr)?);
                    }
                    pipeline.execute(foreign.clone(), &ctx.nested(vars))?
                }
            };
            set_nested_value(&mut doc, &self.target, Value::Array(joined));
            results.push(doc);
        }
        Ok(results)
    }
}

/// Equality lookup: a local array matches when any element matches
fn lookup_keys_match(local: &Value, foreign: &Value) -> bool {
    match (local, foreign) {
        (Value::Array(items), other) => items.iter().any(|item| lookup_keys_match(item, other)),
        (item, Value::Array(items)) => items.iter().any(|other| values_equal(item, other)),
        (a, b) => values_equal(a, b),
    }
}
