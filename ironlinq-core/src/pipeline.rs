// ironlinq-core/src/pipeline.rs
//! Pipeline under construction
//!
//! The [`PipelineBuilder`] is the single piece of mutable state threaded through a
//! translation: the ordered stage list, the result-shape flags, the current envelope,
//! the temp-name counter and the sub-query parameter scopes.

use crate::error::{LinqError, Result};
use ahash::AHashMap;
use bitflags::bitflags;
use serde_json::{Map, Value};
use std::fmt;

/// Reserved field carrying a scalar result
pub const RESULT_FIELD: &str = "_result_";
/// Reserved field carrying the joined inner document
pub const JOINED_FIELD: &str = "__JOINED__";
/// Reserved accumulator collecting group members
pub const VALUES_FIELD: &str = "values";
/// Type discriminator written by polymorphic documents
pub const DISCRIMINATOR_FIELD: &str = "_t";
/// Field no document ever has
pub const NO_SUCH_FIELD: &str = "__NO_SUCH_FIELD__";

/// Filter matching no document: `{"__NO_SUCH_FIELD__": {"$exists": true}}`
pub fn always_false_filter() -> Value {
    let mut exists = Map::new();
    exists.insert("$exists".to_string(), Value::Bool(true));
    let mut filter = Map::new();
    filter.insert(NO_SUCH_FIELD.to_string(), Value::Object(exists));
    Value::Object(filter)
}

pub fn is_always_false_filter(filter: &Value) -> bool {
    filter == &always_false_filter()
}

// ============================================================================
// STAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Project,
    Group,
    Sort,
    Skip,
    Limit,
    Unwind,
    ReplaceRoot,
    Lookup,
}

impl StageKind {
    pub fn operator(&self) -> &'static str {
        match self {
            StageKind::Match => "$match",
            StageKind::Project => "$project",
            StageKind::Group => "$group",
            StageKind::Sort => "$sort",
            StageKind::Skip => "$skip",
            StageKind::Limit => "$limit",
            StageKind::Unwind => "$unwind",
            StageKind::ReplaceRoot => "$replaceRoot",
            StageKind::Lookup => "$lookup",
        }
    }

    pub fn from_operator(op: &str) -> Option<StageKind> {
        Some(match op {
            "$match" => StageKind::Match,
            "$project" => StageKind::Project,
            "$group" => StageKind::Group,
            "$sort" => StageKind::Sort,
            "$skip" => StageKind::Skip,
            "$limit" => StageKind::Limit,
            "$unwind" => StageKind::Unwind,
            "$replaceRoot" => StageKind::ReplaceRoot,
            "$lookup" => StageKind::Lookup,
            _ => return None,
        })
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operator())
    }
}

/// One pipeline stage: operator kind plus its body document
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub body: Value,
    /// Set on the group stage of a group-by to the envelope of the rows it groups; that
    /// stage receives the member accumulator if the query ends in the grouped envelope
    pub group_input: Option<Envelope>,
}

impl Stage {
    pub fn new(kind: StageKind, body: Value) -> Self {
        Stage {
            kind,
            body,
            group_input: None,
        }
    }

    /// `{ "<operator>": body }`
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(self.kind.operator().to_string(), self.body.clone());
        Value::Object(doc)
    }

    /// Body as an object, for stages that accumulate fields ($group, $project, $sort)
    pub fn body_object_mut(&mut self) -> Result<&mut Map<String, Value>> {
        let kind = self.kind;
        self.body
            .as_object_mut()
            .ok_or_else(|| LinqError::contract(format!("{} stage body is not a document", kind)))
    }
}

bitflags! {
    /// How the caller expects the pipeline's rows to be turned into a result.
    ///
    /// Flags accumulate monotonically while stages are emitted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResultShape: u16 {
        const ENUMERABLE = 1 << 0;
        /// A single accumulated scalar in `_result_`
        const AGGREGATE = 1 << 1;
        const GROUPED = 1 << 2;
        /// One element taken from an enumerable (first/single family)
        const ONE_RESULT = 1 << 3;
        const OR_DEFAULT = 1 << 4;
        const FIRST = 1 << 5;
        const SINGLE = 1 << 6;
        /// Existence check
        const ANY = 1 << 7;
    }
}

/// What the rows currently flowing out of the pipeline look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// Whole documents (entities or projected objects)
    Document,
    /// `{_result_: value}` wrappers
    Scalar,
    /// Group stage output: `{_id: key, ...accumulators}`
    Grouped,
}

/// Where a lambda parameter's fields live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    /// The current document itself (`$$ROOT`)
    Root,
    /// Dotted path in the current document, without the leading `$`
    Path(String),
    /// Variable bound by an array operator, without the leading `$$`
    Variable(String),
}

impl FieldRef {
    pub fn child(&self, name: &str) -> FieldRef {
        match self {
            FieldRef::Root => FieldRef::Path(name.to_string()),
            FieldRef::Path(path) => FieldRef::Path(format!("{}.{}", path, name)),
            FieldRef::Variable(var) => FieldRef::Variable(format!("{}.{}", var, name)),
        }
    }

    /// Aggregation-expression text: `$path`, `$$var` or `$$ROOT`
    pub fn to_expression(&self) -> String {
        match self {
            FieldRef::Root => "$$ROOT".to_string(),
            FieldRef::Path(path) => format!("${}", path),
            FieldRef::Variable(var) => format!("$${}", var),
        }
    }

    /// Path usable as a filter key in the match dialect
    pub fn as_path(&self) -> Option<&str> {
        match self {
            FieldRef::Path(path) => Some(path),
            _ => None,
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Debug)]
pub struct PipelineBuilder {
    collection: String,
    stages: Vec<Stage>,
    shape: ResultShape,
    envelope: Envelope,
    counter: usize,
    scopes: AHashMap<String, FieldRef>,
}

impl PipelineBuilder {
    pub fn new(collection: &str) -> Self {
        PipelineBuilder {
            collection: collection.to_string(),
            stages: Vec::new(),
            shape: ResultShape::empty(),
            envelope: Envelope::Document,
            counter: 0,
            scopes: AHashMap::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn push(&mut self, stage: Stage) -> usize {
        crate::log_trace!("emit {}", stage.to_document());
        self.stages.push(stage);
        self.stages.len() - 1
    }

    pub fn insert(&mut self, index: usize, stage: Stage) {
        crate::log_trace!("emit {} at {}", stage.to_document(), index);
        self.stages.insert(index, stage);
    }

    pub fn last_index_of(&self, kind: StageKind) -> Option<usize> {
        self.stages.iter().rposition(|s| s.kind == kind)
    }

    pub fn last_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    pub fn stage_mut(&mut self, index: usize) -> Result<&mut Stage> {
        self.stages
            .get_mut(index)
            .ok_or_else(|| LinqError::contract(format!("no stage at index {}", index)))
    }

    /// Most recently emitted stage of `kind`
    pub fn last_stage_mut(&mut self, kind: StageKind) -> Result<&mut Stage> {
        let index = self
            .last_index_of(kind)
            .ok_or_else(|| LinqError::contract(format!("no {} stage in pipeline", kind)))?;
        self.stage_mut(index)
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    pub fn add_shape(&mut self, flags: ResultShape) {
        self.shape |= flags;
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    pub fn set_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }

    /// Fresh name `<prefix><n>`, unique within this pipeline
    pub fn temp_name(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.counter);
        self.counter += 1;
        name
    }

    pub fn prefix_for(&self, param: &str) -> Option<&FieldRef> {
        self.scopes.get(param)
    }

    /// Bind `param` to `prefix`, returning the binding it shadows
    pub fn bind(&mut self, param: &str, prefix: FieldRef) -> Option<FieldRef> {
        self.scopes.insert(param.to_string(), prefix)
    }

    /// Undo a [`bind`](Self::bind)
    pub fn restore(&mut self, param: &str, previous: Option<FieldRef>) {
        match previous {
            Some(prefix) => {
                self.scopes.insert(param.to_string(), prefix);
            }
            None => {
                self.scopes.remove(param);
            }
        }
    }

    /// Seal the pipeline.
    ///
    /// A pipeline still in the grouped envelope gets the `values` member accumulator
    /// added to its group-by stage, and a shape with no terminal flag is enumerable.
    pub fn finish(mut self) -> Result<TranslatedQuery> {
        if self.envelope == Envelope::Grouped {
            let index = self
                .stages
                .iter()
                .rposition(|s| s.kind == StageKind::Group && s.group_input.is_some())
                .ok_or_else(|| LinqError::contract("grouped result without a group stage"))?;
            let stage = self.stage_mut(index)?;
            let member = match stage.group_input {
                Some(Envelope::Scalar) => format!("${}", RESULT_FIELD),
                _ => "$$ROOT".to_string(),
            };
            stage.body_object_mut()?.insert(
                VALUES_FIELD.to_string(),
                serde_json::json!({ "$push": member }),
            );
        }
        let terminal = ResultShape::AGGREGATE | ResultShape::ONE_RESULT | ResultShape::ANY;
        if !self.shape.intersects(terminal) {
            self.shape |= ResultShape::ENUMERABLE;
        }
        Ok(TranslatedQuery {
            collection: self.collection,
            stages: self.stages,
            shape: self.shape,
        })
    }
}

// ============================================================================
// RESULT
// ============================================================================

/// Output of translation: target collection, stage list and result shape
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    pub collection: String,
    pub stages: Vec<Stage>,
    pub shape: ResultShape,
}

impl TranslatedQuery {
    /// Stage documents, ready for an aggregate command
    pub fn pipeline(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.pipeline())
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// True if some match stage can never pass a document
    pub fn is_always_empty(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.kind == StageKind::Match && is_always_false_filter(&s.body))
    }
}

impl fmt::Display for TranslatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.aggregate({})", self.collection, self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_temp_names_are_unique() {
        let mut b = PipelineBuilder::new("people");
        let a = b.temp_name("_agg");
        let c = b.temp_name("_agg");
        assert_ne!(a, c);
        assert_eq!(a, "_agg0");
    }

    #[test]
    fn test_bind_and_restore_scopes() {
        let mut b = PipelineBuilder::new("people");
        let prev = b.bind("x", FieldRef::Path("Pets".into()));
        assert!(prev.is_none());
        let shadowed = b.bind("x", FieldRef::Variable("v0".into()));
        assert_eq!(shadowed, Some(FieldRef::Path("Pets".into())));
        b.restore("x", shadowed);
        assert_eq!(b.prefix_for("x"), Some(&FieldRef::Path("Pets".into())));
        b.restore("x", prev);
        assert!(b.prefix_for("x").is_none());
    }

    #[test]
    fn test_last_stage_mut_missing_is_contract_error() {
        let mut b = PipelineBuilder::new("people");
        b.push(Stage::new(StageKind::Match, json!({})));
        let err = b.last_stage_mut(StageKind::Group).unwrap_err();
        assert!(matches!(err, LinqError::ContractViolation(_)));
    }

    #[test]
    fn test_finish_injects_values_in_grouped_envelope() {
        let mut b = PipelineBuilder::new("people");
        let mut group = Stage::new(StageKind::Group, json!({"_id": "$Dept"}));
        group.group_input = Some(Envelope::Document);
        b.push(group);
        b.set_envelope(Envelope::Grouped);
        b.add_shape(ResultShape::GROUPED);
        let q = b.finish().unwrap();
        assert_eq!(
            q.pipeline(),
            vec![json!({"$group": {"_id": "$Dept", "values": {"$push": "$$ROOT"}}})]
        );
        assert!(q.shape.contains(ResultShape::ENUMERABLE | ResultShape::GROUPED));
    }

    #[test]
    fn test_finish_pushes_scalar_payload_for_scalar_groups() {
        let mut b = PipelineBuilder::new("people");
        b.push(Stage::new(StageKind::Project, json!({"_id": 0, "_result_": "$Dept"})));
        let mut group = Stage::new(StageKind::Group, json!({"_id": "$_result_"}));
        group.group_input = Some(Envelope::Scalar);
        b.push(group);
        b.set_envelope(Envelope::Grouped);
        b.add_shape(ResultShape::GROUPED);
        let q = b.finish().unwrap();
        assert_eq!(
            q.pipeline()[1],
            json!({"$group": {"_id": "$_result_", "values": {"$push": "$_result_"}}})
        );
    }

    #[test]
    fn test_finish_leaves_terminal_shapes_alone() {
        let mut b = PipelineBuilder::new("people");
        b.add_shape(ResultShape::AGGREGATE);
        let q = b.finish().unwrap();
        assert_eq!(q.shape, ResultShape::AGGREGATE);
    }

    #[test]
    fn test_field_ref_rendering() {
        assert_eq!(FieldRef::Root.child("Name").to_expression(), "$Name");
        assert_eq!(
            FieldRef::Variable("v0".into()).child("Age").to_expression(),
            "$$v0.Age"
        );
        assert_eq!(FieldRef::Root.to_expression(), "$$ROOT");
        assert!(FieldRef::Variable("v0".into()).as_path().is_none());
    }

    #[test]
    fn test_always_false_detection() {
        let mut b = PipelineBuilder::new("people");
        b.push(Stage::new(StageKind::Match, always_false_filter()));
        let q = b.finish().unwrap();
        assert!(q.is_always_empty());
        assert_eq!(
            q.pipeline()[0],
            json!({"$match": {"__NO_SUCH_FIELD__": {"$exists": true}}})
        );
    }
}
