// ironlinq-core/src/materialize.rs
//! Result materializer
//!
//! Decodes the documents of an executed pipeline into the caller's expected shape. The
//! decoding branch is picked from the result-shape flags alone, in fixed precedence:
//! existence test, then scalar aggregate, then single element, then list.

use crate::error::{LinqError, Result};
use crate::pipeline::{ResultShape, DISCRIMINATOR_FIELD, RESULT_FIELD};
use ahash::AHashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Decoded query result
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized<T> {
    /// Scalar aggregate or single element; `None` is the type's default
    Item(Option<T>),
    /// Result of `any()`
    Exists(bool),
    List(Vec<T>),
}

impl<T> Materialized<T> {
    pub fn into_list(self) -> Result<Vec<T>> {
        match self {
            Materialized::List(items) => Ok(items),
            other => Err(LinqError::contract(format!(
                "expected a list result, got {}",
                other.kind()
            ))),
        }
    }

    pub fn into_item(self) -> Result<Option<T>> {
        match self {
            Materialized::Item(item) => Ok(item),
            other => Err(LinqError::contract(format!(
                "expected a single result, got {}",
                other.kind()
            ))),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Materialized::Exists(found) => Ok(found),
            other => Err(LinqError::contract(format!(
                "expected an existence result, got {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Materialized::Item(_) => "item",
            Materialized::Exists(_) => "existence",
            Materialized::List(_) => "list",
        }
    }
}

/// Group produced by a `GroupBy` that was never projected
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Grouping<K, V> {
    #[serde(rename = "_id")]
    pub key: K,
    #[serde(default = "Vec::new")]
    pub values: Vec<V>,
}

// ============================================================================
// SUBTYPE RESOLUTION
// ============================================================================

/// Decoder for one concrete subtype of `T`
pub type SubtypeDecoder<T> = Box<dyn Fn(Value) -> Result<T> + Send + Sync>;

/// Looks up the decoder registered for a type-discriminator tag
pub trait SubtypeResolver<T>: Send + Sync {
    fn resolve(&self, tag: &str) -> Option<&SubtypeDecoder<T>>;
}

/// Tag → decoder table
pub struct SubtypeTable<T> {
    decoders: AHashMap<String, SubtypeDecoder<T>>,
}

impl<T> Default for SubtypeTable<T> {
    fn default() -> Self {
        SubtypeTable {
            decoders: AHashMap::new(),
        }
    }
}

impl<T: 'static> SubtypeTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode documents tagged `tag` as `S`, then convert into `T`
    pub fn register<S, F>(mut self, tag: &str, convert: F) -> Self
    where
        S: DeserializeOwned,
        F: Fn(S) -> T + Send + Sync + 'static,
    {
        self.decoders.insert(
            tag.to_string(),
            Box::new(move |doc| Ok(convert(serde_json::from_value::<S>(doc)?))),
        );
        self
    }

    pub fn register_decoder(mut self, tag: &str, decoder: SubtypeDecoder<T>) -> Self {
        self.decoders.insert(tag.to_string(), decoder);
        self
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl<T> SubtypeResolver<T> for SubtypeTable<T> {
    fn resolve(&self, tag: &str) -> Option<&SubtypeDecoder<T>> {
        self.decoders.get(tag)
    }
}

/// Most specific discriminator of a document: a string tag, or the last entry of a
/// tag hierarchy array
pub fn discriminator(doc: &Value) -> Option<&str> {
    match doc.get(DISCRIMINATOR_FIELD)? {
        Value::String(tag) => Some(tag),
        Value::Array(tags) => tags.last()?.as_str(),
        _ => None,
    }
}

// ============================================================================
// MATERIALIZER
// ============================================================================

/// Payload of a single-value wrapper document
fn result_payload(mut doc: Value) -> Value {
    doc.as_object_mut()
        .and_then(|o| o.remove(RESULT_FIELD))
        .unwrap_or(Value::Null)
}

/// True for documents that only wrap a scalar: `{_result_: v}`
fn is_scalar_wrapper(doc: &Value) -> bool {
    doc.as_object()
        .map_or(false, |o| o.len() == 1 && o.contains_key(RESULT_FIELD))
}

pub struct Materializer<'a, T> {
    shape: ResultShape,
    resolver: Option<&'a dyn SubtypeResolver<T>>,
}

impl<'a, T: DeserializeOwned> Materializer<'a, T> {
    pub fn new(shape: ResultShape) -> Self {
        Materializer {
            shape,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn SubtypeResolver<T>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn materialize<I>(&self, docs: I) -> Result<Materialized<T>>
    where
        I: IntoIterator<Item = Result<Value>>,
    {
        let mut docs = docs.into_iter();

        if self.shape.contains(ResultShape::ANY) {
            let found = match docs.next().transpose()? {
                Some(doc) => result_payload(doc).as_i64().unwrap_or(0) > 0,
                None => false,
            };
            return Ok(Materialized::Exists(found));
        }

        if self.shape.contains(ResultShape::AGGREGATE) {
            let first = match docs.next().transpose()? {
                Some(doc) => doc,
                None => return Ok(Materialized::Item(None)),
            };
            if docs.next().transpose()?.is_some() {
                return Err(LinqError::contract(
                    "aggregate query returned more than one document",
                ));
            }
            let value = serde_json::from_value(result_payload(first))?;
            return Ok(Materialized::Item(Some(value)));
        }

        if self.shape.contains(ResultShape::ONE_RESULT) {
            let first = match docs.next().transpose()? {
                Some(doc) => doc,
                None if self.shape.contains(ResultShape::OR_DEFAULT) => {
                    return Ok(Materialized::Item(None))
                }
                None => return Err(LinqError::NoElements),
            };
            if self.shape.contains(ResultShape::SINGLE) && docs.next().transpose()?.is_some() {
                return Err(LinqError::MoreThanOneElement);
            }
            let scalar = is_scalar_wrapper(&first);
            return Ok(Materialized::Item(Some(self.decode(first, scalar)?)));
        }

        // the first row decides whether every row is a scalar wrapper
        let mut items = Vec::new();
        let mut scalar = None;
        for doc in docs {
            let doc = doc?;
            let scalar = *scalar.get_or_insert_with(|| is_scalar_wrapper(&doc));
            items.push(self.decode(doc, scalar)?);
        }
        Ok(Materialized::List(items))
    }

    fn decode(&self, doc: Value, scalar: bool) -> Result<T> {
        if scalar {
            return Ok(serde_json::from_value(result_payload(doc))?);
        }
        if !self.shape.contains(ResultShape::GROUPED) {
            if let Some(resolver) = self.resolver {
                if let Some(decoder) = discriminator(&doc).and_then(|tag| resolver.resolve(tag)) {
                    return decoder(doc);
                }
            }
        }
        Ok(serde_json::from_value(doc)?)
    }
}

/// Shorthand for [`Materializer::materialize`] without subtype resolution
pub fn materialize<T, I>(shape: ResultShape, docs: I) -> Result<Materialized<T>>
where
    T: DeserializeOwned,
    I: IntoIterator<Item = Result<Value>>,
{
    Materializer::new(shape).materialize(docs)
}
