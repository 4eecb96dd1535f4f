// ironlinq-core/src/memory/mod.rs
//! In-memory document store
//!
//! Holds collections of JSON documents and evaluates aggregation pipelines over them. It
//! backs the end-to-end tests and the CLI's `run`/`aggregate` commands.

pub mod aggregation;
pub mod expression;
pub mod operators;

use crate::codec::ObjectId;
use crate::error::{LinqError, Result};
use crate::executor::{AggregateSource, DocumentCursor};
use crate::log_debug;
use crate::options::QueryOptions;
use aggregation::{CollectionSource, ExecutionContext, Pipeline};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use operators::{matches_filter, matches_filter_with_vars};

/// Collections of documents kept in memory
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: RwLock<AHashMap<String, Vec<Value>>>,
    open_cursors: Arc<AtomicUsize>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document, assigning an `_id` when it has none. Returns the `_id`.
    pub fn insert_one(&self, collection: &str, document: Value) -> Result<Value> {
        let mut ids = self.insert_many(collection, vec![document])?;
        ids.pop()
            .ok_or_else(|| LinqError::Store("insert produced no id".to_string()))
    }

    pub fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>> {
        let mut prepared = Vec::with_capacity(documents.len());
        for document in documents {
            let mut fields = match document {
                Value::Object(fields) => fields,
                other => {
                    return Err(LinqError::Store(format!(
                        "documents must be objects, got {}",
                        other
                    )))
                }
            };
            if !fields.contains_key("_id") {
                fields.insert("_id".to_string(), ObjectId::new().to_value());
            }
            prepared.push(Value::Object(fields));
        }

        let ids = prepared
            .iter()
            .filter_map(|doc| doc.get("_id").cloned())
            .collect();
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .extend(prepared);
        Ok(ids)
    }

    /// Copy of a collection's documents in insertion order
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Load fixtures shaped `{"collection": [doc, ...], ...}`. Returns the document count.
    pub fn load_json(&self, fixtures: &Value) -> Result<usize> {
        let collections = fixtures.as_object().ok_or_else(|| {
            LinqError::Store("fixtures must map collection names to arrays".to_string())
        })?;
        let mut loaded = 0;
        for (name, docs) in collections {
            let docs = docs.as_array().ok_or_else(|| {
                LinqError::Store(format!("collection '{}' must be an array", name))
            })?;
            loaded += self.insert_many(name, docs.clone())?.len();
        }
        Ok(loaded)
    }

    /// Cursors handed out and not yet dropped
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }
}

impl CollectionSource for MemoryDatabase {
    fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.documents(collection)
    }
}

impl AggregateSource for MemoryDatabase {
    fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        options: &QueryOptions,
    ) -> Result<DocumentCursor> {
        let parsed = Pipeline::from_stages(pipeline)?;
        let docs = self.documents(collection);
        let input = docs.len();
        let ctx = ExecutionContext::new(self, options);
        let results = parsed.execute(docs, &ctx)?;
        log_debug!(
            "aggregate on '{}': {} stages, {} documents in, {} out",
            collection,
            parsed.len(),
            input,
            results.len()
        );

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        let open = Arc::clone(&self.open_cursors);
        Ok(DocumentCursor::from_vec(results).on_release(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_assigns_ids() {
        let db = MemoryDatabase::new();
        let id = db.insert_one("c", json!({"a": 1})).unwrap();
        assert!(crate::codec::oid_hex(&id).is_some());
        let kept = db.insert_one("c", json!({"_id": 7, "a": 2})).unwrap();
        assert_eq!(kept, json!(7));
        assert_eq!(db.documents("c").len(), 2);
        assert!(db.insert_one("c", json!(3)).is_err());
    }

    #[test]
    fn test_load_json() {
        let db = MemoryDatabase::new();
        let loaded = db
            .load_json(&json!({"a": [{"x": 1}, {"x": 2}], "b": [{"y": 1}]}))
            .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(db.collection_names(), vec!["a", "b"]);
        assert!(db.load_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_aggregate_releases_cursor() {
        let db = MemoryDatabase::new();
        db.insert_many("c", vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .unwrap();
        let mut cursor = db
            .aggregate(
                "c",
                &[json!({"$match": {"n": {"$gt": 1}}})],
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(db.open_cursors(), 1);
        assert_eq!(cursor.next().unwrap().unwrap()["n"], 2);
        drop(cursor);
        assert_eq!(db.open_cursors(), 0);

        let all = db
            .aggregate("c", &[], &QueryOptions::default())
            .unwrap()
            .collect_all()
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(db.open_cursors(), 0);
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        let db = MemoryDatabase::new();
        let out = db
            .aggregate("none", &[json!({"$match": {}})], &QueryOptions::default())
            .unwrap()
            .collect_all()
            .unwrap();
        assert!(out.is_empty());
    }
}
