// ironlinq-core/src/provider.rs
// Query provider: partial evaluation, translation, execution and materialization in one call

use crate::error::{LinqError, Result};
use crate::executor::{AggregateSource, Executor};
use crate::expr::Expr;
use crate::log_debug;
use crate::logging::LogSink;
use crate::materialize::{Materialized, Materializer, SubtypeResolver};
use crate::options::QueryOptions;
use crate::partial_eval::partial_evaluate;
use crate::pipeline::TranslatedQuery;
use crate::translate::translate;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Entry point for running query expressions against a document store
#[derive(Clone, Debug)]
pub struct QueryProvider {
    executor: Executor,
    options: QueryOptions,
}

impl QueryProvider {
    pub fn new(source: Arc<dyn AggregateSource>) -> Self {
        QueryProvider {
            executor: Executor::new(source),
            options: QueryOptions::default(),
        }
    }

    /// Route pipeline text and rewritten expressions to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.executor = self.executor.with_sink(sink);
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Fold closed sub-trees and translate
    pub fn prepare(&self, expr: &Expr) -> Result<TranslatedQuery> {
        let (rewritten, changed) = partial_evaluate(expr);
        if changed {
            log_debug!("partial evaluation rewrote the query to {}", rewritten);
            if self.options.log_pipeline {
                if let Some(sink) = self.executor.sink() {
                    sink.write_line(&rewritten.to_string());
                }
            }
        }
        translate(&rewritten)
    }

    pub fn execute<T: DeserializeOwned>(&self, expr: &Expr) -> Result<Materialized<T>> {
        let query = self.prepare(expr)?;
        let cursor = self.executor.execute(&query, &self.options)?;
        Materializer::new(query.shape).materialize(cursor)
    }

    /// Execute, decoding each document through the subtype registered for its discriminator
    pub fn execute_polymorphic<T: DeserializeOwned>(
        &self,
        expr: &Expr,
        resolver: &dyn SubtypeResolver<T>,
    ) -> Result<Materialized<T>> {
        let query = self.prepare(expr)?;
        let cursor = self.executor.execute(&query, &self.options)?;
        Materializer::new(query.shape)
            .with_resolver(resolver)
            .materialize(cursor)
    }

    pub fn to_list<T: DeserializeOwned>(&self, query: &Expr) -> Result<Vec<T>> {
        self.execute(query)?.into_list()
    }

    pub fn first<T: DeserializeOwned>(&self, query: &Expr) -> Result<T> {
        self.execute(&query.first())?
            .into_item()?
            .ok_or(LinqError::NoElements)
    }

    pub fn first_or_default<T: DeserializeOwned>(&self, query: &Expr) -> Result<Option<T>> {
        self.execute(&query.first_or_default())?.into_item()
    }

    pub fn single<T: DeserializeOwned>(&self, query: &Expr) -> Result<T> {
        self.execute(&query.single())?
            .into_item()?
            .ok_or(LinqError::NoElements)
    }

    pub fn single_or_default<T: DeserializeOwned>(&self, query: &Expr) -> Result<Option<T>> {
        self.execute(&query.single_or_default())?.into_item()
    }

    /// Number of matching documents; an empty collection counts zero
    pub fn count(&self, query: &Expr) -> Result<i64> {
        Ok(self.execute::<i64>(&query.count())?.into_item()?.unwrap_or(0))
    }

    pub fn any(&self, query: &Expr) -> Result<bool> {
        self.execute::<i64>(&query.any())?.into_bool()
    }

    /// Result of a query that already ends in a scalar operator (`Sum`, `Max`, ...)
    pub fn scalar<T: DeserializeOwned>(&self, query: &Expr) -> Result<Option<T>> {
        self.execute(query)?.into_item()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::builder::*;
    use crate::expr::ExprType;
    use crate::logging::MemorySink;
    use crate::memory::MemoryDatabase;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Age")]
        age: i64,
    }

    fn people() -> (Arc<MemoryDatabase>, QueryProvider) {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_many(
            "people",
            vec![
                json!({"Name": "Ann", "Age": 31}),
                json!({"Name": "Bob", "Age": 22}),
                json!({"Name": "Cid", "Age": 45}),
            ],
        )
        .unwrap();
        let provider = QueryProvider::new(db.clone());
        (db, provider)
    }

    fn p() -> Expr {
        param("p", ExprType::entity("Person"))
    }

    fn older_than(age: Expr) -> Expr {
        collection("people", "Person").filter(lambda(&["p"], p().member("Age", ExprType::Int).gt(age)))
    }

    #[test]
    fn test_to_list_and_count() {
        let (_, provider) = people();
        let query = older_than(int(25)).order_by(lambda(&["p"], p().member("Age", ExprType::Int)));
        let found: Vec<Person> = provider.to_list(&query).unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Ann", "Cid"]);
        assert_eq!(provider.count(&older_than(int(25))).unwrap(), 2);
        assert_eq!(provider.count(&older_than(int(99))).unwrap(), 0);
    }

    #[test]
    fn test_rewritten_expression_is_logged() {
        let (_, provider) = people();
        let sink = MemorySink::new();
        let provider = provider.with_sink(Arc::new(sink.clone()));
        let names: Vec<String> = provider
            .to_list(&older_than(int(20).plus(int(20))).select(lambda(
                &["p"],
                p().member("Name", ExprType::String),
            )))
            .unwrap();
        assert_eq!(names, vec!["Cid"]);

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("(p.Age > 40)"));
        assert!(lines[1].starts_with("people.aggregate("));
    }

    #[test]
    fn test_element_operators() {
        let (_, provider) = people();
        let bob: Person = provider.single(&older_than(int(0)).filter(lambda(
            &["p"],
            p().member("Name", ExprType::String).equals(string("Bob")),
        )))
        .unwrap();
        assert_eq!(bob.age, 22);

        let err = provider.single::<Person>(&older_than(int(0))).unwrap_err();
        assert!(matches!(err, LinqError::MoreThanOneElement));
        let err = provider.first::<Person>(&older_than(int(99))).unwrap_err();
        assert!(matches!(err, LinqError::NoElements));
        assert_eq!(provider.first_or_default::<Person>(&older_than(int(99))).unwrap(), None);
        assert!(provider.any(&older_than(int(40))).unwrap());
        assert!(!provider.any(&older_than(int(60))).unwrap());
    }

    #[test]
    fn test_scalar_aggregates() {
        let (_, provider) = people();
        let age = lambda(&["p"], p().member("Age", ExprType::Int));
        let total: Option<i64> = provider
            .scalar(&collection("people", "Person").sum(Some(age.clone())))
            .unwrap();
        assert_eq!(total, Some(98));
        let max: Option<i64> = provider
            .scalar(&older_than(int(99)).max(Some(age)))
            .unwrap();
        assert_eq!(max, None);
    }
}
