// ironlinq-core/src/executor.rs
// Runs translated pipelines against a document store

use crate::error::{LinqError, Result};
use crate::logging::LogSink;
use crate::options::QueryOptions;
use crate::pipeline::TranslatedQuery;
use crate::{log_debug, log_info};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A document store that can run an aggregation pipeline
pub trait AggregateSource: Send + Sync {
    fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        options: &QueryOptions,
    ) -> Result<DocumentCursor>;
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Stream of result documents.
///
/// The release hook runs exactly once, when the cursor is dropped: after full iteration,
/// after the caller stops early, or after an error mid-iteration.
pub struct DocumentCursor {
    inner: Box<dyn Iterator<Item = Result<Value>> + Send>,
    release: Option<ReleaseHook>,
}

impl DocumentCursor {
    pub fn new(iter: impl Iterator<Item = Result<Value>> + Send + 'static) -> Self {
        DocumentCursor {
            inner: Box::new(iter),
            release: None,
        }
    }

    pub fn from_vec(docs: Vec<Value>) -> Self {
        Self::new(docs.into_iter().map(Ok))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Attach the hook that frees the underlying server cursor
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        let previous = self.release.take();
        self.release = Some(Box::new(move || {
            if let Some(previous) = previous {
                previous();
            }
            hook();
        }));
        self
    }

    /// Rewrite errors surfaced during iteration
    pub fn map_err(mut self, f: impl Fn(LinqError) -> LinqError + Send + 'static) -> Self {
        let inner = std::mem::replace(&mut self.inner, Box::new(std::iter::empty()));
        self.inner = Box::new(inner.map(move |item| item.map_err(&f)));
        self
    }

    /// Drain the cursor, stopping at the first error
    pub fn collect_all(self) -> Result<Vec<Value>> {
        self.collect()
    }
}

impl Iterator for DocumentCursor {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl Drop for DocumentCursor {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DocumentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentCursor")
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}

/// Store errors for a membership test against a null list become `ArgumentNull`
pub fn remap_store_error(err: LinqError) -> LinqError {
    match err {
        LinqError::Store(message)
            if (message.contains("$in") || message.contains("$nin"))
                && (message.contains("requires an array") || message.contains("needs an array")) =>
        {
            LinqError::ArgumentNull("values".to_string())
        }
        other => other,
    }
}

/// Sends pipelines to an [`AggregateSource`] and hands back result cursors
#[derive(Clone)]
pub struct Executor {
    source: Arc<dyn AggregateSource>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Executor {
    pub fn new(source: Arc<dyn AggregateSource>) -> Self {
        Executor { source, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn sink(&self) -> Option<&Arc<dyn LogSink>> {
        self.sink.as_ref()
    }

    pub fn execute(&self, query: &TranslatedQuery, options: &QueryOptions) -> Result<DocumentCursor> {
        if options.log_pipeline {
            if let Some(sink) = &self.sink {
                sink.write_line(&query.to_string());
            }
        }
        if query.is_always_empty() {
            log_debug!("{}: pipeline can never match, skipping the store", query.collection);
            return Ok(DocumentCursor::empty());
        }
        log_info!(
            "aggregate on '{}' with {} stages",
            query.collection,
            query.stages.len()
        );
        let cursor = self
            .source
            .aggregate(&query.collection, &query.pipeline(), options)
            .map_err(remap_store_error)?;
        Ok(cursor.map_err(remap_store_error))
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::builder::*;
    use crate::expr::ExprType;
    use crate::logging::MemorySink;
    use crate::translate::translate;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays canned results and records what it was asked
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        released: Arc<AtomicUsize>,
        saw_cancelled: AtomicUsize,
        fail_with: Option<String>,
        fail_mid_stream: Option<String>,
    }

    impl AggregateSource for Recorder {
        fn aggregate(
            &self,
            collection: &str,
            pipeline: &[Value],
            options: &QueryOptions,
        ) -> Result<DocumentCursor> {
            if options.is_cancelled() {
                self.saw_cancelled.fetch_add(1, Ordering::SeqCst);
            }
            self.calls
                .lock()
                .push((collection.to_string(), pipeline.to_vec()));
            if let Some(message) = &self.fail_with {
                return Err(LinqError::Store(message.clone()));
            }
            let released = self.released.clone();
            let mut items = vec![Ok(json!({"_result_": 1}))];
            if let Some(message) = &self.fail_mid_stream {
                items.push(Err(LinqError::Store(message.clone())));
            }
            Ok(DocumentCursor::new(items.into_iter()).on_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn adults() -> TranslatedQuery {
        let p = param("p", ExprType::entity("Person"));
        let q = collection("people", "Person")
            .filter(lambda(&["p"], p.member("Age", ExprType::Int).ge(int(18))));
        translate(&q).unwrap()
    }

    #[test]
    fn test_executes_and_logs_pipeline() {
        let source = Arc::new(Recorder::default());
        let sink = MemorySink::new();
        let executor = Executor::new(source.clone()).with_sink(Arc::new(sink.clone()));

        let docs = executor
            .execute(&adults(), &QueryOptions::new())
            .unwrap()
            .collect_all()
            .unwrap();
        assert_eq!(docs, vec![json!({"_result_": 1})]);

        let calls = source.calls.lock();
        assert_eq!(calls[0].0, "people");
        assert_eq!(calls[0].1, vec![json!({"$match": {"Age": {"$gte": 18}}})]);
        assert_eq!(
            sink.lines(),
            vec![r#"people.aggregate([{"$match":{"Age":{"$gte":18}}}])"#.to_string()]
        );
    }

    #[test]
    fn test_pipeline_logging_can_be_disabled() {
        let sink = MemorySink::new();
        let executor = Executor::new(Arc::new(Recorder::default())).with_sink(Arc::new(sink.clone()));
        let options = QueryOptions::new().with_pipeline_logging(false);
        executor.execute(&adults(), &options).unwrap();
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_always_false_pipeline_skips_the_store() {
        let source = Arc::new(Recorder::default());
        let executor = Executor::new(source.clone());
        let q = translate(&collection("people", "Person").take(0)).unwrap();
        let docs = executor
            .execute(&q, &QueryOptions::new())
            .unwrap()
            .collect_all()
            .unwrap();
        assert!(docs.is_empty());
        assert!(source.calls.lock().is_empty());
    }

    #[test]
    fn test_null_membership_error_is_remapped() {
        let source = Arc::new(Recorder {
            fail_with: Some("$in requires an array as a second argument, found: null".into()),
            ..Default::default()
        });
        let executor = Executor::new(source);
        let err = executor.execute(&adults(), &QueryOptions::new()).unwrap_err();
        assert!(matches!(err, LinqError::ArgumentNull(_)));

        let negated = remap_store_error(LinqError::Store("$nin needs an array".into()));
        assert!(matches!(negated, LinqError::ArgumentNull(_)));

        let other = remap_store_error(LinqError::Store("disk full".into()));
        assert!(matches!(other, LinqError::Store(m) if m == "disk full"));
    }

    #[test]
    fn test_release_runs_once_even_after_mid_stream_error() {
        let source = Arc::new(Recorder {
            fail_mid_stream: Some("$in needs an array".into()),
            ..Default::default()
        });
        let released = source.released.clone();
        let executor = Executor::new(source);

        let mut cursor = executor.execute(&adults(), &QueryOptions::new()).unwrap();
        assert!(cursor.next().unwrap().is_ok());
        let err = cursor.next().unwrap().unwrap_err();
        assert!(matches!(err, LinqError::ArgumentNull(_)));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(cursor);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_is_left_to_the_source() {
        let token = crate::options::CancellationToken::new();
        token.cancel();
        let source = Arc::new(Recorder::default());
        let executor = Executor::new(source.clone());
        let options = QueryOptions::new().with_cancellation(token);
        assert!(executor.execute(&adults(), &options).is_ok());
        assert_eq!(source.saw_cancelled.load(Ordering::SeqCst), 1);
    }
}
