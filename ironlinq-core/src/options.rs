// ironlinq-core/src/options.rs
// Query execution options: batch size, time limit, cancellation, pipeline logging

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared between a caller and a running query
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Options for executing a translated query
///
/// Batch size, time limit and cancellation are handed to the document store untouched;
/// `log_pipeline` controls whether the pipeline text goes to the query log sink.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Documents per round trip
    pub batch_size: Option<u32>,

    /// Server-side time limit for the aggregate command
    pub max_time: Option<Duration>,

    pub cancellation: Option<CancellationToken>,

    /// Write `collection.aggregate([...])` to the log sink before executing
    pub log_pipeline: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            batch_size: None,
            max_time: None,
            cancellation: None,
            log_pipeline: true,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_pipeline_logging(mut self, enabled: bool) -> Self {
        self.log_pipeline = enabled;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }

    /// Options of the aggregate command (`cursor.batchSize`, `maxTimeMS`)
    pub fn to_command_options(&self) -> Value {
        let mut options = Map::new();
        let mut cursor = Map::new();
        if let Some(batch_size) = self.batch_size {
            cursor.insert("batchSize".to_string(), Value::from(batch_size));
        }
        options.insert("cursor".to_string(), Value::Object(cursor));
        if let Some(max_time) = self.max_time {
            options.insert(
                "maxTimeMS".to_string(),
                Value::from(max_time.as_millis() as u64),
            );
        }
        Value::Object(options)
    }
}
