// ironlinq-core/src/lib.rs
// LINQ-style query expressions to MongoDB aggregation pipelines, with typed results

pub mod codec;
pub mod error;
pub mod executor;
pub mod expr;
pub mod logging;
pub mod materialize;
pub mod memory;
pub mod options;
pub mod partial_eval;
pub mod pipeline;
pub mod provider;
pub mod translate;
pub mod value_utils;

// Public exports
pub use codec::ObjectId;
pub use error::{LinqError, Result};
pub use executor::{AggregateSource, DocumentCursor, Executor};
pub use expr::{BinaryOp, Expr, ExprType, MemberInfo, UnaryOp};
pub use logging::{get_log_level, set_log_level, LogLevel, LogSink, MemorySink, StderrSink};
pub use materialize::{Grouping, Materialized, Materializer, SubtypeResolver, SubtypeTable};
pub use memory::MemoryDatabase;
pub use options::{CancellationToken, QueryOptions};
pub use partial_eval::partial_evaluate;
pub use pipeline::{ResultShape, StageKind, TranslatedQuery};
pub use provider::QueryProvider;
pub use translate::translate;
