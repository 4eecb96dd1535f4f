use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ironlinq_core::executor::AggregateSource;
use ironlinq_core::logging::{self, LogLevel, StderrSink};
use ironlinq_core::{translate, Expr, Materialized, MemoryDatabase, QueryOptions, QueryProvider};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ironlinq")]
#[command(about = "IronLinq CLI - translate query expressions into aggregation pipelines and run them")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Diagnostic level: error, warn, info, debug or trace (defaults to IRONLINQ_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Documents per batch requested from the store
    #[arg(long, global = true)]
    batch_size: Option<u32>,

    /// Time limit for each aggregate, in milliseconds
    #[arg(long, global = true)]
    max_time_ms: Option<u64>,

    /// Do not echo the pipeline text before executing
    #[arg(long, global = true)]
    no_log_pipeline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline emitted for a query expression
    Translate {
        /// Query expression as JSON
        query: PathBuf,
        /// Print the bare stage array instead of `collection.aggregate(...)`
        #[arg(long)]
        json: bool,
    },
    /// Run a query expression against fixture data
    Run {
        /// Query expression as JSON
        query: PathBuf,
        /// Fixtures: { "collection_name": [documents...], ... }
        #[arg(long)]
        data: PathBuf,
    },
    /// Evaluate a raw pipeline against fixture data
    Aggregate {
        /// Pipeline as a JSON array of stages
        pipeline: PathBuf,
        /// Fixtures: { "collection_name": [documents...], ... }
        #[arg(long)]
        data: PathBuf,
        /// Collection the pipeline runs on
        #[arg(long)]
        collection: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_logging(cli.global.log_level.as_deref())?;
    let options = query_options(&cli.global);

    match cli.command {
        Commands::Translate { query, json } => print_translation(&query, json),
        Commands::Run { query, data } => run_query(&query, &data, options),
        Commands::Aggregate {
            pipeline,
            data,
            collection,
        } => run_pipeline(&pipeline, &data, &collection, &options),
    }
}

fn configure_logging(level: Option<&str>) -> Result<()> {
    match level {
        Some(name) => {
            let level = LogLevel::parse(name)
                .with_context(|| format!("Unknown log level: {}", name))?;
            logging::set_log_level(level);
        }
        None => {
            logging::init_from_env();
        }
    }
    Ok(())
}

fn query_options(args: &GlobalArgs) -> QueryOptions {
    let mut options = QueryOptions::new().with_pipeline_logging(!args.no_log_pipeline);
    if let Some(batch_size) = args.batch_size {
        options = options.with_batch_size(batch_size);
    }
    if let Some(ms) = args.max_time_ms {
        options = options.with_max_time(Duration::from_millis(ms));
    }
    options
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in file: {}", path.display()))
}

fn load_query(path: &Path) -> Result<Expr> {
    serde_json::from_value(read_json(path)?)
        .with_context(|| format!("Not a query expression: {}", path.display()))
}

fn load_database(path: &Path) -> Result<MemoryDatabase> {
    let db = MemoryDatabase::new();
    let loaded = db
        .load_json(&read_json(path)?)
        .with_context(|| format!("Failed to load fixtures from {}", path.display()))?;
    eprintln!(
        "Loaded {} documents into {} collections",
        loaded,
        db.collection_names().len()
    );
    Ok(db)
}

fn print_translation(query_path: &Path, bare: bool) -> Result<()> {
    let expr = load_query(query_path)?;
    let query = translate(&expr).with_context(|| format!("Cannot translate {}", expr))?;
    if bare {
        println!("{}", serde_json::to_string_pretty(&Value::Array(query.pipeline()))?);
    } else {
        println!("{}", query);
    }
    Ok(())
}

fn run_query(query_path: &Path, data_path: &Path, options: QueryOptions) -> Result<()> {
    let expr = load_query(query_path)?;
    let db = Arc::new(load_database(data_path)?);
    let provider = QueryProvider::new(db)
        .with_sink(Arc::new(StderrSink))
        .with_options(options);

    match provider
        .execute::<Value>(&expr)
        .with_context(|| format!("Query failed: {}", expr))?
    {
        Materialized::Item(item) => println!("{}", item.unwrap_or(Value::Null)),
        Materialized::Exists(found) => println!("{}", found),
        Materialized::List(rows) => print_rows(&rows),
    }
    Ok(())
}

fn run_pipeline(
    pipeline_path: &Path,
    data_path: &Path,
    collection: &str,
    options: &QueryOptions,
) -> Result<()> {
    let stages = match read_json(pipeline_path)? {
        Value::Array(stages) => stages,
        _ => return Err(anyhow!("Pipeline must be a JSON array of stages")),
    };
    let db = load_database(data_path)?;
    let rows = db
        .aggregate(collection, &stages, options)
        .and_then(|cursor| cursor.collect_all())
        .with_context(|| format!("Aggregate on '{}' failed", collection))?;
    print_rows(&rows);
    Ok(())
}

fn print_rows(rows: &[Value]) {
    for row in rows {
        println!("{}", row);
    }
    eprintln!("{} result(s)", rows.len());
}
