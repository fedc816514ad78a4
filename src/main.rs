//! dbrelay CLI Entry Point
//!
//! A thin diagnostic front end over the library. Subcommands:
//! - `sources` - list configured sources
//! - `check` - connect every (or one) source and run a round-trip test
//! - `query` - execute one statement against a source
//! - `search` - discover schemas, tables, columns, indexes or procedures
//!
//! All output to stdout is JSON-only. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use dbrelay::{
    init_logging, Config, ErrorEnvelope, ExecuteOptions, Metadata, ObjectType, RelayError, SearchFilter,
    SourceRegistry, SuccessEnvelope,
};

/// dbrelay - uniform connector layer over SQL engines
#[derive(Parser)]
#[command(name = "dbrelay")]
#[command(about = "Query and explore configured database sources")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to .dbrelay/sources.json, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured sources
    Sources,

    /// Connect sources and run a round-trip test
    Check {
        /// Only check this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Execute one SQL statement
    Query {
        /// Source id (optional when only one source or a `default` source exists)
        #[arg(long)]
        source: Option<String>,

        /// Row cap for this call
        #[arg(long)]
        max_rows: Option<usize>,

        /// Statement timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Positional parameters as a JSON array
        #[arg(long)]
        params: Option<String>,

        sql: String,
    },

    /// Discover schema objects
    Search {
        #[arg(long)]
        source: Option<String>,

        /// schema, table, column, index or procedure
        #[arg(long = "type", default_value = "table")]
        object_type: ObjectType,

        #[arg(long)]
        schema: Option<String>,

        /// Owning table (required for column search)
        #[arg(long)]
        table: Option<String>,

        /// LIKE pattern on the object name
        #[arg(long)]
        pattern: Option<String>,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::Check { .. } => "check",
            Self::Query { .. } => "query",
            Self::Search { .. } => "search",
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, RelayError> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_with_precedence(),
    }
}

fn parse_params(raw: Option<&str>) -> Result<Vec<Value>, RelayError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(values)) => Ok(values),
        Ok(_) => Err(RelayError::invalid_input("--params must be a JSON array")),
        Err(e) => Err(RelayError::invalid_input(format!("--params is not valid JSON: {e}"))),
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

/// One command's successful payload
struct Outcome {
    source: Option<String>,
    data: Value,
    rows_returned: Option<usize>,
}

async fn run(command: &Commands, registry: &SourceRegistry) -> Result<Outcome, RelayError> {
    match command {
        Commands::Sources => Ok(Outcome {
            source: None,
            data: json!(registry.list_sources()),
            rows_returned: None,
        }),
        Commands::Check { source } => {
            let targets = match source {
                Some(id) => vec![registry.resolve(Some(id))?],
                None => registry.ids().iter().filter_map(|id| registry.resolve(Some(id)).ok()).collect(),
            };

            let mut results = Vec::with_capacity(targets.len());
            for connector in targets {
                let entry = match connector.connect().await {
                    Ok(()) => json!({"id": connector.id(), "ok": connector.test_connection().await}),
                    Err(e) => json!({"id": connector.id(), "ok": false, "error": e.message()}),
                };
                results.push(entry);
            }
            Ok(Outcome { source: source.clone(), data: Value::Array(results), rows_returned: None })
        }
        Commands::Query { source, max_rows, timeout_ms, params, sql } => {
            let connector = registry.resolve(source.as_deref())?;
            connector.connect().await?;

            let params = parse_params(params.as_deref())?;
            let overrides = ExecuteOptions { max_rows: *max_rows, timeout: timeout_ms.map(Duration::from_millis) };
            let result = registry.execute(Some(connector.id()), sql, &params, overrides).await?;
            Ok(Outcome {
                source: Some(connector.id().to_string()),
                rows_returned: Some(result.rows.len()),
                data: json!(result),
            })
        }
        Commands::Search { source, object_type, schema, table, pattern } => {
            let filter = SearchFilter {
                object_type: *object_type,
                schema: schema.clone(),
                table: table.clone(),
                pattern: pattern.clone(),
            };
            filter.validate()?;

            let connector = registry.resolve(source.as_deref())?;
            connector.connect().await?;
            let objects = registry.search_objects(Some(connector.id()), &filter).await?;
            Ok(Outcome {
                source: Some(connector.id().to_string()),
                rows_returned: Some(objects.len()),
                data: json!(objects),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet).context("Failed to initialize logging")?;

    let command = cli.command.name();
    let started = Instant::now();

    let registry = match load_config(cli.config.as_ref()).and_then(|config| SourceRegistry::from_config(&config)) {
        Ok(registry) => registry,
        Err(e) => {
            print_json(&ErrorEnvelope::from_error(command, &e))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let outcome = run(&cli.command, &registry).await;
    registry.disconnect_all().await;

    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match outcome {
        Ok(outcome) => {
            let meta = match outcome.rows_returned {
                Some(rows) => Metadata::with_rows(elapsed, rows),
                None => Metadata::new(elapsed),
            };
            print_json(&SuccessEnvelope::new(command, outcome.source, outcome.data, meta))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            print_json(&ErrorEnvelope::from_error(command, &e))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
