//! Command surface for ingesting and querying usage events in a local
//! `SQLite` database.
//!
//! - [`run_cli`] executes a fully parsed command line and prints JSON.
//! - [`run_command`] executes one [`Command`] against an open store and
//!   returns the JSON it would print.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use usage_events_core::{
    now_utc, EventFilter, IngestRequest, Metadata, RetrievalLimits, MAX_CHUNKS, RESULT_CEILING,
};
use usage_events_store_sqlite::SqliteEventStore;

#[derive(Debug, Parser)]
#[command(name = "ue")]
#[command(about = "Usage events CLI")]
pub struct Cli {
    #[arg(long, env = "USAGE_EVENTS_DB", default_value = "./usage_events.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the events schema.
    Migrate,
    /// Record a single event.
    Ingest(IngestArgs),
    /// Record every event of a JSON array file in one transaction.
    Import(ImportArgs),
    /// Retrieve events, newest first, bounded by the result ceiling.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    event: String,
    #[arg(long)]
    path: String,
    #[arg(long)]
    referrer: Option<String>,
    #[arg(long)]
    browser: Option<String>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    timestamp: Option<String>,
    #[arg(long)]
    metadata_json: Option<String>,
    #[arg(long, default_value = "")]
    ip: String,
    #[arg(long, default_value = "Unknown")]
    location: String,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value = "")]
    ip: String,
    #[arg(long, default_value = "Unknown")]
    location: String,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[arg(long)]
    service: Option<String>,
    #[arg(long)]
    event: Option<String>,
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    referrer: Option<String>,
    #[arg(long)]
    browser: Option<String>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value_t = RESULT_CEILING)]
    ceiling: usize,
    #[arg(long, default_value_t = MAX_CHUNKS)]
    max_chunks: usize,
}

/// Executes the parsed top-level command and prints its JSON result.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let value = run_with_db(&cli.db, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Opens and migrates the database at `db_path`, then runs `command`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<Value> {
    let mut store = SqliteEventStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Runs one command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, persistence or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteEventStore) -> Result<Value> {
    match command {
        Command::Migrate => Ok(json!({
            "schema_version": store.schema_version()?,
            "target_schema_version": SqliteEventStore::target_schema_version(),
        })),
        Command::Ingest(args) => {
            let request = IngestRequest {
                service: args.service,
                event: args.event,
                path: args.path,
                referrer: args.referrer,
                user_browser: args.browser,
                user_device: args.device,
                timestamp: args.timestamp,
                metadata: args
                    .metadata_json
                    .as_deref()
                    .map(parse_metadata_json)
                    .transpose()?,
            };
            let input = request.into_input(args.ip, args.location, now_utc())?;
            let record = store.save_event(&input)?;
            Ok(serde_json::to_value(record)?)
        }
        Command::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let requests: Vec<IngestRequest> = serde_json::from_str(&raw).with_context(|| {
                format!("{} must hold a JSON array of events", args.file.display())
            })?;

            let now = now_utc();
            let inputs = requests
                .into_iter()
                .enumerate()
                .map(|(index, request)| {
                    request
                        .into_input(args.ip.clone(), args.location.clone(), now)
                        .with_context(|| format!("invalid event at index {index}"))
                })
                .collect::<Result<Vec<_>>>()?;

            let records = store.save_events(&inputs)?;
            tracing::info!(count = records.len(), file = %args.file.display(), "imported events");
            Ok(json!({ "imported": records.len() }))
        }
        Command::Query(args) => {
            let limits = RetrievalLimits {
                ceiling: args.ceiling,
                max_chunks: args.max_chunks,
            };
            let filter = EventFilter {
                service: args.service,
                event: args.event,
                path: args.path,
                referrer: args.referrer,
                user_browser: args.browser,
                user_device: args.device,
                from: args.from,
                to: args.to,
            };

            let retrieval = store.get_events_with_limits(&filter, limits)?;
            if retrieval.truncated {
                tracing::warn!(
                    total_count = retrieval.total_count,
                    returned = retrieval.events.len(),
                    "results truncated at the ceiling"
                );
            }
            Ok(serde_json::to_value(retrieval)?)
        }
    }
}

fn parse_metadata_json(raw: &str) -> Result<Metadata> {
    serde_json::from_str(raw)
        .with_context(|| format!("metadata_json must be a JSON object: {raw}"))
}
