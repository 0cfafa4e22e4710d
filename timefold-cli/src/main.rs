//! CLI for the timefold store, aggregator and consumers.
//!
//! Provides commands for inspecting and querying record trees, and for
//! running the jobs of a job file once.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use timefold::config::{ArchiveJob, PersistJob};
use timefold::{Archiver, Cleaner, IntervalAggregator, JobsConfig, Persister, TimeIndexedStore};

/// timefold: time-indexed file store with interval aggregation and resumable consumers.
#[derive(Parser)]
#[command(name = "timefold", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display record count, time range and disk usage of a store tree.
    Info {
        /// Root of the store tree.
        root: PathBuf,
    },

    /// Print the records of a store tree in a time range.
    Query {
        /// Root of the store tree.
        root: PathBuf,

        /// First timestamp, as epoch seconds or RFC 3339.
        #[arg(long)]
        start: Option<String>,

        /// Last timestamp (inclusive), as epoch seconds or RFC 3339.
        #[arg(long)]
        end: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Run every job of a job file once.
    Run {
        /// Path to the JSON job file.
        jobs: PathBuf,

        /// Run only the job with this name.
        #[arg(long)]
        job: Option<String>,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { root } => cmd_info(&root),
        Commands::Query {
            root,
            start,
            end,
            format,
        } => cmd_query(&root, start.as_deref(), end.as_deref(), &format),
        Commands::Run { jobs, job } => cmd_run(&jobs, job.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `timefold info <root>`.
fn cmd_info(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("No store found at '{}'", root.display()).into());
    }

    let store = TimeIndexedStore::open(root);
    let stats = store.stats(i64::MIN, i64::MAX, true);

    println!("Store: {}", root.display());
    println!("Records: {}", stats.count);
    if stats.count > 0 {
        println!("First: {} ({})", format_timestamp(stats.range.start), stats.range.start);
        println!("Last: {} ({})", format_timestamp(stats.range.end), stats.range.end);
    }

    let total_size = dir_size(root)?;
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));

    Ok(())
}

/// Implements `timefold query <root>`.
fn cmd_query(
    root: &Path,
    start: Option<&str>,
    end: Option<&str>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = start.map(parse_timestamp).transpose()?.unwrap_or(i64::MIN);
    let end = end.map(parse_timestamp).transpose()?.unwrap_or(i64::MAX);

    let store = TimeIndexedStore::open(root);
    let records = store.records(start, end, true);

    match format {
        OutputFormat::Csv => {
            let mut columns: Vec<&String> = records.values().flat_map(|fields| fields.keys()).collect();
            columns.sort();
            columns.dedup();

            println!("# root={}, records={}", root.display(), records.len());
            let header: Vec<&str> = std::iter::once("timestamp")
                .chain(columns.iter().map(|c| c.as_str()))
                .collect();
            println!("{}", header.join(","));
            for (timestamp, fields) in &records {
                let mut row = vec![timestamp.to_string()];
                for column in &columns {
                    row.push(
                        fields
                            .get(*column)
                            .map(csv_cell)
                            .unwrap_or_default(),
                    );
                }
                println!("{}", row.join(","));
            }
        }
        OutputFormat::Json => {
            let data: Vec<serde_json::Value> = records
                .into_iter()
                .map(|(timestamp, fields)| {
                    let mut object: serde_json::Map<String, serde_json::Value> = fields.into_iter().collect();
                    object.insert("timestamp".to_string(), serde_json::Value::from(timestamp));
                    serde_json::Value::Object(object)
                })
                .collect();

            let output = serde_json::json!({
                "root": root.display().to_string(),
                "count": data.len(),
                "data": data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `timefold run <jobs>`.
///
/// Every selected job is attempted even if an earlier one failed. Jobs the
/// file rejected as invalid count as failed.
fn cmd_run(jobs_path: &Path, only: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = JobsConfig::load(jobs_path)?;
    if let Some(name) = only
        && !jobs
            .job_names()
            .chain(jobs.rejected.iter().map(|job| job.name.as_str()))
            .any(|job| job == name)
    {
        return Err(format!("No job named '{name}' in '{}'", jobs_path.display()).into());
    }
    let selected = |name: &str| only.is_none_or(|wanted| wanted == name);

    let mut failed = Vec::new();

    for job in jobs.rejected.iter().filter(|job| selected(&job.name)) {
        error!(job = %job.name, kind = job.kind, reason = %job.reason, "invalid job skipped");
        failed.push(job.name.clone());
    }

    for config in jobs.aggregators.iter().filter(|a| selected(&a.name)) {
        let result = IntervalAggregator::new(config.clone()).and_then(|aggregator| aggregator.run());
        match result {
            Ok(report) => info!(
                job = %config.name,
                intervals = report.intervals,
                written = report.written,
                "aggregator finished"
            ),
            Err(e) => {
                error!(job = %config.name, error = %e, "aggregator failed");
                failed.push(config.name.clone());
            }
        }
    }

    for job in jobs.persisters.iter().filter(|p| selected(&p.persister.name)) {
        if let Err(e) = run_persister(job) {
            error!(job = %job.persister.name, error = %e, "persister failed");
            failed.push(job.persister.name.clone());
        }
    }

    for job in jobs.archivers.iter().filter(|a| selected(&a.archiver.name)) {
        if let Err(e) = run_archiver(job) {
            error!(job = %job.archiver.name, error = %e, "archiver failed");
            failed.push(job.archiver.name.clone());
        }
    }

    for config in jobs.cleaners.iter().filter(|c| selected(&c.name)) {
        let result = Cleaner::new(config).and_then(|cleaner| cleaner.run());
        match result {
            Ok(report) => info!(job = %config.name, deleted = report.deleted, "cleaner finished"),
            Err(e) => {
                error!(job = %config.name, error = %e, "cleaner failed");
                failed.push(config.name.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} job(s) failed: {}", failed.len(), failed.join(", ")).into())
    }
}

fn run_persister(job: &PersistJob) -> timefold::Result<()> {
    let persister = Persister::new(job.persister.clone())?;
    let mut sink = job.sink.build(persister.name())?;
    let report = persister.run(sink.as_mut())?;
    info!(
        job = %persister.name(),
        written = report.written,
        duplicates = report.duplicates,
        "persister finished"
    );
    Ok(())
}

fn run_archiver(job: &ArchiveJob) -> timefold::Result<()> {
    let archiver = Archiver::new(job.archiver.clone())?;
    let mut sink = job.sink.build(archiver.name())?;
    let report = archiver.run(sink.as_mut())?;
    info!(
        job = %archiver.name(),
        archived = report.archived,
        bytes = report.bytes,
        remaining = report.remaining,
        "archiver finished"
    );
    Ok(())
}

/// Parses epoch seconds or an RFC 3339 date-time.
fn parse_timestamp(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if let Ok(seconds) = s.parse::<i64>() {
        return Ok(seconds);
    }
    let parsed = DateTime::parse_from_rfc3339(s)
        .map_err(|e| format!("Invalid timestamp '{s}': {e}. Use epoch seconds or RFC 3339."))?;
    Ok(parsed.timestamp())
}

/// Formats epoch seconds as RFC 3339 in UTC.
fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map_or_else(|| "?".to_string(), |dt| dt.to_rfc3339())
}

/// Renders one JSON value as a CSV cell.
fn csv_cell(value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
