//! rosterharvest is a CLI tool that captures course offerings and student
//! rosters from an academic portal and keeps them in a local snapshot store.
//!
//! The tool has these main commands:
//! 1. `capture` - Runs an extraction and merges it into the stored dataset
//! 2. `show` - Prints the stored dataset with derived columns, filtered and sorted
//! 3. `export` - Writes the stored CSV blob to a file
//! 4. `clear` - Forgets one stored dataset
//! 5. `cache` - Inspects or seeds the course reference cache

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{LevelFilter, info, warn};

use rosterharvest::{
    CancelToken, CaptureStatus, DatasetKind, Harvester, PortalClient, PortalConfig, SqliteStore,
    constants::{DEFAULT_DB_PATH, SESSION_COOKIE_ENV_NAME},
    notify::LogNotifier,
    scrape::{PERIOD_SELECTION_KEY, Selection},
    storage::KeyValueStore,
    view::Filter,
};

/// A CLI tool to capture academic portal datasets into a local snapshot store
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The command to execute
    #[command(subcommand)]
    command: Command,

    /// Path to database file to store snapshots and the reference cache
    #[arg(long, global = true, default_value = DEFAULT_DB_PATH)]
    db: String,

    /// Portal descriptor (JSON); the embedded default is used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, action = clap::ArgAction::Count, help = "Output v(v...)erbosity: error (0), warn (1), info (2), debug (3), trace (4)", global = true, default_value_t = 2)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Capture a dataset from the portal and merge it into the stored one
    Capture {
        /// Dataset to capture: "offerings" or "students"
        kind: DatasetKind,
        /// Selection parameter as key=value, e.g. course=123 (repeatable)
        #[arg(long, short, value_parser = parse_selection)]
        select: Vec<(String, String)>,
        /// Academic period as YEAR/TERM; defaults to the portal's current period
        #[arg(long, short)]
        period: Option<String>,
        /// Rows enriched concurrently per batch
        #[arg(long, short)]
        batch_size: Option<usize>,
        /// Delay between batches in milliseconds
        #[arg(long, short)]
        delay: Option<u64>,
        /// Per-request timeout in milliseconds
        #[arg(long, short)]
        timeout: Option<u64>,
    },
    /// Print the stored dataset as CSV with derived columns
    Show {
        kind: DatasetKind,
        /// Filter as column=value, case-insensitive substring (repeatable)
        #[arg(long, short)]
        filter: Vec<Filter>,
        /// Column to sort by
        #[arg(long, short)]
        sort: Option<String>,
    },
    /// Write the stored CSV blob to a file
    Export {
        kind: DatasetKind,
        /// Path to output file
        output_file: String,
    },
    /// Remove the stored dataset of one kind; the reference cache is kept
    Clear { kind: DatasetKind },
    /// Inspect or seed the course reference cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List every known code and name
    List,
    /// Remember a name for a code
    Put { code: String, name: String },
    /// Print the name known for a code
    Get { code: String },
}

fn parse_selection(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("Invalid selection, expected key=value: {input}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            3 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .init();

    let mut config = PortalConfig::load(cli.config.as_deref())?;
    if let Command::Capture {
        batch_size,
        delay,
        timeout,
        ..
    } = &cli.command
    {
        apply_overrides(&mut config, *batch_size, *delay, *timeout)?;
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(&cli.db)?);
    let cookie = std::env::var(SESSION_COOKIE_ENV_NAME).ok();
    if cookie.is_some() {
        info!("Forwarding session cookie from {SESSION_COOKIE_ENV_NAME}");
    }
    let client = PortalClient::new(&config, cookie)?;
    let harvester = Harvester::new(config, Arc::new(client), store, Arc::new(LogNotifier));

    match cli.command {
        Command::Capture {
            kind,
            select,
            period,
            ..
        } => handle_capture_command(&harvester, kind, select, period).await,
        Command::Show { kind, filter, sort } => {
            let dataset = harvester.view(kind, &filter, sort.as_deref())?;
            print!("{}", dataset.to_csv()?);
            info!("{} {kind} shown", dataset.len());
            Ok(())
        }
        Command::Export { kind, output_file } => {
            let snapshot = harvester
                .snapshots()
                .read(kind)?
                .with_context(|| format!("No {kind} captured yet"))?;
            std::fs::write(&output_file, snapshot.blob.as_bytes())
                .with_context(|| format!("Failed to write {output_file}"))?;
            info!(
                "Exported {kind} captured at {} to {output_file}",
                snapshot.captured_at.to_rfc3339()
            );
            Ok(())
        }
        Command::Clear { kind } => harvester.clear(kind),
        Command::Cache { action } => handle_cache_command(&harvester, action),
    }
}

fn apply_overrides(
    config: &mut PortalConfig,
    batch_size: Option<usize>,
    delay: Option<u64>,
    timeout: Option<u64>,
) -> Result<()> {
    if let Some(batch_size) = batch_size {
        config.batch_size = batch_size;
    }
    if let Some(delay) = delay {
        config.batch_delay_ms = delay;
    }
    if let Some(timeout) = timeout {
        config.timeout_ms = timeout;
    }
    config.validate()
}

async fn handle_capture_command(
    harvester: &Harvester,
    kind: DatasetKind,
    select: Vec<(String, String)>,
    period: Option<String>,
) -> Result<()> {
    let mut selection: Selection = select.into_iter().collect();
    if let Some(period) = period {
        selection.insert(PERIOD_SELECTION_KEY.to_string(), period);
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let report = harvester.capture(kind, &selection, &cancel).await;
    for error in &report.row_errors {
        warn!("{error}");
    }
    println!("{}", report.summary());

    match report.status {
        CaptureStatus::Saved | CaptureStatus::SavedWithRowErrors => Ok(()),
        CaptureStatus::NotSaved => bail!("Captured {kind} were not saved"),
        CaptureStatus::Failed => bail!("Capture of {kind} failed"),
    }
}

fn handle_cache_command(harvester: &Harvester, action: CacheAction) -> Result<()> {
    let cache = harvester.cache();
    match action {
        CacheAction::List => {
            let cache = cache
                .lock()
                .map_err(|_| anyhow!("Reference cache mutex poisoned"))?;
            for (code, name) in cache.entries() {
                println!("{code}\t{name}");
            }
            Ok(())
        }
        CacheAction::Put { code, name } => {
            {
                let mut cache = cache
                    .lock()
                    .map_err(|_| anyhow!("Reference cache mutex poisoned"))?;
                cache.put(&code, &name);
            }
            harvester.save_cache()
        }
        CacheAction::Get { code } => {
            let cache = cache
                .lock()
                .map_err(|_| anyhow!("Reference cache mutex poisoned"))?;
            println!("{}", cache.get(&code));
            Ok(())
        }
    }
}
