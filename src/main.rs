use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crossing_history::{
    ingest, plan, read_csv, Config, DatasetConfig, HistoryStore, IngestContext, RunOutcome,
};

/// Historize small-boat crossing snapshots into a versioned SQLite table.
#[derive(Parser, Debug)]
#[command(name = "crossing-history", version)]
struct Cli {
    /// History database (overrides the config file)
    #[arg(long, global = true, env = "CROSSING_HISTORY_DB")]
    database: Option<PathBuf>,

    /// JSON config with dataset definitions (built-in presets otherwise)
    #[arg(long, global = true, env = "CROSSING_HISTORY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the history tables
    Init,

    /// Merge a raw CSV snapshot into a dataset's history
    Ingest {
        #[arg(long)]
        dataset: String,

        /// CSV export of the upstream table; repeat to merge several files as one snapshot
        #[arg(long, required = true)]
        input: Vec<PathBuf>,

        /// Run date (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Source artifact name for every row (defaults to each input's file name)
        #[arg(long)]
        artifact: Option<String>,

        /// Show the change set without writing it
        #[arg(long)]
        dry_run: bool,

        /// Accept a snapshot with no rows (closes every current row)
        #[arg(long)]
        allow_empty: bool,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Current rows of a dataset
    Current {
        #[arg(long)]
        dataset: String,
    },

    /// Version of one business key valid on a date
    AsOf {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        key: NaiveDate,
        #[arg(long)]
        date: NaiveDate,
    },

    /// Every business key as it stood on a date
    Snapshot {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        date: NaiveDate,
    },

    /// All versions of one business key
    History {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        key: NaiveDate,
    },

    /// Applied runs of a dataset, newest first
    Runs {
        #[arg(long)]
        dataset: String,
    },

    /// Verify history invariants (all configured datasets by default)
    Check {
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Configured datasets and their row counts
    Datasets,

    /// Print the effective configuration as JSON
    ShowConfig,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::builtin(),
    };
    if let Some(database) = cli.database {
        config.database = database;
    }

    match cli.command {
        Command::Init => {
            open_store(&config.database)?;
            println!("✓ History database ready at {}", config.database.display());
        }

        Command::Ingest {
            dataset,
            input,
            as_of,
            artifact,
            dry_run,
            allow_empty,
            json,
        } => {
            let dataset = config.dataset(&dataset)?;
            let options = IngestOptions {
                as_of,
                artifact,
                dry_run,
                allow_empty,
            };
            let outcome = run_ingest(&config.database, dataset, &input, options)?;

            if json {
                print_json(&outcome)?;
            } else {
                print_outcome(&outcome);
            }
        }

        Command::Current { dataset } => {
            let dataset = config.dataset(&dataset)?;
            let store = open_store(&config.database)?;
            print_json(&store.current_rows(&dataset.name)?)?;
        }

        Command::AsOf { dataset, key, date } => {
            let dataset = config.dataset(&dataset)?;
            let store = open_store(&config.database)?;
            match store.as_of(&dataset.name, key, date)? {
                Some(row) => print_json(&row)?,
                None => {
                    eprintln!("No version of {} valid on {}", key, date);
                    return Ok(ExitCode::from(2));
                }
            }
        }

        Command::Snapshot { dataset, date } => {
            let dataset = config.dataset(&dataset)?;
            let store = open_store(&config.database)?;
            print_json(&store.snapshot_as_of(&dataset.name, date)?)?;
        }

        Command::History { dataset, key } => {
            let dataset = config.dataset(&dataset)?;
            let store = open_store(&config.database)?;
            print_json(&store.history(&dataset.name, key)?)?;
        }

        Command::Runs { dataset } => {
            let dataset = config.dataset(&dataset)?;
            let store = open_store(&config.database)?;
            print_json(&store.runs(&dataset.name)?)?;
        }

        Command::Check { dataset } => {
            let names: Vec<String> = match dataset {
                Some(name) => vec![config.dataset(&name)?.name.clone()],
                None => config.datasets.iter().map(|d| d.name.clone()).collect(),
            };
            let store = open_store(&config.database)?;

            let mut critical = false;
            for name in names {
                let report = store.verify(&name)?;
                let mark = if report.has_critical_issues() { "❌" } else { "✓" };
                println!("{} {}", mark, report.summary());
                for issue in &report.issues {
                    println!(
                        "   {:?} {} {}: {}",
                        issue.severity, issue.business_key, issue.record_id, issue.issue
                    );
                }
                critical |= report.has_critical_issues();
            }

            if critical {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Datasets => {
            let store = open_store(&config.database)?;
            let stats = store.datasets()?;

            for dataset in &config.datasets {
                match stats.iter().find(|s| s.dataset == dataset.name) {
                    Some(stat) => println!(
                        "{:<12} {:>6} current {:>7} versions  last change {}",
                        stat.dataset,
                        stat.current_rows,
                        stat.total_versions,
                        stat.last_change.map(|d| d.to_string()).unwrap_or_default()
                    ),
                    None => println!("{:<12} (empty)", dataset.name),
                }
            }
        }

        Command::ShowConfig => print_json(&config)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn open_store(path: &Path) -> Result<HistoryStore> {
    HistoryStore::open(path)
        .with_context(|| format!("Failed to open history database {}", path.display()))
}

struct IngestOptions {
    as_of: Option<NaiveDate>,
    artifact: Option<String>,
    dry_run: bool,
    allow_empty: bool,
}

fn run_ingest(
    database: &Path,
    dataset: &DatasetConfig,
    inputs: &[PathBuf],
    options: IngestOptions,
) -> Result<RunOutcome> {
    // Every file is part of the same snapshot; rows keep their own file name
    let mut rows = Vec::new();
    for input in inputs {
        let mut file_rows = read_csv(input)?;
        if let Some(artifact) = &options.artifact {
            for row in &mut file_rows {
                row.artifact = Some(artifact.clone());
            }
        }
        rows.append(&mut file_rows);
    }

    if rows.is_empty() && !options.allow_empty {
        // An empty export would close every current row
        bail!("input contains no rows, pass --allow-empty to historize an empty snapshot");
    }

    let mut ctx = IngestContext::new(options.as_of.unwrap_or_else(|| Local::now().date_naive()));
    ctx.artifact = options.artifact;

    let mut store = open_store(database)?;
    let outcome = if options.dry_run {
        plan(&store, dataset, &rows, &ctx)
    } else {
        ingest(&mut store, dataset, &rows, &ctx)
    }
    .with_context(|| format!("Run for dataset `{}` failed", dataset.name))?;

    Ok(outcome)
}

fn print_outcome(outcome: &RunOutcome) {
    let changes = &outcome.changes;
    let title = if outcome.dry_run { "🔍 Dry run" } else { "💾 Applied" };

    println!("{} {} as of {}", title, changes.dataset, changes.as_of);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Records in snapshot: {}", outcome.records);
    println!("✓ Added:     {}", changes.counts.added);
    println!("✓ Changed:   {}", changes.counts.changed);
    println!("✓ Removed:   {}", changes.counts.removed);
    println!("✓ Unchanged: {}", changes.counts.unchanged);

    for closure in &changes.closures {
        println!(
            "   close {} ({}) ending {}",
            closure.record_id, closure.business_key, closure.end_date
        );
    }
    for row in &changes.inserts {
        println!("   open  {} ({}) from {}", row.record_id, row.business_key, row.begin_date);
    }

    match &outcome.run {
        Some(run) => println!("✓ Run {} (digest {})", run.run_id, &run.digest[..12]),
        None if !outcome.dry_run => println!("✓ Nothing to apply"),
        None => {}
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
