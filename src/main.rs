//! # brgy-health: Barangay Health Maintenance Service
//!
//! Runs the scheduled maintenance for barangay health records: marks missed
//! follow-up visits and delivers staff notifications.
//!
//! Usage:
//!   brgy-health run                                  # Start the scheduler daemon
//!   brgy-health reconcile --as-of 2026-10-17         # One reconciliation pass
//!   brgy-health recipients --feature "PATIENT RECORDS"
//!   brgy-health jobs                                 # Configured jobs + recent runs
//!   brgy-health init-config                          # Write default config

mod jobs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use brgy_core::BrgyConfig;
use brgy_records::{FollowUpReconciler, RecordsDb, resolve_recipients};
use brgy_scheduler::{SchedulerDb, SchedulerEngine, spawn_scheduler};
use chrono::{FixedOffset, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "brgy-health",
    version,
    about = "Barangay health records maintenance: missed follow-ups and staff notifications"
)]
struct Cli {
    /// Config file (default: ~/.brgy/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path, overrides the config value
    #[arg(long)]
    database: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and run until Ctrl-C
    Run,
    /// Run follow-up reconciliation once
    Reconcile {
        /// Run date (YYYY-MM-DD), default today in barangay local time
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Grace period in days, default from config
        #[arg(long)]
        grace: Option<u32>,
    },
    /// Resolve notification recipients for a feature
    Recipients {
        #[arg(long)]
        feature: String,
        /// Staff category, default from config
        #[arg(long)]
        category: Option<String>,
        /// Staff id to leave out (usually the actor)
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Show configured jobs with next run times and recent history
    Jobs {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn local_offset(config: &BrgyConfig) -> Result<FixedOffset> {
    FixedOffset::east_opt(config.scheduler.utc_offset_minutes * 60)
        .with_context(|| format!("invalid utc_offset_minutes: {}", config.scheduler.utc_offset_minutes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "brgy_health=debug,brgy_scheduler=debug,brgy_records=debug"
    } else {
        "brgy_health=info,brgy_scheduler=info,brgy_records=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(BrgyConfig::default_path);

    if let Command::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            println!("Config already exists at {} (use --force to overwrite)", config_path.display());
            return Ok(());
        }
        BrgyConfig::default().save_to(&config_path)?;
        println!("Wrote default config to {}", config_path.display());
        return Ok(());
    }

    let mut config = if config_path.exists() {
        BrgyConfig::load_from(&config_path)?
    } else {
        tracing::info!("No config at {}, using defaults", config_path.display());
        BrgyConfig::default()
    };
    if let Some(db) = &cli.database {
        config.database_path = db.clone();
    }
    config.validate()?;

    let db_path = config.database_path();
    let db = Arc::new(
        RecordsDb::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    let offset = local_offset(&config)?;

    match cli.command {
        Command::Run => run_daemon(&config, db, offset, &db_path).await,
        Command::Reconcile { as_of, grace } => {
            let as_of = as_of.unwrap_or_else(|| Utc::now().with_timezone(&offset).date_naive());
            let grace = grace.unwrap_or(config.followups.grace_period_days);
            let reconciler = FollowUpReconciler::from_config(db, &config.followups, offset);
            let report = reconciler.reconcile_followups(as_of, grace)?;
            println!("Reconciled follow-ups as of {as_of} (grace {grace}d): {report}");
            Ok(())
        }
        Command::Recipients {
            feature,
            category,
            exclude,
        } => {
            let category = category.unwrap_or_else(|| config.followups.staff_category.clone());
            let people = resolve_recipients(&db, &feature, &category, exclude.as_deref())?;
            if people.is_empty() {
                println!("No recipients for '{feature}' ({category})");
            }
            for person in people {
                println!("{person}");
            }
            Ok(())
        }
        Command::Jobs { limit } => {
            let mut engine = SchedulerEngine::new(offset);
            jobs::register_jobs(&mut engine, &config, db, offset)?;
            for job in engine.list_jobs() {
                let next = job
                    .next_run
                    .map(|t| t.with_timezone(&offset).to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!("{:<24} {:<32} next: {}", job.id, job.name, next);
            }

            let history = SchedulerDb::open(&db_path)?;
            let runs = history.recent_runs(None, limit)?;
            if !runs.is_empty() {
                println!("\nRecent runs:");
            }
            for run in runs {
                println!(
                    "  {} {:<24} {} {}",
                    run.started_at.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S"),
                    run.job_id,
                    if run.ok { "ok  " } else { "FAIL" },
                    run.message
                );
            }
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

async fn run_daemon(
    config: &BrgyConfig,
    db: Arc<RecordsDb>,
    offset: FixedOffset,
    db_path: &std::path::Path,
) -> Result<()> {
    let mut engine = SchedulerEngine::new(offset);
    if config.scheduler.record_history {
        engine.attach_history_db(SchedulerDb::open(db_path)?);
    }
    let registered = jobs::register_jobs(&mut engine, config, db, offset)?;

    println!("brgy-health v{}", env!("CARGO_PKG_VERSION"));
    println!("   Database:  {}", db_path.display());
    println!("   Jobs:      {registered}");
    println!("   Offset:    {offset}");
    println!();

    let engine = Arc::new(Mutex::new(engine));
    let handle = spawn_scheduler(engine, config.scheduler.check_interval_secs);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    handle.shutdown().await;
    Ok(())
}
