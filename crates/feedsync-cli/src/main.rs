use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedsync_sync::{CycleOutcome, SyncConfig, SyncPipeline};
use serde_json::json;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Reconcile ATS job groupings into the published XML job feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle
    Sync,
    /// Compute and print the plan without writing anything
    Plan,
    /// Run a cycle on every cron firing until interrupted
    Schedule {
        /// Overrides FEED_SYNC_CRON
        #[arg(long)]
        cron: Option<String>,
    },
    /// Parse a feed and report what it holds
    Validate {
        /// Defaults to FEED_PATH
        path: Option<PathBuf>,
    },
    /// Regenerate reference numbers for the given job ids
    RefreshRefs {
        ids: Vec<String>,
        /// Regenerate every job's reference number
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },
    /// Summarize recent cycle reports
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config)?;
            let outcome = pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let CycleOutcome::Blocked { alert } = outcome {
                bail!("feed update blocked: {}", alert.reason);
            }
        }
        Commands::Plan => {
            let pipeline = SyncPipeline::from_config(config)?;
            let dry_run = pipeline.plan_only().await?;
            println!("{}", serde_json::to_string_pretty(&dry_run)?);
        }
        Commands::Schedule { cron } => {
            let mut config = config;
            config.scheduler_enabled = true;
            if let Some(cron) = cron {
                config.sync_cron = cron;
            }
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config)?);
            let Some(mut sched) = feedsync_sync::maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Validate { path } => {
            let path = path.unwrap_or(config.feed_path);
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let (document, stats) = feedsync_core::parse_with_stats(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            let missing_reference: Vec<&str> = document
                .jobs()
                .iter()
                .filter(|job| job.reference_number().is_empty())
                .map(|job| job.id.as_str())
                .collect();
            let report = json!({
                "path": path.display().to_string(),
                "jobs": document.len(),
                "duplicates_dropped": stats.duplicates,
                "unidentified_dropped": stats.unidentified,
                "missing_reference_numbers": missing_reference,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::RefreshRefs { ids, all } => {
            if ids.is_empty() && !all {
                bail!("pass job ids or --all");
            }
            let pipeline = SyncPipeline::from_config(config)?;
            let changes = pipeline.refresh_reference_numbers(&ids).await?;
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        Commands::Report { runs } => {
            let markdown = feedsync_sync::report_recent_cycles(&config.reports_dir, runs)?;
            println!("{markdown}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FEEDSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "feedsync=debug,info"
        } else {
            "feedsync=info,warn"
        })
    });

    let format = env::var("FEEDSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init(),
    }
}
