use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use apev_sync::{PublishReport, RunOutcome, RunReport, SyncConfig, SyncPipeline};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_PARTIAL_PUBLISH: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "apev-cli")]
#[command(about = "Accumulates the rolling police-events feed into a deduplicated master dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, snapshot, merge and publish once.
    Sync,
    /// Merge an already stored snapshot into the master and publish.
    Merge {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Retry every artifact a destination has not confirmed.
    Publish,
    Status,
    /// Markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run on APEV_SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn run_exit_code(report: &RunReport) -> ExitCode {
    match report.outcome {
        RunOutcome::Complete => ExitCode::SUCCESS,
        RunOutcome::PartialPublish => ExitCode::from(EXIT_PARTIAL_PUBLISH),
    }
}

fn publish_exit_code(report: &PublishReport) -> ExitCode {
    if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PARTIAL_PUBLISH)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = SyncPipeline::new(config)?.run_once().await?;
            print_json(&report)?;
            Ok(run_exit_code(&report))
        }
        Commands::Merge { date } => {
            let report = SyncPipeline::new(config)?.merge_stored_snapshot(date).await?;
            print_json(&report)?;
            Ok(run_exit_code(&report))
        }
        Commands::Publish => {
            let report = SyncPipeline::new(config)?.publish_pending().await?;
            print_json(&report)?;
            Ok(publish_exit_code(&report))
        }
        Commands::Status => {
            let status = SyncPipeline::new(config)?.status().await?;
            print_json(&status)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { runs } => {
            println!("{}", apev_sync::recent_runs_markdown(&config.data_dir, runs)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = apev_sync::maybe_build_scheduler(pipeline.clone()).await? else {
                anyhow::bail!("scheduler disabled; set APEV_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
