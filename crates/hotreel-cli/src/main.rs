use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hotreel_core::{
    JobState, ProgressEvent, ProgressKind, ScrapeConfig, DEFAULT_UPDATE_INTERVAL_MINUTES,
};
use hotreel_engine::{EngineConfig, Orchestrator};
use hotreel_storage::{list_stored_runs, DEFAULT_PRIMARY_PREFIX};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hotreel")]
#[command(about = "Scrape the hottest listing, enrich each item, and store the batches")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape job in the foreground; Ctrl-C stops it cleanly.
    Run {
        #[arg(long, default_value_t = 10)]
        count: u32,
        #[arg(long)]
        headless: bool,
        #[arg(long)]
        auto_update: bool,
        /// Minutes between recurring runs (at least 30, default 30).
        #[arg(long)]
        interval: Option<u32>,
    },
    /// Serve the trigger and progress API.
    Serve,
    /// List stored primary batches, newest first.
    Runs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Run {
            count,
            headless,
            auto_update,
            interval,
        } => {
            let scrape = ScrapeConfig {
                item_count: count,
                headless,
                auto_update,
                update_interval_minutes: interval
                    .or_else(|| auto_update.then_some(DEFAULT_UPDATE_INTERVAL_MINUTES)),
            };
            run_foreground(config, scrape).await?;
        }
        Commands::Serve => {
            let orchestrator = Orchestrator::with_default_adapters(config)?;
            hotreel_web::serve(orchestrator).await?;
        }
        Commands::Runs => {
            let runs = list_stored_runs(&config.data_dir, DEFAULT_PRIMARY_PREFIX)?;
            if runs.is_empty() {
                println!("no stored runs under {}", config.data_dir.display());
            }
            for run in runs {
                let rows = run
                    .rows
                    .map(|rows| rows.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!("{}  rows={}  {}", run.display_name, rows, run.path.display());
            }
        }
    }

    Ok(())
}

async fn run_foreground(config: EngineConfig, scrape: ScrapeConfig) -> Result<()> {
    let recurring = scrape.recurrence_minutes().is_some();
    let orchestrator = Orchestrator::with_default_adapters(config)?;
    let mut events = orchestrator.subscribe();
    let job_id = orchestrator.start(scrape).await?;
    println!("started job {job_id}");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !stopping => {
                signal.context("listening for ctrl-c")?;
                stopping = true;
                if !orchestrator.stop().await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(event.kind, ProgressKind::Finished { .. }) && (stopping || !recurring) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    orchestrator.wait_idle().await;
    let status = orchestrator.status().await;
    match status.last_job {
        Some(job) if job.state == JobState::Failed => {
            let reason = job
                .outcome
                .and_then(|outcome| outcome.failure)
                .map(|failure| failure.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!("job {} failed: {reason}", job.id)
        }
        Some(job) => {
            if let Some(outcome) = job.outcome {
                println!(
                    "job {} complete: records={} skipped={}",
                    job.id, outcome.records, outcome.skipped
                );
                if let Some(stored) = outcome.stored {
                    println!("stored {} rows at {}", stored.rows, stored.path.display());
                }
            }
            Ok(())
        }
        None => Ok(()),
    }
}

fn print_event(event: &ProgressEvent) {
    let at = event.at.format("%H:%M:%S");
    match event.kind {
        ProgressKind::Update => println!("[{at}] {}", event.message),
        ProgressKind::Finished { success } => {
            let label = if success { "done" } else { "failed" };
            println!("[{at}] {label}: {}", event.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse_into_a_recurring_request() {
        let cli = Cli::parse_from([
            "hotreel",
            "run",
            "--count",
            "5",
            "--headless",
            "--auto-update",
            "--interval",
            "45",
        ]);
        match cli.command {
            Some(Commands::Run {
                count,
                headless,
                auto_update,
                interval,
            }) => {
                assert_eq!(count, 5);
                assert!(headless);
                assert!(auto_update);
                assert_eq!(interval, Some(45));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
