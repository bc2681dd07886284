use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use jobhound_core::Status;
use jobhound_storage::{load_preferences, save_preferences, StatusTracker};
use jobhound_sync::{build_scheduler, report_recent, Pipeline, RunParams, RunSummary, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobhound")]
#[command(about = "Daily job search digest: fetch, rank, track")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and write today's snapshot.
    Run {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        top: u64,
    },
    /// List tracked jobs, optionally only one status.
    List {
        #[arg(long)]
        status: Option<Status>,
    },
    /// Move a tracked job to another status.
    Mark {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        status: Status,
        #[arg(long)]
        note: Option<String>,
    },
    /// Edit skip/priority companies and the city whitelist.
    Prefs {
        #[arg(long)]
        add_skip: Option<String>,
        #[arg(long)]
        add_priority: Option<String>,
        /// Comma separated, replaces the current list.
        #[arg(long)]
        set_cities: Option<String>,
    },
    /// Markdown digest of recent daily snapshots.
    Report {
        #[arg(long, default_value_t = 7)]
        days: usize,
    },
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        top: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn run_params(days: u32, top: u64) -> RunParams {
    RunParams {
        window_days: days,
        top_n: usize::try_from(top).unwrap_or(usize::MAX),
    }
}

fn print_summary(summary: &RunSummary) {
    for line in &summary.logs {
        println!("{line}");
    }
    if summary.skipped {
        println!("quiet hours: run skipped, nothing written");
        return;
    }
    println!();
    for (rank, job) in summary.selected.iter().enumerate() {
        let entry = &job.entry;
        let marker = if job.is_new { "NEW " } else { "" };
        println!(
            "{:>2}. {marker}{:.2}  {} | {} | {} | {}",
            rank + 1,
            entry.score,
            entry.company,
            entry.title,
            entry.location,
            entry.post_date
        );
        println!("    {}  [{}]", entry.url, entry.reasons.join("; "));
        println!("    job_id={}", entry.job_id);
    }
    if let Some(paths) = &summary.snapshot {
        println!();
        println!("snapshot: {}", paths.document.display());
        println!("table:    {}", paths.table.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let paths = config.state_paths();

    match cli.command.unwrap_or(Commands::Run { days: 7, top: 10 }) {
        Commands::Run { days, top } => {
            let pipeline = Pipeline::from_config(config).await?;
            let summary = pipeline.run_once(run_params(days, top)).await?;
            print_summary(&summary);
        }
        Commands::List { status } => {
            let tracker = StatusTracker::load(&paths.status).await;
            let records = tracker.list(status);
            if records.is_empty() {
                println!("no tracked jobs");
            }
            for (job_id, record) in records {
                println!(
                    "{:<12} {} | {} | {} | {job_id}",
                    record.status.as_str(),
                    record.company,
                    record.title,
                    record.url
                );
            }
        }
        Commands::Mark {
            job_id,
            status,
            note,
        } => {
            let mut tracker = StatusTracker::load(&paths.status).await;
            let record = tracker
                .transition(&job_id, status, note.as_deref(), Local::now().fixed_offset())
                .with_context(|| format!("marking {job_id} as {status}"))?;
            println!("{job_id}: {} | {} -> {}", record.company, record.title, record.status);
            tracker.save(&paths.status).await?;
        }
        Commands::Prefs {
            add_skip,
            add_priority,
            set_cities,
        } => {
            let mut prefs = load_preferences(&paths.preferences).await;
            if let Some(company) = add_skip.as_deref() {
                prefs.add_skip(company);
            }
            if let Some(company) = add_priority.as_deref() {
                prefs.add_priority(company);
            }
            if let Some(csv) = set_cities.as_deref() {
                if !prefs.set_cities(csv) {
                    anyhow::bail!("--set-cities needs at least one city");
                }
            }
            save_preferences(&paths.preferences, &prefs).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&prefs).context("rendering preferences")?
            );
        }
        Commands::Report { days } => {
            println!("{}", report_recent(&config, days).await?);
        }
        Commands::Schedule { days, top } => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let cron = pipeline.config().run_cron.clone();
            let mut sched = build_scheduler(pipeline, run_params(days, top)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            println!("scheduled on `{cron}`; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_match_daily_digest() {
        let cli = Cli::parse_from(["jobhound", "run"]);
        assert!(matches!(cli.command, Some(Commands::Run { days: 7, top: 10 })));
    }

    #[test]
    fn mark_parses_status_names() {
        let cli = Cli::parse_from([
            "jobhound", "mark", "--job-id", "abc", "--status", "interviewing", "--note", "round 2",
        ]);
        match cli.command {
            Some(Commands::Mark { job_id, status, note }) => {
                assert_eq!(job_id, "abc");
                assert_eq!(status, Status::Interviewing);
                assert_eq!(note.as_deref(), Some("round 2"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn zero_top_and_unknown_status_are_rejected() {
        assert!(Cli::try_parse_from(["jobhound", "run", "--top", "0"]).is_err());
        assert!(Cli::try_parse_from(["jobhound", "list", "--status", "ghosted"]).is_err());
    }
}
