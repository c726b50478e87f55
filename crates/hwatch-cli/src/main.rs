use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use hwatch_core::parse_event_date;
use hwatch_sync::{open_store, status_changes_digest, SyncConfig, SyncRuntime};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hwatch-cli")]
#[command(about = "Congressional hearing watch")]
struct Cli {
    /// Reference day for "upcoming" (defaults to the local date).
    #[arg(long, global = true, value_parser = parse_today)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest new hearings and meetings from both listings.
    Sync,
    /// Re-check status (and date) of upcoming stored events.
    Refresh,
    /// Fill document URLs for upcoming events stored without one.
    BackfillUrls,
    /// Upcoming stored events grouped by date.
    Upcoming,
    /// Upcoming events from the most recent insertion batch.
    Latest,
    /// Upcoming events no longer marked Scheduled.
    Changed,
    /// Sync, refresh and backfill, then print the upcoming digest.
    Run,
}

fn parse_today(raw: &str) -> Result<NaiveDate, String> {
    parse_event_date(raw).map_err(|err| err.to_string())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .context("installing tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let today = cli
        .today
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync);
    match command {
        Commands::Sync => {
            let runtime = SyncRuntime::open(config).await?;
            let summary = runtime.sync(today).await;
            runtime.close().await;
            let summary = summary?;
            println!("sync complete: run_id={} {}", summary.run_id, summary.counts);
            println!("{}", summary.digest());
        }
        Commands::Refresh => {
            let runtime = SyncRuntime::open(config).await?;
            let summary = runtime.refresh_statuses(today).await;
            runtime.close().await;
            let summary = summary?;
            println!("refresh complete: {summary}");
            println!("{}", status_changes_digest(&summary.changes));
        }
        Commands::BackfillUrls => {
            let runtime = SyncRuntime::open(config).await?;
            let summary = runtime.backfill_urls(today).await;
            runtime.close().await;
            println!("backfill complete: {}", summary?);
        }
        Commands::Upcoming | Commands::Latest | Commands::Changed => {
            let store = open_store(&config).await?;
            let digest = match command {
                Commands::Latest => hwatch_report::latest_digest(&store, today).await,
                Commands::Changed => hwatch_report::changed_digest(&store, today).await,
                _ => hwatch_report::upcoming_digest(&store, today).await,
            };
            store.close().await;
            println!("{}", digest.context("building digest")?);
        }
        Commands::Run => {
            let runtime = SyncRuntime::open(config).await?;
            let outcome = run_all(&runtime, today).await;
            runtime.close().await;
            println!("{}", outcome?);
        }
    }

    Ok(())
}

async fn run_all(runtime: &SyncRuntime, today: NaiveDate) -> Result<String> {
    let sync = runtime.sync(today).await?;
    let refresh = runtime.refresh_statuses(today).await?;
    let backfill = runtime.backfill_urls(today).await?;
    info!(run_id = %sync.run_id, %refresh, %backfill, "all passes finished");

    let upcoming = hwatch_report::upcoming_digest(runtime.store(), today)
        .await
        .context("building upcoming digest")?;
    Ok([
        format!("sync: {}", sync.counts),
        format!("refresh: {refresh}"),
        format!("backfill: {backfill}"),
        String::new(),
        sync.digest(),
        String::new(),
        status_changes_digest(&refresh.changes),
        String::new(),
        upcoming,
    ]
    .join("\n"))
}
