//! # daily_feed_sync
//!
//! Command-line entry point: loads the YAML configuration, sets up logging
//! and runs one of the subcommands against the library core.
//!
//! ## Usage
//!
//! ```sh
//! daily_feed_sync --config config.yaml run
//! daily_feed_sync import-session --source kingdom --file kingdom.cookies
//! daily_feed_sync status
//! ```
//!
//! A run exits non-zero only when the run itself could not be set up or torn
//! down; per-title failures are reported in the printed summary.

use chrono::Utc;
use clap::Parser;
use daily_feed_sync::config::RunConfig;
use daily_feed_sync::orchestrator::{Orchestrator, RunContext};
use daily_feed_sync::scheduler::{BackoffPolicy, PublishScheduler};
use daily_feed_sync::session::SessionStore;
use std::error::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    debug!(config = %args.config.display(), command = ?args.command, "Parsed CLI arguments");

    let mut config = RunConfig::load(&args.config)?;
    if let Some(endpoint) = args.browser_endpoint {
        config.browser.endpoint = endpoint;
    }
    if args.browser_token.is_some() {
        config.browser.token = args.browser_token;
    }

    match args.command {
        Command::Run {
            date,
            workers,
            pool_size,
            only,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(pool_size) = pool_size {
                config.pool_size = pool_size;
            }
            config.validate()?;
            run(&config, date.unwrap_or_else(|| Utc::now().date_naive()), &only).await?;
        }
        Command::ImportSession {
            source,
            file,
            max_age_days,
        } => {
            if !config.sources.contains_key(&source) {
                warn!(%source, "Importing a session for a source that is not configured");
            }
            let blob = tokio::fs::read(&file).await?;
            let store = SessionStore::new(&config.sessions_dir, config.session_max_age_days);
            let mut credential = store.credential_from_blob(&source, blob, Utc::now());
            if let Some(days) = max_age_days {
                credential.max_age_days = days;
            }
            store.save(&source, &credential).await?;
            println!(
                "Stored session for {} ({} bytes, assumed valid for {} days)",
                source,
                credential.blob.len(),
                credential.max_age_days
            );
        }
        Command::Status => status(&config).await?,
    }
    Ok(())
}

async fn run(config: &RunConfig, date: chrono::NaiveDate, only: &[String]) -> Result<(), Box<dyn Error>> {
    let start_time = std::time::Instant::now();
    let titles: Vec<_> = config
        .titles
        .iter()
        .filter(|t| only.is_empty() || only.contains(&t.slug))
        .cloned()
        .collect();
    if titles.is_empty() {
        warn!(?only, "No titles selected");
        return Ok(());
    }
    info!(%date, titles = titles.len(), "daily_feed_sync starting up");

    let ctx = RunContext::from_config(config).await?;
    let summary = Orchestrator::new(&ctx).run(&titles, date).await;
    if let Err(e) = ctx.shutdown().await {
        error!(error = %e, "Failed to persist scheduler state");
        return Err(e.into());
    }
    print!("{summary}");

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        failures = summary.failures(),
        "Execution complete"
    );
    Ok(())
}

async fn status(config: &RunConfig) -> Result<(), Box<dyn Error>> {
    let policy = BackoffPolicy::from_hours(config.backoff_base_hours, config.backoff_max_hours);
    let scheduler = PublishScheduler::load(config.state_dir.join("schedule.json"), policy).await?;
    let now = Utc::now();

    println!(
        "{:<28} {:<11} {:>6} {:>8}  {:<4} {}",
        "TITLE", "CADENCE", "CONF", "BACKOFF", "DUE", "NEXT"
    );
    for title in &config.titles {
        let profile = scheduler.profile(&title.slug).cloned().unwrap_or_default();
        let next = scheduler
            .next_due(&title.slug)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<11} {:>6.2} {:>8}  {:<4} {}",
            title.slug,
            profile.cadence.to_string(),
            profile.confidence,
            profile.backoff_level,
            if scheduler.is_due(&title.slug, now) { "yes" } else { "no" },
            next
        );
    }
    Ok(())
}
