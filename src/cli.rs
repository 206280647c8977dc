//! Command-line interface definitions for daily_feed_sync.
//!
//! This module defines the CLI arguments and subcommands using the `clap` crate.
//! Connection settings can also be provided through environment variables.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the daily_feed_sync application.
///
/// # Examples
///
/// ```sh
/// # Check every due title for today
/// daily_feed_sync --config feeds.yaml run
///
/// # Re-check two titles for a past date with more browser instances
/// daily_feed_sync run --date 2025-06-25 --pool-size 4 --only garfield,calvin
///
/// # Hand over a session exported by the interactive login step
/// daily_feed_sync import-session --source kingdom --file kingdom.cookies
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML run configuration
    #[arg(short, long, env = "DAILY_FEED_SYNC_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Rendering service endpoint (overrides `browser.endpoint`)
    #[arg(long, env = "BROWSERLESS_URL")]
    pub browser_endpoint: Option<String>,

    /// Rendering service token (overrides `browser.token`)
    #[arg(long, env = "BROWSERLESS_TOKEN", hide_env_values = true)]
    pub browser_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Fetch every due title and merge results into its feed
    Run {
        /// Target date (YYYY-MM-DD); defaults to today in UTC
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Titles in flight at once
        #[arg(short, long, env = "DAILY_FEED_SYNC_WORKERS")]
        workers: Option<usize>,

        /// Browser instances in the pool
        #[arg(short, long, env = "DAILY_FEED_SYNC_POOL_SIZE")]
        pool_size: Option<usize>,

        /// Only check these slugs (comma separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },

    /// Store a session blob produced by the interactive login step
    ImportSession {
        /// Source identifier the session belongs to
        #[arg(long)]
        source: String,

        /// File holding the opaque session blob
        #[arg(long)]
        file: PathBuf,

        /// Days before the session is assumed expired
        #[arg(long)]
        max_age_days: Option<i64>,
    },

    /// Print each title's cadence, backoff and next due time
    Status,
}
