//! # daily_feed_sync
//!
//! A periodic batch synchronizer that works out "today's item" for many
//! independently published titles, fetches it despite anti-automation
//! measures, and merges the results into durable, deduplicated per-title
//! RSS feeds.
//!
//! ## Architecture
//!
//! The crate is organised leaves first:
//! 1. **Sessions and pool**: [`session::SessionStore`] persists opaque
//!    login artifacts; [`pool::FetchPool`] bounds concurrent browser work
//! 2. **Sources**: [`sources::SourceAdapter`] fetches a title for a date,
//!    dispatching on the title's explicit [`models::Capability`]
//! 3. **Scheduling and feeds**: [`scheduler::PublishScheduler`] learns each
//!    title's cadence and applies backoff; [`feeds::FeedStore`] merges,
//!    caps and atomically writes feed files
//! 4. **Orchestration**: [`orchestrator::Orchestrator`] drives a run over a
//!    [`orchestrator::RunContext`] and returns a [`orchestrator::RunSummary`]
//!
//! ## Usage
//!
//! ```ignore
//! let config = RunConfig::load(Path::new("config.yaml"))?;
//! let ctx = RunContext::from_config(&config).await?;
//! let summary = Orchestrator::new(&ctx).run(&config.titles, today).await;
//! ctx.shutdown().await?;
//! println!("{summary}");
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod feeds;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod sources;
pub mod utils;
