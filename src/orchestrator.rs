//! Run driver: decides what to check, fetches it, and records what happened.
//!
//! # Flow per title
//!
//! 1. Skip when the scheduler says the title is not due
//! 2. Skip when the title's source needs re-authentication
//! 3. Fetch through the title's [`SourceAdapter`], retrying bot challenges
//!    and transient failures up to `max_attempts` with exponential delay
//! 4. Merge a result into the feed, or update the scheduler for the failure
//!
//! No single title's failure aborts the run. The [`RunSummary`] returned at
//! the end groups every title by outcome and is the run's failure report.
//!
//! All run-scoped state (pool, stores, scheduler, HTTP client) lives in a
//! [`RunContext`] that is built at run start and torn down with
//! [`RunContext::shutdown`].

use crate::browser::{BrowserDriver, BrowserlessDriver};
use crate::config::{RunConfig, SourceConfig};
use crate::error::{FetchError, SetupError, StoreError};
use crate::feeds::FeedStore;
use crate::models::{FetchResult, PublishProfile, SessionCredential, Title};
use crate::pool::{FetchPool, PoolStats};
use crate::scheduler::{BackoffPolicy, PublishScheduler};
use crate::session::{SessionProblem, SessionStore};
use crate::sources::{FetchEnv, SourceAdapter};
use crate::utils::ensure_writable_dir;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use rand::{rng, Rng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

const USER_AGENT: &str = concat!("daily_feed_sync/", env!("CARGO_PKG_VERSION"));

/// How a title's check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutcomeKind {
    /// A new entry was merged into the feed.
    Added,
    /// Fetched, but the feed already had this date.
    AlreadyPresent,
    /// Nothing published for the date.
    NotFound,
    /// The scheduler did not consider the title due.
    NotDue,
    /// The source's session is missing, stale or expired; not attempted.
    NeedsReauth,
    /// The session was rejected during this run.
    AuthExpired,
    BotChallenge,
    Transient,
    StructureChanged,
    ResourceExhaustion,
    /// Fetched, but the feed file could not be written.
    StoreFailed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Added => "added",
            OutcomeKind::AlreadyPresent => "already present",
            OutcomeKind::NotFound => "not found",
            OutcomeKind::NotDue => "not due",
            OutcomeKind::NeedsReauth => "needs re-authentication",
            OutcomeKind::AuthExpired => "auth expired",
            OutcomeKind::BotChallenge => "bot challenge",
            OutcomeKind::Transient => "transient failure",
            OutcomeKind::StructureChanged => "structure changed",
            OutcomeKind::ResourceExhaustion => "resource exhaustion",
            OutcomeKind::StoreFailed => "store failed",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            OutcomeKind::AuthExpired
                | OutcomeKind::BotChallenge
                | OutcomeKind::Transient
                | OutcomeKind::StructureChanged
                | OutcomeKind::ResourceExhaustion
                | OutcomeKind::StoreFailed
        )
    }

    fn from_error(err: &FetchError) -> Self {
        match err {
            FetchError::NotFound => OutcomeKind::NotFound,
            FetchError::BotChallenge(_) => OutcomeKind::BotChallenge,
            FetchError::AuthExpired(_) => OutcomeKind::AuthExpired,
            FetchError::StructureChanged { .. } => OutcomeKind::StructureChanged,
            FetchError::Transient(_) => OutcomeKind::Transient,
            FetchError::ResourceExhaustion(_) => OutcomeKind::ResourceExhaustion,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate result of one run, grouped by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub date: Option<NaiveDate>,
    pub by_outcome: BTreeMap<OutcomeKind, Vec<String>>,
    /// Sources whose session must be renewed by the interactive login step.
    pub needs_reauth: BTreeSet<String>,
}

impl RunSummary {
    fn record(&mut self, slug: String, kind: OutcomeKind) {
        self.by_outcome.entry(kind).or_default().push(slug);
    }

    pub fn slugs(&self, kind: OutcomeKind) -> &[String] {
        self.by_outcome.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.slugs(kind).len()
    }

    pub fn failures(&self) -> usize {
        self.by_outcome
            .iter()
            .filter(|(kind, _)| kind.is_failure())
            .map(|(_, slugs)| slugs.len())
            .sum()
    }

    /// Emit one log line per outcome kind.
    pub fn log(&self) {
        for (kind, slugs) in &self.by_outcome {
            if kind.is_failure() {
                warn!(outcome = %kind, count = slugs.len(), titles = %slugs.join(", "), "Run outcome");
            } else {
                info!(outcome = %kind, count = slugs.len(), titles = %slugs.join(", "), "Run outcome");
            }
        }
        if !self.needs_reauth.is_empty() {
            warn!(
                sources = %self.needs_reauth.iter().join(", "),
                "Sources need re-authentication"
            );
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => writeln!(f, "Run summary for {date}")?,
            None => writeln!(f, "Run summary")?,
        }
        for (kind, slugs) in &self.by_outcome {
            writeln!(f, "  {:<24}{:>4}  {}", kind.as_str(), slugs.len(), slugs.join(", "))?;
        }
        if !self.needs_reauth.is_empty() {
            writeln!(f, "  re-authenticate: {}", self.needs_reauth.iter().join(", "))?;
        }
        Ok(())
    }
}

/// Knobs copied out of the config for the duration of a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub settle: Duration,
    pub fetch_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl From<&RunConfig> for RunSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base: config.retry_base(),
            settle: config.settle(),
            fetch_timeout: config.fetch_timeout(),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

/// Everything one run owns. Built at run start, torn down at run end.
pub struct RunContext<D> {
    settings: RunSettings,
    sources: BTreeMap<String, SourceConfig>,
    http: reqwest::Client,
    pool: FetchPool<D>,
    sessions: SessionStore,
    feeds: FeedStore,
    scheduler: tokio::sync::Mutex<PublishScheduler>,
}

impl RunContext<BrowserlessDriver> {
    /// Build a context whose pool launches Browserless-backed instances.
    #[instrument(level = "info", skip_all, fields(workers = config.workers, pool_size = config.pool_size))]
    pub async fn from_config(config: &RunConfig) -> Result<Self, SetupError> {
        ensure_writable_dir(&config.feeds_dir).await?;
        ensure_writable_dir(&config.state_dir).await?;

        let endpoint = config.browser.endpoint.clone();
        let token = config.browser.token.clone();
        let timeout = config.fetch_timeout();
        let pool = FetchPool::new(config.pool_size, move |id| {
            BrowserlessDriver::new(id, &endpoint, token.as_deref(), timeout)
        });

        let policy = BackoffPolicy::from_hours(config.backoff_base_hours, config.backoff_max_hours);
        let scheduler = PublishScheduler::load(config.state_dir.join("schedule.json"), policy).await?;
        Self::new(config, pool, scheduler)
    }
}

impl<D: BrowserDriver> RunContext<D> {
    pub fn new(config: &RunConfig, pool: FetchPool<D>, scheduler: PublishScheduler) -> Result<Self, SetupError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.fetch_timeout())
            .build()?;
        Ok(Self {
            settings: RunSettings::from(config),
            sources: config.sources.clone(),
            http,
            pool,
            sessions: SessionStore::new(&config.sessions_dir, config.session_max_age_days),
            feeds: FeedStore::new(&config.feeds_dir, config.feed_cap).with_source_names(
                config
                    .sources
                    .iter()
                    .filter_map(|(id, s)| s.display_name.clone().map(|name| (id.clone(), name)))
                    .collect(),
            ),
            scheduler: tokio::sync::Mutex::new(scheduler),
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn feeds(&self) -> &FeedStore {
        &self.feeds
    }

    pub async fn profile(&self, slug: &str) -> Option<PublishProfile> {
        self.scheduler.lock().await.profile(slug).cloned()
    }

    /// Close every pooled instance and persist scheduler state.
    #[instrument(level = "info", skip_all)]
    pub async fn shutdown(self) -> Result<PoolStats, StoreError> {
        let stats = self.pool.stats();
        self.pool.shutdown().await;
        self.scheduler.lock().await.save().await?;
        info!(
            peak_in_use = stats.peak_in_use,
            live = stats.live,
            size = stats.size,
            "Run context torn down"
        );
        Ok(stats)
    }
}

/// Drives one run over a [`RunContext`].
pub struct Orchestrator<'a, D> {
    ctx: &'a RunContext<D>,
}

impl<'a, D: BrowserDriver> Orchestrator<'a, D> {
    pub fn new(ctx: &'a RunContext<D>) -> Self {
        Self { ctx }
    }

    /// Check every title for `date`, at most `workers` at a time.
    #[instrument(level = "info", skip_all, fields(%date, titles = titles.len()))]
    pub async fn run(&self, titles: &[Title], date: NaiveDate) -> RunSummary {
        let started = Instant::now();
        let now = Utc::now();
        let (sessions, blocked) = self.check_sessions(titles, now).await;
        let blocked = Mutex::new(blocked);

        info!(
            workers = self.ctx.settings.workers,
            pool_size = self.ctx.pool.size(),
            "Starting run"
        );
        let outcomes: Vec<(String, OutcomeKind)> = stream::iter(titles.iter())
            .map(|title| {
                let sessions = &sessions;
                let blocked = &blocked;
                async move {
                    let kind = self.run_title(title, date, now, sessions, blocked).await;
                    (title.slug.clone(), kind)
                }
            })
            .buffer_unordered(self.ctx.settings.workers)
            .collect()
            .await;

        let mut summary = RunSummary {
            date: Some(date),
            needs_reauth: blocked.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
            ..Default::default()
        };
        for (slug, kind) in outcomes {
            summary.record(slug, kind);
        }
        for slugs in summary.by_outcome.values_mut() {
            slugs.sort();
        }
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failures = summary.failures(),
            "Run complete"
        );
        summary.log();
        summary
    }

    /// Load sessions for every source that has browser titles. Sources that
    /// cannot be used this run come back in the blocked set.
    async fn check_sessions(
        &self,
        titles: &[Title],
        now: DateTime<Utc>,
    ) -> (HashMap<String, SessionCredential>, BTreeSet<String>) {
        let mut usable = HashMap::new();
        let mut blocked = BTreeSet::new();
        let sources = titles
            .iter()
            .filter(|t| t.capability.needs_session())
            .map(|t| t.source.as_str())
            .unique();
        for source in sources {
            match self.ctx.sessions.usable(source, now).await {
                Ok(Ok(credential)) => {
                    debug!(source, "Session usable");
                    usable.insert(source.to_string(), credential);
                }
                Ok(Err(problem)) => {
                    let reason = match problem {
                        SessionProblem::Missing => "missing",
                        SessionProblem::Stale => "stale",
                        SessionProblem::LikelyExpired => "likely expired",
                    };
                    warn!(source, reason, "Session unusable; skipping source's authenticated titles");
                    blocked.insert(source.to_string());
                }
                Err(e) => {
                    error!(source, error = %e, "Failed to read session; skipping source's authenticated titles");
                    blocked.insert(source.to_string());
                }
            }
        }
        (usable, blocked)
    }

    fn is_blocked(blocked: &Mutex<BTreeSet<String>>, source: &str) -> bool {
        blocked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(source)
    }

    #[instrument(level = "info", skip_all, fields(slug = %title.slug, source = %title.source))]
    async fn run_title(
        &self,
        title: &Title,
        date: NaiveDate,
        now: DateTime<Utc>,
        sessions: &HashMap<String, SessionCredential>,
        blocked: &Mutex<BTreeSet<String>>,
    ) -> OutcomeKind {
        if !self.ctx.scheduler.lock().await.is_due(&title.slug, now) {
            debug!("Not due");
            return OutcomeKind::NotDue;
        }
        if title.capability.needs_session() && Self::is_blocked(blocked, &title.source) {
            info!("Source needs re-authentication; skipping");
            return OutcomeKind::NeedsReauth;
        }
        let Some(source) = self.ctx.sources.get(&title.source) else {
            error!("Title references an unknown source");
            return OutcomeKind::StructureChanged;
        };

        let result = match SourceAdapter::for_title(title, source) {
            Ok(adapter) => {
                let env = FetchEnv {
                    http: &self.ctx.http,
                    pool: &self.ctx.pool,
                    session: sessions.get(&title.source),
                    settle: self.ctx.settings.settle,
                    fetch_timeout: self.ctx.settings.fetch_timeout,
                    acquire_timeout: self.ctx.settings.acquire_timeout,
                };
                self.fetch_with_retry(&adapter, title, date, &env, blocked).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(fetched) => self.store(title, date, now, fetched).await,
            Err(err) => self.handle_failure(title, now, err, blocked).await,
        }
    }

    async fn fetch_with_retry(
        &self,
        adapter: &SourceAdapter,
        title: &Title,
        date: NaiveDate,
        env: &FetchEnv<'_, D>,
        blocked: &Mutex<BTreeSet<String>>,
    ) -> Result<FetchResult, FetchError> {
        let max_attempts = self.ctx.settings.max_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_t0 = Instant::now();
            match adapter.fetch(title, date, env).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self
                        .ctx
                        .settings
                        .retry_base
                        .saturating_mul(1u32 << (attempt - 1).min(16));
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + Duration::from_millis(jitter_ms);
                    warn!(
                        attempt,
                        max = max_attempts,
                        elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64,
                        ?delay,
                        error = %e,
                        "Fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                    if title.capability.needs_session() && Self::is_blocked(blocked, &title.source) {
                        return Err(FetchError::AuthExpired(title.source.clone()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn store(&self, title: &Title, date: NaiveDate, now: DateTime<Utc>, fetched: FetchResult) -> OutcomeKind {
        let merged = match self.ctx.feeds.merge(title, std::slice::from_ref(&fetched)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Nothing was stored, so the scheduler must not count this date.
                error!(error = %e, "Failed to write feed; title stays due");
                return OutcomeKind::StoreFailed;
            }
        };
        self.ctx.scheduler.lock().await.record_success(&title.slug, date, now);
        if merged.added > 0 {
            info!(media = fetched.media.len(), fingerprint = %fetched.fingerprint, "New entry");
            OutcomeKind::Added
        } else {
            OutcomeKind::AlreadyPresent
        }
    }

    async fn handle_failure(
        &self,
        title: &Title,
        now: DateTime<Utc>,
        err: FetchError,
        blocked: &Mutex<BTreeSet<String>>,
    ) -> OutcomeKind {
        let kind = OutcomeKind::from_error(&err);
        match &err {
            FetchError::NotFound => {
                info!("Nothing published for this date");
                self.ctx.scheduler.lock().await.record_not_found(&title.slug, now);
            }
            FetchError::BotChallenge(_) | FetchError::Transient(_) => {
                warn!(error = %err, "Fetch failed after retries; backing off");
                self.ctx.scheduler.lock().await.record_failure(&title.slug, now);
            }
            FetchError::AuthExpired(source) => {
                let first = blocked
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(source.clone());
                if first {
                    error!(%source, "Session rejected; skipping source for the rest of the run");
                    if let Err(e) = self.ctx.sessions.mark_stale(source).await {
                        error!(%source, error = %e, "Failed to mark session stale");
                    }
                }
            }
            FetchError::StructureChanged { url, detail } => {
                error!(%url, %detail, "Page structure changed; no viable media candidate");
            }
            FetchError::ResourceExhaustion(detail) => {
                warn!(%detail, "No browser instance available; will retry next run");
            }
        }
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{Probe, ScriptedDriver};
    use crate::models::Capability;
    use crate::utils::testing::{serve, Canned};
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const CONFIG: &str = r#"
workers: 1
pool_size: 1
max_attempts: 2
retry_base_ms: 1
settle_ms: 1
fetch_timeout_secs: 2
acquire_timeout_secs: 2
sources:
  kingdom:
    url_template: https://kingdom.example.com/{path}/{date}
    media_selector: img.strip
    panel_selector: div.panel img
    login_markers: ["form.login"]
  closed:
    url_template: http://127.0.0.1:9/{path}/{date}
titles: []
"#;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 25).unwrap()
    }

    fn title(slug: &str, source: &str, capability: Capability) -> Title {
        Title {
            slug: slug.into(),
            name: slug.to_uppercase(),
            source: source.into(),
            capability,
            path: None,
        }
    }

    fn page_url(slug: &str) -> String {
        format!("https://kingdom.example.com/{slug}/2025-06-25")
    }

    fn strip_page(slug: &str) -> String {
        format!(r#"<html><body><img class="strip" src="https://cdn.example.com/{slug}.png"></body></html>"#)
    }

    fn config(dir: &Path, workers: usize, pool_size: usize) -> RunConfig {
        let mut config = RunConfig::from_yaml_str(CONFIG).unwrap();
        config.feeds_dir = dir.join("feeds");
        config.state_dir = dir.join("state");
        config.sessions_dir = dir.join("sessions");
        config.workers = workers;
        config.pool_size = pool_size;
        config
    }

    fn context(
        config: &RunConfig,
        pages: HashMap<String, (u16, String)>,
        delay: Duration,
        probe: Arc<Probe>,
    ) -> RunContext<ScriptedDriver> {
        let pages = Arc::new(pages);
        let pool = FetchPool::new(config.pool_size, move |id| {
            Ok(ScriptedDriver::new(id, Arc::clone(&pages), delay, Arc::clone(&probe)))
        });
        let scheduler = PublishScheduler::new(
            config.state_dir.join("schedule.json"),
            BackoffPolicy::from_hours(config.backoff_base_hours, config.backoff_max_hours),
        );
        RunContext::new(config, pool, scheduler).unwrap()
    }

    async fn save_session(ctx: &RunContext<ScriptedDriver>, source: &str) {
        let cred = ctx.sessions().credential_from_blob(source, b"sid=abc".to_vec(), Utc::now());
        ctx.sessions().save(source, &cred).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_fetches_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 4, 2);
        let titles: Vec<_> = ["alpha", "beta", "gamma"]
            .iter()
            .map(|s| title(s, "kingdom", Capability::AuthenticatedBrowser))
            .collect();
        let pages = titles
            .iter()
            .map(|t| (page_url(&t.slug), (200, strip_page(&t.slug))))
            .collect();
        let ctx = context(&config, pages, Duration::from_millis(5), Arc::new(Probe::default()));
        save_session(&ctx, "kingdom").await;

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::Added), ["alpha", "beta", "gamma"]);
        assert_eq!(summary.failures(), 0);
        assert!(ctx.feeds().path_for("beta").exists());
        assert_eq!(ctx.profile("alpha").await.unwrap().observations, vec![date()]);

        let again = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(again.count(OutcomeKind::AlreadyPresent), 3);

        ctx.shutdown().await.unwrap();
        assert!(dir.path().join("state/schedule.json").exists());
    }

    #[tokio::test]
    async fn test_missing_session_skips_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2, 1);
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, HashMap::new(), Duration::ZERO, probe.clone());
        let titles = vec![
            title("alpha", "kingdom", Capability::AuthenticatedBrowser),
            title("beta", "kingdom", Capability::MultiPanelBrowser),
        ];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.count(OutcomeKind::NeedsReauth), 2);
        assert!(summary.needs_reauth.contains("kingdom"));
        assert_eq!(probe.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_expired_halts_source_and_marks_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1, 1);
        let login = r#"<html><body><form class="login"></form></body></html>"#.to_string();
        let pages = HashMap::from([
            (page_url("alpha"), (200, login.clone())),
            (page_url("beta"), (200, login)),
        ]);
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, pages, Duration::ZERO, probe.clone());
        save_session(&ctx, "kingdom").await;
        let titles = vec![
            title("alpha", "kingdom", Capability::AuthenticatedBrowser),
            title("beta", "kingdom", Capability::AuthenticatedBrowser),
        ];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::AuthExpired), ["alpha"]);
        assert_eq!(summary.slugs(OutcomeKind::NeedsReauth), ["beta"]);
        assert!(summary.needs_reauth.contains("kingdom"));
        assert_eq!(probe.renders.load(Ordering::SeqCst), 1);

        let stored = ctx.sessions().load("kingdom").await.unwrap().unwrap();
        assert!(stored.stale);
        assert_eq!(ctx.profile("alpha").await.map(|p| p.backoff_level), None);
    }

    #[tokio::test]
    async fn test_not_found_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1, 1);
        let ctx = context(&config, HashMap::new(), Duration::ZERO, Arc::new(Probe::default()));
        save_session(&ctx, "kingdom").await;
        let titles = vec![title("alpha", "kingdom", Capability::MultiPanelBrowser)];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::NotFound), ["alpha"]);
        assert_eq!(summary.failures(), 0);
        assert_eq!(ctx.profile("alpha").await.unwrap().backoff_level, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1, 1);
        let ctx = context(&config, HashMap::new(), Duration::ZERO, Arc::new(Probe::default()));
        let titles = vec![title("offline", "closed", Capability::StructuredData)];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::Transient), ["offline"]);
        assert_eq!(ctx.profile("offline").await.unwrap().backoff_level, 1);

        // Backoff now keeps the title out of the next run.
        let next = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(next.slugs(OutcomeKind::NotDue), ["offline"]);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_schedule_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1, 1);
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        config.feeds_dir = blocker;
        let titles = vec![title("alpha", "kingdom", Capability::AuthenticatedBrowser)];
        let pages = HashMap::from([(page_url("alpha"), (200, strip_page("alpha")))]);
        let ctx = context(&config, pages, Duration::ZERO, Arc::new(Probe::default()));
        save_session(&ctx, "kingdom").await;

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::StoreFailed), ["alpha"]);
        assert!(ctx.profile("alpha").await.is_none());
        assert!(ctx.scheduler.lock().await.is_due("alpha", Utc::now()));
    }

    #[tokio::test]
    async fn test_challenge_is_retried_up_to_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1, 1);
        config.max_attempts = 3;
        let challenge = "<html><head><title>Just a moment...</title></head></html>".to_string();
        let pages = HashMap::from([(page_url("alpha"), (200, challenge))]);
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, pages, Duration::ZERO, probe.clone());
        save_session(&ctx, "kingdom").await;
        let titles = vec![title("alpha", "kingdom", Capability::AuthenticatedBrowser)];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::BotChallenge), ["alpha"]);
        assert_eq!(probe.renders.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.profile("alpha").await.unwrap().backoff_level, 1);
    }

    #[tokio::test]
    async fn test_auth_expired_is_never_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1, 1);
        config.max_attempts = 3;
        let login = r#"<html><body><form class="login"></form></body></html>"#.to_string();
        let pages = HashMap::from([(page_url("alpha"), (200, login))]);
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, pages, Duration::ZERO, probe.clone());
        save_session(&ctx, "kingdom").await;
        let titles = vec![title("alpha", "kingdom", Capability::AuthenticatedBrowser)];

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.slugs(OutcomeKind::AuthExpired), ["alpha"]);
        assert_eq!(probe.renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_structured_titles_never_touch_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 8, 2);
        let strip = |slug: &str| {
            format!(
                r#"<html><head><script type="application/ld+json">
                {{"@type": "ImageObject", "contentUrl": "https://cdn.example.com/{slug}.gif", "datePublished": "June 25, 2025"}}
                </script></head><body></body></html>"#
            )
        };
        let structured: Vec<_> = (0..4).map(|i| format!("s{i}")).collect();
        let routes = structured
            .iter()
            .map(|slug| (format!("/{slug}/2025-06-25"), Canned::new(200, strip(slug.as_str()))))
            .collect();
        let base = serve(routes).await;
        config.sources.insert(
            "local".into(),
            SourceConfig {
                url_template: format!("{base}/{{path}}/{{date}}"),
                ..Default::default()
            },
        );
        let titles: Vec<_> = structured
            .iter()
            .map(|s| title(s, "local", Capability::StructuredData))
            .collect();
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, HashMap::new(), Duration::ZERO, probe.clone());

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.count(OutcomeKind::Added), 4);
        assert_eq!(probe.renders.load(Ordering::SeqCst), 0);
        let stats = ctx.shutdown().await.unwrap();
        assert_eq!(stats.peak_in_use, 0);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test]
    async fn test_mixed_run_bounds_only_browser_titles() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 8, 2);
        let routes = (0..4)
            .map(|i| {
                let body = format!(
                    r#"<html><body><img fetchpriority="high" src="https://cdn.example.com/h{i}.gif"></body></html>"#
                );
                (format!("/h{i}/2025-06-25"), Canned::new(200, body))
            })
            .collect();
        let base = serve(routes).await;
        config.sources.insert(
            "local".into(),
            SourceConfig {
                url_template: format!("{base}/{{path}}/{{date}}"),
                ..Default::default()
            },
        );
        let mut titles: Vec<_> = (0..4)
            .map(|i| title(&format!("h{i}"), "local", Capability::StructuredData))
            .collect();
        let browser: Vec<_> = (0..6)
            .map(|i| title(&format!("b{i}"), "kingdom", Capability::AuthenticatedBrowser))
            .collect();
        let pages = browser
            .iter()
            .map(|t| (page_url(&t.slug), (200, strip_page(&t.slug))))
            .collect();
        titles.extend(browser);
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, pages, Duration::from_millis(20), probe.clone());
        save_session(&ctx, "kingdom").await;

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.count(OutcomeKind::Added), 10);
        assert_eq!(probe.renders.load(Ordering::SeqCst), 6);
        assert!(probe.max_active.load(Ordering::SeqCst) <= 2);
        let stats = ctx.shutdown().await.unwrap();
        assert!(stats.peak_in_use <= 2);
    }

    #[tokio::test]
    async fn test_pool_bounds_browser_work_below_worker_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 8, 2);
        let titles: Vec<_> = (0..10)
            .map(|i| title(&format!("t{i}"), "kingdom", Capability::AuthenticatedBrowser))
            .collect();
        let pages = titles
            .iter()
            .map(|t| (page_url(&t.slug), (200, strip_page(&t.slug))))
            .collect();
        let probe = Arc::new(Probe::default());
        let ctx = context(&config, pages, Duration::from_millis(20), probe.clone());
        save_session(&ctx, "kingdom").await;

        let summary = Orchestrator::new(&ctx).run(&titles, date()).await;
        assert_eq!(summary.count(OutcomeKind::Added), 10);
        assert!(probe.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(probe.renders.load(Ordering::SeqCst), 10);

        let stats = ctx.shutdown().await.unwrap();
        assert!(stats.peak_in_use <= 2);
    }

    #[test]
    fn test_summary_display_groups_by_outcome() {
        let mut summary = RunSummary {
            date: Some(date()),
            ..Default::default()
        };
        summary.record("b".into(), OutcomeKind::Added);
        summary.record("a".into(), OutcomeKind::Added);
        summary.record("c".into(), OutcomeKind::StructureChanged);
        summary.needs_reauth.insert("kingdom".into());

        let text = summary.to_string();
        assert!(text.starts_with("Run summary for 2025-06-25"));
        assert!(text.contains("added"));
        assert!(text.contains("structure changed"));
        assert!(text.contains("re-authenticate: kingdom"));
        assert_eq!(summary.failures(), 1);
    }
}
