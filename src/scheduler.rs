//! Publish-cadence-aware scheduling with exponential backoff.
//!
//! The scheduler keeps one [`PublishProfile`] per title in a JSON tracking
//! store (`state_dir/schedule.json`). After each run it records what
//! happened, reclassifies the title's cadence from its recent observations,
//! and decides which titles the next run should check.
//!
//! # Cadence rules
//!
//! | Cadence | Due when |
//! |---------|----------|
//! | daily, unknown, irregular | every run |
//! | weekday | every run falling on Monday to Friday |
//! | weekly | 7 days after the last observation |
//! | semiweekly | 3 days after the last observation |
//!
//! A classification below [`CONFIDENCE_THRESHOLD`] is treated as unknown.
//! Backoff applies on top of every cadence.

use crate::error::StoreError;
use crate::models::{Cadence, PublishProfile};
use crate::utils::{quarantine, write_atomic};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Below this a classification is not acted upon.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

const WINDOW_DAYS: i64 = 28;
const MIN_OBSERVATIONS: usize = 3;
const MIN_SPAN_DAYS: i64 = 7;
const MAX_OBSERVATIONS: usize = 56;
const DAILY_RATIO: f64 = 0.85;
const WEEKDAY_COVERAGE: f64 = 0.8;
const MAX_GAP_VARIATION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_hours(base_hours: i64, max_hours: i64) -> Self {
        Self {
            base: Duration::hours(base_hours),
            max: Duration::hours(max_hours),
        }
    }

    /// `min(base * 2^(level-1), max)`; zero at level 0.
    pub fn interval(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::zero();
        }
        let factor = 1i32.checked_shl(level - 1).filter(|f| *f > 0).unwrap_or(i32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Classify a title's cadence from the dates content was found on.
///
/// Only the last four weeks (ending at the newest observation) are used.
/// Returns the cadence and a confidence in `0.0..=1.0`.
pub fn classify(observations: &[NaiveDate]) -> (Cadence, f64) {
    let Some(&last) = observations.iter().max() else {
        return (Cadence::Unknown, 0.0);
    };
    let start = last - Duration::days(WINDOW_DAYS - 1);
    let mut window: Vec<NaiveDate> = observations.iter().copied().filter(|d| *d >= start).collect();
    window.sort_unstable();
    window.dedup();

    if window.len() < MIN_OBSERVATIONS {
        return (Cadence::Unknown, 0.0);
    }
    let first = window[0];
    let span = (last - first).num_days() + 1;
    if span < MIN_SPAN_DAYS {
        return (Cadence::Unknown, 0.0);
    }

    let n = window.len() as f64;
    let daily_ratio = n / span as f64;
    if daily_ratio >= DAILY_RATIO {
        return (Cadence::Daily, daily_ratio.min(1.0));
    }

    let is_weekend = |d: &NaiveDate| matches!(d.weekday(), Weekday::Sat | Weekday::Sun);
    let span_weekdays = first
        .iter_days()
        .take(span as usize)
        .filter(|d| !is_weekend(d))
        .count();
    let span_weekends = span as usize - span_weekdays;
    let on_weekends = window.iter().filter(|d| is_weekend(*d)).count();
    let on_weekdays = window.len() - on_weekends;
    if span_weekdays > 0 {
        let coverage = on_weekdays as f64 / span_weekdays as f64;
        let weekend_share = on_weekends as f64 / span_weekends.max(1) as f64;
        if coverage >= WEEKDAY_COVERAGE && weekend_share <= 0.15 {
            return (Cadence::Weekday, (coverage * (1.0 - weekend_share)).min(1.0));
        }
    }

    let gaps: Vec<f64> = window
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days() as f64)
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    let variation = variance.sqrt() / mean;
    let regularity = (1.0 - variation).clamp(0.0, 1.0);

    if variation <= MAX_GAP_VARIATION {
        if (5.0..=9.0).contains(&mean) {
            return (Cadence::Weekly, regularity);
        }
        if (2.0..5.0).contains(&mean) {
            return (Cadence::Semiweekly, regularity);
        }
    }
    (Cadence::Irregular, (n / 8.0).min(1.0))
}

/// Days to wait after the last observation, for interval-based cadences.
fn expected_interval(cadence: Cadence) -> Option<Duration> {
    match cadence {
        Cadence::Weekly => Some(Duration::days(7)),
        Cadence::Semiweekly => Some(Duration::days(3)),
        _ => None,
    }
}

#[derive(Debug)]
pub struct PublishScheduler {
    path: PathBuf,
    policy: BackoffPolicy,
    profiles: BTreeMap<String, PublishProfile>,
}

impl PublishScheduler {
    pub fn new(path: impl Into<PathBuf>, policy: BackoffPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            profiles: BTreeMap::new(),
        }
    }

    /// Load the tracking store. A missing file starts empty; an unparseable
    /// one is moved aside to `.corrupt` and also starts empty.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>, policy: BackoffPolicy) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut scheduler = Self::new(path, policy);
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No tracking store yet; starting fresh");
                return Ok(scheduler);
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(profiles) => {
                scheduler.profiles = profiles;
                info!(titles = scheduler.profiles.len(), "Loaded tracking store");
            }
            Err(e) => {
                let moved = quarantine(path).await?;
                warn!(error = %e, moved_to = %moved.display(), "Tracking store unreadable; starting fresh");
            }
        }
        Ok(scheduler)
    }

    #[instrument(level = "info", skip_all, fields(path = %self.path.display(), titles = self.profiles.len()))]
    pub async fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.profiles)?;
        write_atomic(&self.path, &json).await?;
        info!("Saved tracking store");
        Ok(())
    }

    pub fn profile(&self, slug: &str) -> Option<&PublishProfile> {
        self.profiles.get(slug)
    }

    pub fn profiles(&self) -> impl Iterator<Item = (&String, &PublishProfile)> {
        self.profiles.iter()
    }

    fn effective_cadence(profile: &PublishProfile) -> Cadence {
        if profile.confidence >= CONFIDENCE_THRESHOLD {
            profile.cadence
        } else {
            Cadence::Unknown
        }
    }

    /// Earliest instant the title may be checked again, ignoring weekday
    /// rules. `None` means no constraint.
    pub fn next_due(&self, slug: &str) -> Option<DateTime<Utc>> {
        let profile = self.profiles.get(slug)?;
        let backoff_until = match (profile.backoff_level, profile.last_attempt) {
            (0, _) | (_, None) => None,
            (level, Some(at)) => Some(at + self.policy.interval(level)),
        };
        let interval_until = expected_interval(Self::effective_cadence(profile)).and_then(|interval| {
            let last = profile.observations.last()?;
            (*last + interval).and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
        });
        backoff_until.into_iter().chain(interval_until).max()
    }

    /// Whether `slug` should be checked by a run happening at `now`.
    pub fn is_due(&self, slug: &str, now: DateTime<Utc>) -> bool {
        let Some(profile) = self.profiles.get(slug) else {
            return true;
        };
        if self.next_due(slug).is_some_and(|due| now < due) {
            return false;
        }
        match Self::effective_cadence(profile) {
            Cadence::Weekday => !matches!(now.weekday(), Weekday::Sat | Weekday::Sun),
            _ => true,
        }
    }

    /// Content was found for `date`: record it, reset backoff, reclassify.
    pub fn record_success(&mut self, slug: &str, date: NaiveDate, now: DateTime<Utc>) {
        let profile = self.profiles.entry(slug.to_string()).or_default();
        if let Err(pos) = profile.observations.binary_search(&date) {
            profile.observations.insert(pos, date);
        }
        if profile.observations.len() > MAX_OBSERVATIONS {
            let excess = profile.observations.len() - MAX_OBSERVATIONS;
            profile.observations.drain(..excess);
        }
        profile.backoff_level = 0;
        profile.last_success = Some(now);
        profile.last_attempt = Some(now);
        let (cadence, confidence) = classify(&profile.observations);
        if cadence != profile.cadence {
            info!(slug, from = %profile.cadence, to = %cadence, confidence, "Cadence reclassified");
        }
        profile.cadence = cadence;
        profile.confidence = confidence;
    }

    /// Nothing published for the date: a normal outcome, backoff unchanged.
    pub fn record_not_found(&mut self, slug: &str, now: DateTime<Utc>) {
        let profile = self.profiles.entry(slug.to_string()).or_default();
        profile.last_attempt = Some(now);
    }

    /// Failed after in-run retries: push the next check out exponentially.
    pub fn record_failure(&mut self, slug: &str, now: DateTime<Utc>) {
        let profile = self.profiles.entry(slug.to_string()).or_default();
        profile.backoff_level = profile.backoff_level.saturating_add(1);
        profile.last_attempt = Some(now);
        debug!(
            slug,
            level = profile.backoff_level,
            interval_hours = self.policy.interval(profile.backoff_level).num_hours(),
            "Backoff increased"
        );
    }
}
