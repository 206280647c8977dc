//! Data models shared by every stage of a sync run.
//!
//! This module defines the core data structures used throughout the crate:
//! - [`Title`]: A single independently-published title and how to fetch it
//! - [`Capability`]: The closed set of fetch strategies a title can use
//! - [`FetchResult`]: What one successful fetch produced (transient)
//! - [`FeedEntry`]: The durable per-date record written to a title's feed
//! - [`PublishProfile`]: Scheduling state tracked between runs
//! - [`SessionCredential`]: An opaque authenticated-session artifact

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// How a title's content is fetched.
///
/// Dispatch is always driven by this explicit field; nothing inspects a page
/// or a source at runtime to decide which strategy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Plain HTTP; media is located through embedded JSON-LD metadata.
    StructuredData,
    /// Rendered in a pooled browser with a stored session; one media element.
    AuthenticatedBrowser,
    /// Rendered in a pooled browser with a stored session; one or more panels.
    MultiPanelBrowser,
}

impl Capability {
    /// Whether fetching requires a pooled browser instance.
    pub fn needs_browser(self) -> bool {
        !matches!(self, Capability::StructuredData)
    }

    /// Whether fetching requires a valid [`SessionCredential`] for the source.
    pub fn needs_session(self) -> bool {
        self.needs_browser()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::StructuredData => "structured_data",
            Capability::AuthenticatedBrowser => "authenticated_browser",
            Capability::MultiPanelBrowser => "multi_panel_browser",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An independently-published title.
///
/// The `slug` doubles as the key into the scheduler's tracking store, so a
/// title's [`PublishProfile`] is always found by slug rather than held here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Title {
    /// Stable identifier; also the feed file name.
    pub slug: String,
    /// Human-readable name used in feed item titles.
    pub name: String,
    /// Source identifier (key into the configured sources).
    pub source: String,
    /// Fetch strategy for this title.
    pub capability: Capability,
    /// Source-specific path component substituted into the URL template.
    /// Defaults to the slug when absent.
    #[serde(default)]
    pub path: Option<String>,
}

impl Title {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.slug)
    }
}

/// One media reference in a fetch result, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MediaItem {
    pub url: String,
    pub order: usize,
}

/// The content found for a title on a given date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub slug: String,
    pub date: NaiveDate,
    pub media: Vec<MediaItem>,
    /// The page the media was found on.
    pub source_url: String,
    /// SHA-256 over the ordered media URLs.
    pub fingerprint: String,
}

impl FetchResult {
    /// Build a result from media URLs in document order.
    pub fn new(slug: &str, date: NaiveDate, urls: Vec<String>, source_url: &str) -> Self {
        let fingerprint = fingerprint(&urls);
        let media = urls
            .into_iter()
            .enumerate()
            .map(|(order, url)| MediaItem { url, order })
            .collect();
        Self {
            slug: slug.to_string(),
            date,
            media,
            source_url: source_url.to_string(),
            fingerprint,
        }
    }
}

/// Hex SHA-256 of the media URLs joined by newlines.
pub fn fingerprint(urls: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(urls.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A durable feed item. Unique per (title, identifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub slug: String,
    pub title: String,
    pub date: NaiveDate,
    pub link: String,
    pub media: Vec<MediaItem>,
    /// Stable across re-fetches: derived from slug and date only.
    pub identifier: String,
    pub published: DateTime<Utc>,
    pub categories: Vec<String>,
}

impl FeedEntry {
    /// The identifier a `(slug, date)` pair always maps to.
    pub fn identifier_for(slug: &str, date: NaiveDate) -> String {
        format!("{}-{}", slug, date.format("%Y-%m-%d"))
    }

    pub fn from_result(title: &Title, result: &FetchResult) -> Self {
        let published = result
            .date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_default();
        Self {
            slug: title.slug.clone(),
            title: format!("{} - {}", title.name, result.date.format("%Y-%m-%d")),
            date: result.date,
            link: result.source_url.clone(),
            media: result.media.clone(),
            identifier: Self::identifier_for(&title.slug, result.date),
            published,
            categories: vec![title.source.clone(), title.capability.to_string()],
        }
    }
}

/// Classified publishing frequency of a title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekday,
    Weekly,
    Semiweekly,
    Irregular,
    #[default]
    Unknown,
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cadence::Daily => "daily",
            Cadence::Weekday => "weekday",
            Cadence::Weekly => "weekly",
            Cadence::Semiweekly => "semiweekly",
            Cadence::Irregular => "irregular",
            Cadence::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Scheduling state for one title, persisted in the tracking store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PublishProfile {
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default)]
    pub confidence: f64,
    /// Dates on which content was actually found, ascending, deduplicated.
    #[serde(default)]
    pub observations: Vec<NaiveDate>,
    #[serde(default)]
    pub backoff_level: u32,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

/// An authenticated browser session handed over by the interactive login step.
///
/// `blob` is never interpreted by this crate; it is stored, aged and forwarded.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub source: String,
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub max_age_days: i64,
    /// Set after an adapter reported the session as rejected.
    pub stale: bool,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("source", &self.source)
            .field("blob_len", &self.blob.len())
            .field("created_at", &self.created_at)
            .field("max_age_days", &self.max_age_days)
            .field("stale", &self.stale)
            .finish()
    }
}
