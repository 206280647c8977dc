//! Run configuration loaded from a YAML file.
//!
//! ```yaml
//! feeds_dir: ./feeds
//! state_dir: ./state
//! sessions_dir: ./sessions
//! workers: 8
//! pool_size: 2
//! feed_cap: 30
//! browser:
//!   endpoint: http://localhost:3000
//! sources:
//!   gocomics:
//!     url_template: https://www.gocomics.com/{path}/{yyyy}/{mm}/{dd}
//!   kingdom:
//!     url_template: https://comicskingdom.com/{path}/{date}
//!     media_selector: "img#theComicImage"
//!     login_markers: ["form.login-form"]
//! titles:
//!   - slug: garfield
//!     name: Garfield
//!     source: gocomics
//!     capability: structured_data
//! ```
//!
//! Every tuning knob has a default; only `sources` and `titles` must be given.

use crate::error::ConfigError;
use crate::models::{Capability, Title};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// How to reach a source and recognise its pages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Human-readable source name used in feed descriptions.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Date-specific page URL; see [`crate::utils::expand_url_template`].
    pub url_template: String,
    /// Selector for the single primary media element (authenticated browser).
    #[serde(default)]
    pub media_selector: Option<String>,
    /// Selector matching every panel image, in document order (multi-panel).
    #[serde(default)]
    pub panel_selector: Option<String>,
    /// Selectors whose presence means the session was rejected.
    #[serde(default)]
    pub login_markers: Vec<String>,
    /// Page text meaning nothing was published for the date.
    #[serde(default)]
    pub not_found_markers: Vec<String>,
    /// Additional URL regexes to treat as promotional or placeholder art.
    #[serde(default)]
    pub placeholder_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_browser_endpoint(),
            token: None,
        }
    }
}

fn default_browser_endpoint() -> String {
    "http://localhost:3000".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default = "default_feeds_dir")]
    pub feeds_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Titles in flight at once (M).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Browser instances (K).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_feed_cap")]
    pub feed_cap: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_backoff_base_hours")]
    pub backoff_base_hours: i64,
    #[serde(default = "default_backoff_max_hours")]
    pub backoff_max_hours: i64,
    #[serde(default = "default_session_max_age_days")]
    pub session_max_age_days: i64,

    #[serde(default)]
    pub browser: BrowserConfig,
    pub sources: BTreeMap<String, SourceConfig>,
    pub titles: Vec<Title>,
}

fn default_feeds_dir() -> PathBuf {
    PathBuf::from("feeds")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}
fn default_workers() -> usize {
    8
}
fn default_pool_size() -> usize {
    2
}
fn default_feed_cap() -> usize {
    30
}
fn default_fetch_timeout_secs() -> u64 {
    60
}
fn default_settle_ms() -> u64 {
    2500
}
fn default_acquire_timeout_secs() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_backoff_base_hours() -> i64 {
    2
}
fn default_backoff_max_hours() -> i64 {
    72
}
fn default_session_max_age_days() -> i64 {
    crate::session::DEFAULT_MAX_AGE_DAYS
}

impl RunConfig {
    /// Read and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml_str(&raw)?;
        info!(
            path = %path.display(),
            titles = config.titles.len(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.feed_cap == 0 {
            return Err(ConfigError::Invalid("feed_cap must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.backoff_base_hours <= 0 || self.backoff_max_hours < self.backoff_base_hours {
            return Err(ConfigError::Invalid(
                "backoff_max_hours must be >= backoff_base_hours > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for title in &self.titles {
            if !seen.insert(title.slug.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate title slug {}", title.slug)));
            }
            let Some(source) = self.sources.get(&title.source) else {
                return Err(ConfigError::Invalid(format!(
                    "title {} references unknown source {}",
                    title.slug, title.source
                )));
            };
            match title.capability {
                Capability::AuthenticatedBrowser if source.media_selector.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "source {} needs media_selector for authenticated_browser titles",
                        title.source
                    )));
                }
                Capability::MultiPanelBrowser if source.panel_selector.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "source {} needs panel_selector for multi_panel_browser titles",
                        title.source
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}
