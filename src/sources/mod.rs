//! Source adapters: how today's item is located for each capability.
//!
//! Every title names its [`Capability`] explicitly and [`SourceAdapter::for_title`]
//! maps it onto one of three variants:
//!
//! | Capability | Adapter | Method |
//! |------------|---------|--------|
//! | `structured_data` | [`StructuredDataSource`] | Plain HTTP, JSON-LD date matching with DOM fallbacks |
//! | `authenticated_browser` | [`AuthenticatedBrowserSource`] | Pooled browser + session, single media element |
//! | `multi_panel_browser` | [`MultiPanelBrowserSource`] | Pooled browser + session, ordered panel list |
//!
//! All adapters report the same outcome set: a [`FetchResult`] or one of
//! `NotFound`, `BotChallenge`, `AuthExpired`, `StructureChanged`,
//! `Transient`, `ResourceExhaustion`.

pub mod browser;
pub mod structured;

pub use browser::{AuthenticatedBrowserSource, MultiPanelBrowserSource};
pub use structured::StructuredDataSource;

use crate::browser::BrowserDriver;
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::{Capability, FetchResult, SessionCredential, Title};
use crate::pool::FetchPool;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Everything an adapter may use during one fetch.
pub struct FetchEnv<'a, D> {
    pub http: &'a reqwest::Client,
    pub pool: &'a FetchPool<D>,
    pub session: Option<&'a SessionCredential>,
    pub settle: Duration,
    pub fetch_timeout: Duration,
    pub acquire_timeout: Duration,
}

/// The closed set of fetch strategies.
#[derive(Debug)]
pub enum SourceAdapter {
    StructuredData(StructuredDataSource),
    AuthenticatedBrowser(AuthenticatedBrowserSource),
    MultiPanelBrowser(MultiPanelBrowserSource),
}

impl SourceAdapter {
    /// Build the adapter named by `title.capability` for its source.
    pub fn for_title(title: &Title, source: &SourceConfig) -> Result<Self, FetchError> {
        let adapter = match title.capability {
            Capability::StructuredData => {
                SourceAdapter::StructuredData(StructuredDataSource::new(source))
            }
            Capability::AuthenticatedBrowser => {
                SourceAdapter::AuthenticatedBrowser(AuthenticatedBrowserSource::new(source)?)
            }
            Capability::MultiPanelBrowser => {
                SourceAdapter::MultiPanelBrowser(MultiPanelBrowserSource::new(source)?)
            }
        };
        Ok(adapter)
    }

    pub fn capability(&self) -> Capability {
        match self {
            SourceAdapter::StructuredData(_) => Capability::StructuredData,
            SourceAdapter::AuthenticatedBrowser(_) => Capability::AuthenticatedBrowser,
            SourceAdapter::MultiPanelBrowser(_) => Capability::MultiPanelBrowser,
        }
    }

    /// Fetch `title` for `date`.
    pub async fn fetch<D: BrowserDriver>(
        &self,
        title: &Title,
        date: NaiveDate,
        env: &FetchEnv<'_, D>,
    ) -> Result<FetchResult, FetchError> {
        match self {
            SourceAdapter::StructuredData(s) => s.fetch(title, date, env.http).await,
            SourceAdapter::AuthenticatedBrowser(s) => s.fetch(title, date, env).await,
            SourceAdapter::MultiPanelBrowser(s) => s.fetch(title, date, env).await,
        }
    }
}

static DEFAULT_PLACEHOLDERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)social[-_]?(share|card|fb|twitter|og)",
        r"(?i)(^|[/_.-])logo([/_.-]|$)",
        r"(?i)placeholder|fallback|default[-_]?(image|img|og|share)",
        r"(?i)coming[-_ ]?soon|promo|banner|advert",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid placeholder regex"))
    .collect()
});

/// Promotional and placeholder URL patterns that never represent daily content.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderFilter {
    extra: Vec<Regex>,
}

impl PlaceholderFilter {
    pub fn new(patterns: &[String]) -> Self {
        let extra = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid placeholder pattern");
                    None
                }
            })
            .collect();
        Self { extra }
    }

    pub fn is_placeholder(&self, url: &str) -> bool {
        DEFAULT_PLACEHOLDERS
            .iter()
            .chain(self.extra.iter())
            .any(|re| re.is_match(url))
    }
}

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid selector"));
static CHALLENGE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        r#"#cf-challenge-running, #challenge-form, #challenge-stage, [id^="cf-turnstile"], .cf-turnstile,
           #px-captcha, iframe[src*="challenges.cloudflare.com"], iframe[src*="captcha-delivery.com"]"#,
    )
    .expect("valid selector")
});

const CHALLENGE_TITLES: &[&str] = &["just a moment", "attention required", "access denied", "are you a robot"];

/// Whether a response is an anti-automation interstitial rather than content.
///
/// Only the interstitial's own structure counts: its `<title>` or a challenge
/// widget element. Challenge scripts that CDNs inject into ordinary pages
/// (`/cdn-cgi/challenge-platform/...`) are not a signal.
pub fn looks_like_challenge(status: u16, html: &str) -> bool {
    if matches!(status, 403 | 429 | 503) {
        return true;
    }
    let document = Html::parse_document(html);
    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|t| t.text().collect::<String>().to_lowercase())
        .unwrap_or_default();
    if CHALLENGE_TITLES.iter().any(|m| title.contains(m)) {
        return true;
    }
    document.select(&CHALLENGE_SELECTOR).next().is_some()
}

/// Whether the CDN flagged the response as a challenge (`cf-mitigated: challenge`).
pub fn mitigated_by_header(headers: &HeaderMap) -> bool {
    headers
        .get("cf-mitigated")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("challenge"))
}

/// Whether the page says nothing was published (status 404 or a configured marker).
pub fn looks_not_found(status: u16, html: &str, markers: &[String]) -> bool {
    if status == 404 {
        return true;
    }
    let lower = html.to_lowercase();
    markers
        .iter()
        .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
}

/// Resolve a possibly relative media URL against the page it was found on.
pub fn resolve_url(page_url: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    match Url::parse(page_url) {
        Ok(base) => base.join(raw).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(raw).ok().map(|u| u.to_string()),
    }
}
