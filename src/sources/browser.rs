//! Browser-backed adapters for sources that need a logged-in, rendered page.
//!
//! Both adapters share one critical section: check an instance out of the
//! pool, navigate with the stored session, wait for the page to settle and
//! read it back. The pool guard stays alive across all three steps. If the
//! sequence times out, the instance is reset (or discarded when the reset
//! fails) before it goes back to the pool.

use super::{looks_like_challenge, looks_not_found, resolve_url, FetchEnv, PlaceholderFilter};
use crate::browser::{BrowserDriver, RenderedPage};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::{FetchResult, Title};
use crate::utils::{expand_url_template, truncate_for_log};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("valid selector"));

fn parse_selector(raw: &str) -> Result<Selector, FetchError> {
    Selector::parse(raw).map_err(|e| FetchError::StructureChanged {
        url: String::new(),
        detail: format!("invalid selector {raw:?}: {e}"),
    })
}

/// Page checks shared by both browser adapters.
#[derive(Debug)]
struct PageRules {
    url_template: String,
    login_markers: Vec<Selector>,
    not_found_markers: Vec<String>,
    placeholders: PlaceholderFilter,
}

impl PageRules {
    fn new(source: &SourceConfig) -> Result<Self, FetchError> {
        let login_markers = source
            .login_markers
            .iter()
            .map(|m| parse_selector(m))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            url_template: source.url_template.clone(),
            login_markers,
            not_found_markers: source.not_found_markers.clone(),
            placeholders: PlaceholderFilter::new(&source.placeholder_patterns),
        })
    }

    /// Map a rendered page onto an outcome before any media extraction.
    fn classify(&self, title: &Title, page: &RenderedPage, document: &Html) -> Result<(), FetchError> {
        if looks_like_challenge(page.status, &page.html) {
            return Err(FetchError::BotChallenge(format!("{} (status {})", page.url, page.status)));
        }
        if self.login_markers.iter().any(|m| document.select(m).next().is_some()) {
            return Err(FetchError::AuthExpired(title.source.clone()));
        }
        if looks_not_found(page.status, &page.html, &self.not_found_markers) {
            return Err(FetchError::NotFound);
        }
        Ok(())
    }
}

/// Run the navigate → settle → read sequence on one pooled instance.
#[instrument(level = "info", skip_all, fields(slug = %title.slug, %url))]
async fn render_in_pool<D: BrowserDriver>(
    title: &Title,
    url: &str,
    env: &FetchEnv<'_, D>,
) -> Result<RenderedPage, FetchError> {
    let Some(session) = env.session else {
        return Err(FetchError::AuthExpired(title.source.clone()));
    };

    let mut guard = env.pool.acquire_timeout(env.acquire_timeout).await?;
    let t0 = Instant::now();
    let outcome = tokio::time::timeout(env.fetch_timeout, async {
        guard.navigate(url, Some(session)).await?;
        guard.wait_for_settle(env.settle).await;
        guard.page_source().await
    })
    .await;

    let failure = match outcome {
        Ok(Ok(page)) => {
            debug!(elapsed_ms = t0.elapsed().as_millis() as u64, "Critical section complete");
            return Ok(page);
        }
        Ok(Err(e)) => FetchError::from(e),
        Err(_) => {
            warn!(timeout = ?env.fetch_timeout, "Browser fetch timed out; abandoning");
            FetchError::Transient(format!("browser fetch timed out after {:?}", env.fetch_timeout))
        }
    };

    if let Err(e) = guard.reset().await {
        warn!(error = %e, "Instance reset failed; replacing it");
        guard.discard();
    }
    Err(failure)
}

/// The `src` of an image element, or of the first image inside a container.
fn image_src(element: ElementRef<'_>) -> Option<String> {
    let img = if element.value().name() == "img" {
        element
    } else {
        element.select(&IMG_SELECTOR).next()?
    };
    let attrs = img.value();
    attrs
        .attr("src")
        .or_else(|| attrs.attr("data-src"))
        .or_else(|| attrs.attr("srcset").and_then(|s| s.split_whitespace().next()))
        .map(str::to_string)
}

fn structure_changed(page: &RenderedPage, selector: &str) -> FetchError {
    FetchError::StructureChanged {
        url: page.url.clone(),
        detail: format!(
            "no media matched {selector:?}; page: {}",
            truncate_for_log(&page.html, 200)
        ),
    }
}

/// Single primary media element behind a login.
#[derive(Debug)]
pub struct AuthenticatedBrowserSource {
    rules: PageRules,
    media_selector_raw: String,
    media_selector: Selector,
}

impl AuthenticatedBrowserSource {
    pub fn new(source: &SourceConfig) -> Result<Self, FetchError> {
        let raw = source.media_selector.clone().unwrap_or_else(|| "img".to_string());
        Ok(Self {
            rules: PageRules::new(source)?,
            media_selector: parse_selector(&raw)?,
            media_selector_raw: raw,
        })
    }

    pub async fn fetch<D: BrowserDriver>(
        &self,
        title: &Title,
        date: NaiveDate,
        env: &FetchEnv<'_, D>,
    ) -> Result<FetchResult, FetchError> {
        let url = expand_url_template(&self.rules.url_template, title.path(), date);
        let page = render_in_pool(title, &url, env).await?;
        let media = self.extract(title, &page)?;
        info!(slug = %title.slug, %url, media = %media, "Matched browser media");
        Ok(FetchResult::new(&title.slug, date, vec![media], &url))
    }

    fn extract(&self, title: &Title, page: &RenderedPage) -> Result<String, FetchError> {
        let document = Html::parse_document(&page.html);
        self.rules.classify(title, page, &document)?;

        let Some(element) = document.select(&self.media_selector).next() else {
            return Err(structure_changed(page, &self.media_selector_raw));
        };
        let Some(url) = image_src(element).and_then(|src| resolve_url(&page.url, &src)) else {
            return Err(structure_changed(page, &self.media_selector_raw));
        };
        if self.rules.placeholders.is_placeholder(&url) {
            debug!(%url, "Primary media is a placeholder");
            return Err(FetchError::NotFound);
        }
        Ok(url)
    }
}

/// One or more panels behind a login, kept in document order.
#[derive(Debug)]
pub struct MultiPanelBrowserSource {
    rules: PageRules,
    panel_selector_raw: String,
    panel_selector: Selector,
}

impl MultiPanelBrowserSource {
    pub fn new(source: &SourceConfig) -> Result<Self, FetchError> {
        let raw = source.panel_selector.clone().unwrap_or_else(|| "img".to_string());
        Ok(Self {
            rules: PageRules::new(source)?,
            panel_selector: parse_selector(&raw)?,
            panel_selector_raw: raw,
        })
    }

    pub async fn fetch<D: BrowserDriver>(
        &self,
        title: &Title,
        date: NaiveDate,
        env: &FetchEnv<'_, D>,
    ) -> Result<FetchResult, FetchError> {
        let url = expand_url_template(&self.rules.url_template, title.path(), date);
        let page = render_in_pool(title, &url, env).await?;
        let panels = self.extract(title, &page)?;
        info!(slug = %title.slug, %url, panels = panels.len(), "Matched browser panels");
        Ok(FetchResult::new(&title.slug, date, panels, &url))
    }

    fn extract(&self, title: &Title, page: &RenderedPage) -> Result<Vec<String>, FetchError> {
        let document = Html::parse_document(&page.html);
        self.rules.classify(title, page, &document)?;

        let found: Vec<String> = document
            .select(&self.panel_selector)
            .filter_map(image_src)
            .filter_map(|src| resolve_url(&page.url, &src))
            .collect();
        if found.is_empty() {
            return Err(structure_changed(page, &self.panel_selector_raw));
        }

        let panels: Vec<String> = found
            .into_iter()
            .filter(|u| !self.rules.placeholders.is_placeholder(u))
            .collect();
        if panels.is_empty() {
            debug!("Every panel is a placeholder");
            return Err(FetchError::NotFound);
        }
        Ok(panels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{Probe, ScriptedDriver};
    use crate::models::{Capability, SessionCredential};
    use crate::pool::FetchPool;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    const URL: &str = "https://comics.example.com/strip/2025-06-25";

    fn source() -> SourceConfig {
        SourceConfig {
            url_template: "https://comics.example.com/{path}/{date}".into(),
            media_selector: Some("img.strip".into()),
            panel_selector: Some("div.panel img".into()),
            login_markers: vec!["form.login".into()],
            not_found_markers: vec!["No strip today".into()],
            ..Default::default()
        }
    }

    fn title(capability: Capability) -> Title {
        Title {
            slug: "strip".into(),
            name: "Strip".into(),
            source: "kingdom".into(),
            capability,
            path: None,
        }
    }

    fn session() -> SessionCredential {
        SessionCredential {
            source: "kingdom".into(),
            blob: b"sid=abc".to_vec(),
            created_at: Utc::now(),
            max_age_days: 60,
            stale: false,
        }
    }

    fn pool(html: &str, status: u16, delay: Duration, probe: Arc<Probe>) -> FetchPool<ScriptedDriver> {
        let mut pages = HashMap::new();
        pages.insert(URL.to_string(), (status, html.to_string()));
        let pages = Arc::new(pages);
        FetchPool::new(1, move |id| Ok(ScriptedDriver::new(id, Arc::clone(&pages), delay, Arc::clone(&probe))))
    }

    fn env<'a>(
        http: &'a reqwest::Client,
        pool: &'a FetchPool<ScriptedDriver>,
        session: Option<&'a SessionCredential>,
    ) -> FetchEnv<'a, ScriptedDriver> {
        FetchEnv {
            http,
            pool,
            session,
            settle: Duration::from_millis(1),
            fetch_timeout: Duration::from_millis(200),
            acquire_timeout: Duration::from_millis(200),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 25).unwrap()
    }

    #[tokio::test]
    async fn test_authenticated_reads_primary_media() {
        let probe = Arc::new(Probe::default());
        let html = r#"<html><body><img class="ad" src="/ad.png"><img class="strip" src="/media/0625.png"></body></html>"#;
        let pool = pool(html, 200, Duration::ZERO, Arc::clone(&probe));
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = AuthenticatedBrowserSource::new(&source()).unwrap();

        let result = adapter
            .fetch(&title(Capability::AuthenticatedBrowser), date(), &env(&http, &pool, Some(&cred)))
            .await
            .unwrap();
        assert_eq!(result.media.len(), 1);
        assert_eq!(result.media[0].url, "https://comics.example.com/media/0625.png");
        assert_eq!(result.source_url, URL);
        assert_eq!(probe.cookies.lock().unwrap()[0].as_deref(), Some("sid=abc"));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_multi_panel_preserves_document_order_and_repeats() {
        let html = r#"<html><body>
            <div class="panel"><img src="/p/3.png"></div>
            <div class="panel"><img data-src="/p/1.png"></div>
            <div class="panel"><img src="/p/2.png"></div>
            <div class="panel"><img src="/p/3.png"></div>
        </body></html>"#;
        let pool = pool(html, 200, Duration::ZERO, Arc::new(Probe::default()));
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = MultiPanelBrowserSource::new(&source()).unwrap();

        let result = adapter
            .fetch(&title(Capability::MultiPanelBrowser), date(), &env(&http, &pool, Some(&cred)))
            .await
            .unwrap();
        let urls: Vec<_> = result.media.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://comics.example.com/p/3.png",
                "https://comics.example.com/p/1.png",
                "https://comics.example.com/p/2.png",
                "https://comics.example.com/p/3.png",
            ]
        );
        assert_eq!(result.media[2].order, 2);
        assert_eq!(result.media[3].order, 3);
    }

    #[tokio::test]
    async fn test_login_marker_is_auth_expired() {
        let html = r#"<html><body><form class="login"></form></body></html>"#;
        let pool = pool(html, 200, Duration::ZERO, Arc::new(Probe::default()));
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = AuthenticatedBrowserSource::new(&source()).unwrap();
        let err = adapter
            .fetch(&title(Capability::AuthenticatedBrowser), date(), &env(&http, &pool, Some(&cred)))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::AuthExpired("kingdom".into()));
    }

    #[tokio::test]
    async fn test_missing_session_is_auth_expired_without_checkout() {
        let probe = Arc::new(Probe::default());
        let pool = pool("<html></html>", 200, Duration::ZERO, Arc::clone(&probe));
        let http = reqwest::Client::new();
        let adapter = AuthenticatedBrowserSource::new(&source()).unwrap();
        let err = adapter
            .fetch(&title(Capability::AuthenticatedBrowser), date(), &env(&http, &pool, None))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AuthExpired(_)));
        assert_eq!(probe.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outcome_classification() {
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = AuthenticatedBrowserSource::new(&source()).unwrap();
        let cases = [
            ("<html><title>Just a moment...</title></html>", 200, "bot_challenge"),
            ("<html><body>No strip today</body></html>", 200, "not_found"),
            ("<html><body>gone</body></html>", 404, "not_found"),
            ("<html><body><p>redesign</p></body></html>", 200, "structure_changed"),
            (r#"<img class="strip" src="/coming-soon.png">"#, 200, "not_found"),
        ];
        for (html, status, expected) in cases {
            let pool = pool(html, status, Duration::ZERO, Arc::new(Probe::default()));
            let err = adapter
                .fetch(&title(Capability::AuthenticatedBrowser), date(), &env(&http, &pool, Some(&cred)))
                .await
                .unwrap_err();
            let kind = match err {
                FetchError::BotChallenge(_) => "bot_challenge",
                FetchError::NotFound => "not_found",
                FetchError::StructureChanged { .. } => "structure_changed",
                _ => "other",
            };
            assert_eq!(kind, expected, "unexpected outcome for {html}");
        }
    }

    #[tokio::test]
    async fn test_timeout_resets_instance_and_returns_it() {
        let probe = Arc::new(Probe::default());
        let pool = pool("<html></html>", 200, Duration::from_millis(500), Arc::clone(&probe));
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = AuthenticatedBrowserSource::new(&source()).unwrap();

        let err = adapter
            .fetch(&title(Capability::AuthenticatedBrowser), date(), &env(&http, &pool, Some(&cred)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
        assert_eq!(probe.resets.load(Ordering::SeqCst), 1);
        assert_eq!(probe.active.load(Ordering::SeqCst), 0);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.live, 1);
    }

    #[tokio::test]
    async fn test_all_placeholder_panels_are_not_found() {
        let html = r#"<div class="panel"><img src="/promo/1.png"></div>"#;
        let pool = pool(html, 200, Duration::ZERO, Arc::new(Probe::default()));
        let http = reqwest::Client::new();
        let cred = session();
        let adapter = MultiPanelBrowserSource::new(&source()).unwrap();
        let err = adapter
            .fetch(&title(Capability::MultiPanelBrowser), date(), &env(&http, &pool, Some(&cred)))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotFound);
    }

    #[test]
    fn test_invalid_selector_is_reported() {
        let mut bad = source();
        bad.media_selector = Some("img[".into());
        assert!(AuthenticatedBrowserSource::new(&bad).is_err());
    }
}
