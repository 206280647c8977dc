//! HTTP-only adapter driven by embedded JSON-LD metadata.
//!
//! Date pages on these sources embed several `ImageObject` entries (today's
//! item plus neighbours and recommendations). The entry whose human-readable
//! `datePublished` matches the requested date is the answer; document order
//! is meaningless.
//!
//! When a page carries no `ImageObject` at all, two fallbacks are tried in
//! strict order:
//!
//! 1. the `<img fetchpriority="high">` the page renders first
//! 2. the page-level `og:image` / `twitter:image` preview
//!
//! Any URL matching a [`PlaceholderFilter`] pattern is rejected at every tier.

use super::{looks_like_challenge, looks_not_found, mitigated_by_header, resolve_url, PlaceholderFilter};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::models::{FetchResult, Title};
use crate::utils::{expand_url_template, truncate_for_log};
use chrono::{DateTime, Datelike, NaiveDate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, info, instrument};

static JSON_LD_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid selector"));
static PRIORITY_IMG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"img[fetchpriority="high"]"#).expect("valid selector"));
static PREVIEW_META_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:image"], meta[name="twitter:image"]"#).expect("valid selector")
});

const PRIMARY_MEDIA_TYPE: &str = "ImageObject";

#[derive(Debug)]
pub struct StructuredDataSource {
    url_template: String,
    not_found_markers: Vec<String>,
    placeholders: PlaceholderFilter,
}

/// A primary media object found in JSON-LD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub date_text: Option<String>,
}

impl StructuredDataSource {
    pub fn new(source: &SourceConfig) -> Self {
        Self {
            url_template: source.url_template.clone(),
            not_found_markers: source.not_found_markers.clone(),
            placeholders: PlaceholderFilter::new(&source.placeholder_patterns),
        }
    }

    #[instrument(level = "info", skip_all, fields(slug = %title.slug, %date))]
    pub async fn fetch(
        &self,
        title: &Title,
        date: NaiveDate,
        http: &reqwest::Client,
    ) -> Result<FetchResult, FetchError> {
        let url = expand_url_template(&self.url_template, title.path(), date);
        let resp = http.get(&url).send().await?;
        let status = resp.status().as_u16();
        let mitigated = mitigated_by_header(resp.headers());
        let html = resp.text().await?;
        debug!(%url, status, bytes = html.len(), "Fetched structured page");

        if mitigated || looks_like_challenge(status, &html) {
            return Err(FetchError::BotChallenge(format!("{url} (status {status})")));
        }
        if looks_not_found(status, &html, &self.not_found_markers) {
            return Err(FetchError::NotFound);
        }
        if !(200..300).contains(&status) {
            return Err(FetchError::Transient(format!("{url} returned status {status}")));
        }

        let media = select_media(&html, &url, date, &self.placeholders)?;
        info!(%url, media = %media, "Matched structured media");
        Ok(FetchResult::new(&title.slug, date, vec![media], &url))
    }
}

/// Pick the media URL for `date` from a structured page.
pub fn select_media(
    html: &str,
    page_url: &str,
    date: NaiveDate,
    placeholders: &PlaceholderFilter,
) -> Result<String, FetchError> {
    let document = Html::parse_document(html);
    let candidates = json_ld_candidates(&document);

    if !candidates.is_empty() {
        let matched = candidates
            .iter()
            .find(|c| c.date_text.as_deref().is_some_and(|t| date_text_matches(t, date)));
        return match matched.and_then(|c| resolve_url(page_url, &c.url)) {
            Some(url) if !placeholders.is_placeholder(&url) => Ok(url),
            Some(url) => {
                debug!(%url, "Date-matched candidate is a placeholder");
                Err(FetchError::NotFound)
            }
            None => {
                debug!(candidates = candidates.len(), "No candidate matches the requested date");
                Err(FetchError::NotFound)
            }
        };
    }

    let tiers = [priority_image(&document), preview_image(&document)];
    let mut rejected = 0usize;
    for found in tiers.into_iter().flatten() {
        let Some(url) = resolve_url(page_url, &found) else {
            continue;
        };
        if placeholders.is_placeholder(&url) {
            debug!(%url, "Rejected placeholder fallback");
            rejected += 1;
            continue;
        }
        return Ok(url);
    }

    if rejected > 0 {
        return Err(FetchError::NotFound);
    }
    Err(FetchError::StructureChanged {
        url: page_url.to_string(),
        detail: format!(
            "no {PRIMARY_MEDIA_TYPE} metadata, priority image or preview image; page: {}",
            truncate_for_log(html, 200)
        ),
    })
}

/// Every JSON-LD object typed as primary media, in document order.
pub fn json_ld_candidates(document: &Html) -> Vec<Candidate> {
    let mut out = Vec::new();
    for script in document.select(&JSON_LD_SELECTOR) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect_candidates(&value, &mut out),
            Err(e) => debug!(error = %e, "Skipping unparseable JSON-LD block"),
        }
    }
    out
}

fn collect_candidates(value: &Value, out: &mut Vec<Candidate>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_candidates(v, out)),
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                collect_candidates(graph, out);
            }
            if !is_primary_media(value) {
                return;
            }
            let url = ["contentUrl", "url"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str));
            if let Some(url) = url {
                let date_text = ["datePublished", "uploadDate"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string);
                out.push(Candidate {
                    url: url.to_string(),
                    date_text,
                });
            }
        }
        _ => {}
    }
}

fn is_primary_media(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == PRIMARY_MEDIA_TYPE,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(PRIMARY_MEDIA_TYPE)),
        _ => false,
    }
}

fn priority_image(document: &Html) -> Option<String> {
    document
        .select(&PRIORITY_IMG_SELECTOR)
        .find_map(|img| img.value().attr("src").map(str::to_string))
}

fn preview_image(document: &Html) -> Option<String> {
    document
        .select(&PREVIEW_META_SELECTOR)
        .find_map(|meta| meta.value().attr("content").map(str::to_string))
}

/// Whether a human-readable publish date names exactly `date`.
///
/// Accepts "June 25, 2025", "Jun 25, 2025", "2025-06-25", RFC 3339 and
/// yearless "June 25" (the year is taken from `date`).
pub fn date_text_matches(text: &str, date: NaiveDate) -> bool {
    let text = text.split_whitespace().join(" ");
    if text.is_empty() {
        return false;
    }
    for fmt in ["%B %d, %Y", "%B %d %Y", "%Y-%m-%d"] {
        if let Ok(parsed) = NaiveDate::parse_from_str(&text, fmt) {
            return parsed == date;
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return dt.date_naive() == date;
    }
    if let Some(prefix) = text.get(..10) {
        if let Ok(parsed) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return parsed == date;
        }
    }
    let with_year = format!("{} {}", text.trim_end_matches(','), date.year());
    NaiveDate::parse_from_str(&with_year, "%B %d %Y").is_ok_and(|parsed| parsed == date)
}
