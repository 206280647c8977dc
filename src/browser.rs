//! Browser automation seam.
//!
//! A [`BrowserDriver`] is one expensive, stateful browser instance. Every
//! method takes `&mut self`: an instance can only be driven by whoever holds
//! it, which is how the [`FetchPool`](crate::pool::FetchPool) guarantees a
//! navigation can never land in the middle of another task's read.
//!
//! [`BrowserlessDriver`] renders pages through a Browserless `/content`
//! endpoint. Navigation and the settle-wait are recorded locally and executed
//! as a single remote render when the page source is read.

use crate::error::DriverError;
use crate::models::SessionCredential;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Response header carrying the rendered page's own HTTP status.
const TARGET_STATUS_HEADER: &str = "x-response-code";

/// A rendered document as read from a browser instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub status: u16,
    pub html: String,
}

pub trait BrowserDriver: Send {
    /// Point the instance at `url`, presenting `session` if given.
    fn navigate(
        &mut self,
        url: &str,
        session: Option<&SessionCredential>,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Let client-side rendering finish before the page is read.
    fn wait_for_settle(&mut self, settle: Duration) -> impl Future<Output = ()> + Send;

    /// Read the current document.
    fn page_source(&mut self) -> impl Future<Output = Result<RenderedPage, DriverError>> + Send;

    /// Drop any in-flight page state so the instance can be reused.
    fn reset(&mut self) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
struct PendingNavigation {
    url: String,
    cookie: Option<String>,
    settle: Duration,
}

/// One Browserless-backed browser instance.
pub struct BrowserlessDriver {
    id: usize,
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    pending: Option<PendingNavigation>,
}

impl BrowserlessDriver {
    pub fn new(
        id: usize,
        base_url: &str,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            id,
            client: build_client(request_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            request_timeout,
            pending: None,
        })
    }

    fn endpoint(&self) -> String {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={}", urlencoding::encode(token)));
        }
        endpoint
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, DriverError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(DriverError::from)
}

impl BrowserDriver for BrowserlessDriver {
    async fn navigate(
        &mut self,
        url: &str,
        session: Option<&SessionCredential>,
    ) -> Result<(), DriverError> {
        let parsed = url::Url::parse(url).map_err(|e| DriverError::Network(format!("invalid URL {url}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(DriverError::Network(format!(
                "only http/https URLs are allowed, got: {}",
                parsed.scheme()
            )));
        }
        // The blob is forwarded verbatim as the cookie header value.
        let cookie = session.map(|s| String::from_utf8_lossy(&s.blob).trim().to_string());
        self.pending = Some(PendingNavigation {
            url: url.to_string(),
            cookie,
            settle: Duration::ZERO,
        });
        debug!(instance = self.id, url, "Navigation queued");
        Ok(())
    }

    async fn wait_for_settle(&mut self, settle: Duration) {
        if let Some(ref mut pending) = self.pending {
            pending.settle = settle;
        }
    }

    #[instrument(level = "info", skip_all, fields(instance = self.id))]
    async fn page_source(&mut self) -> Result<RenderedPage, DriverError> {
        let pending = self.pending.clone().ok_or(DriverError::NoPage)?;

        let mut body = serde_json::json!({
            "url": pending.url,
            "waitForTimeout": pending.settle.as_millis() as u64,
            "gotoOptions": { "waitUntil": "networkidle2" },
        });
        if let Some(cookie) = pending.cookie.as_deref().filter(|c| !c.is_empty()) {
            body["setExtraHTTPHeaders"] = serde_json::json!({ "Cookie": cookie });
        }

        let resp = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_server_error() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DriverError::Api {
                status: status.as_u16(),
                message,
            });
        }
        // The service's own status only says the render ran; the target's is in a header.
        let target_status = resp
            .headers()
            .get(TARGET_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(status.as_u16());
        let html = resp.text().await?;
        info!(url = %pending.url, status = target_status, bytes = html.len(), "Rendered page");
        Ok(RenderedPage {
            url: pending.url,
            status: target_status,
            html,
        })
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        self.pending = None;
        self.client = build_client(self.request_timeout)?;
        debug!(instance = self.id, "Instance reset");
        Ok(())
    }

    async fn close(&mut self) {
        self.pending = None;
        debug!(instance = self.id, "Instance closed");
    }
}
