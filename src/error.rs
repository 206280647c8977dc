//! Error types for fetching, persistence, pooling and configuration.
//!
//! Fetch outcomes are deliberately separate from storage failures: a
//! [`FetchError`] is always scoped to one title, while a [`StoreError`]
//! concerns the files this crate owns.

use std::time::Duration;
use thiserror::Error;

/// Why fetching a title for a date did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Nothing was published for the date. Expected for irregular titles.
    #[error("no content published for this date")]
    NotFound,

    /// The source served an anti-automation challenge.
    #[error("bot challenge: {0}")]
    BotChallenge(String),

    /// The stored session for `source` was rejected.
    #[error("session expired for source {0}")]
    AuthExpired(String),

    /// The page loaded but no parsing strategy found a viable candidate.
    #[error("page structure changed at {url}: {detail}")]
    StructureChanged { url: String, detail: String },

    /// Network failure or timeout.
    #[error("transient failure: {0}")]
    Transient(String),

    /// No pooled browser instance became available in time.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),
}

impl FetchError {
    /// Retryable within the same run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::BotChallenge(_) | FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transient(err.to_string())
    }
}

impl From<DriverError> for FetchError {
    fn from(err: DriverError) -> Self {
        FetchError::Transient(err.to_string())
    }
}

impl From<PoolError> for FetchError {
    fn from(err: PoolError) -> Self {
        FetchError::ResourceExhaustion(err.to_string())
    }
}

/// Failure in one of the on-disk stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),
}

impl From<quick_xml::Error> for StoreError {
    fn from(err: quick_xml::Error) -> Self {
        StoreError::Xml(err.to_string())
    }
}

/// Browser instance checkout failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no browser instance available after {0:?}")]
    Exhausted(Duration),

    #[error("browser pool is closed")]
    Closed,

    #[error("failed to launch browser instance: {0}")]
    Launch(String),
}

/// Failure talking to a browser instance.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("navigation required before reading page source")]
    NoPage,
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Network(err.to_string())
    }
}

/// Problems loading or validating the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure building or tearing down a run context.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
