//! Persistence and age checks for authenticated browser sessions.
//!
//! Each source owns two files under the sessions directory:
//!
//! ```text
//! sessions_dir/
//! ├── comics-kingdom.session   # opaque blob from the login step
//! └── comics-kingdom.json      # { created_at, max_age_days, stale }
//! ```
//!
//! The store never logs in and never looks inside a blob. It only keeps
//! what the interactive login step hands over, estimates whether it is
//! likely expired, and remembers when an adapter reported it rejected.

use crate::error::StoreError;
use crate::models::SessionCredential;
use crate::utils::{slugify, write_atomic};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, instrument, warn};

/// Default session lifetime estimate, in days.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 60;

#[derive(Debug, Deserialize, Serialize)]
struct SessionMeta {
    created_at: DateTime<Utc>,
    #[serde(default = "default_max_age")]
    max_age_days: i64,
    #[serde(default)]
    stale: bool,
}

fn default_max_age() -> i64 {
    DEFAULT_MAX_AGE_DAYS
}

/// Why a source's session cannot be used this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProblem {
    Missing,
    Stale,
    LikelyExpired,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    default_max_age_days: i64,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, default_max_age_days: i64) -> Self {
        Self {
            dir: dir.into(),
            default_max_age_days,
        }
    }

    fn blob_path(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{}.session", slugify(source)))
    }

    fn meta_path(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slugify(source)))
    }

    /// Load the stored credential for `source`, or `None` when there is none.
    ///
    /// A blob without metadata is treated as missing: its age is unknown.
    #[instrument(level = "debug", skip(self))]
    pub async fn load(&self, source: &str) -> Result<Option<SessionCredential>, StoreError> {
        let meta_raw = match fs::read(self.meta_path(source)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = match fs::read(self.blob_path(source)).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(source, "Session metadata present without blob; treating as missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let meta: SessionMeta = serde_json::from_slice(&meta_raw)?;
        Ok(Some(SessionCredential {
            source: source.to_string(),
            blob,
            created_at: meta.created_at,
            max_age_days: meta.max_age_days,
            stale: meta.stale,
        }))
    }

    /// Persist a credential for `source`. A fresh save always clears staleness.
    #[instrument(level = "info", skip(self, credential), fields(bytes = credential.blob.len()))]
    pub async fn save(&self, source: &str, credential: &SessionCredential) -> Result<(), StoreError> {
        let meta = SessionMeta {
            created_at: credential.created_at,
            max_age_days: credential.max_age_days,
            stale: false,
        };
        write_atomic(&self.blob_path(source), &credential.blob).await?;
        write_atomic(&self.meta_path(source), &serde_json::to_vec_pretty(&meta)?).await?;
        info!(source, "Saved session credential");
        Ok(())
    }

    /// Build a credential for a freshly imported blob using the store's default age.
    pub fn credential_from_blob(&self, source: &str, blob: Vec<u8>, now: DateTime<Utc>) -> SessionCredential {
        SessionCredential {
            source: source.to_string(),
            blob,
            created_at: now,
            max_age_days: self.default_max_age_days,
            stale: false,
        }
    }

    /// Whether the credential has outlived its estimated maximum age.
    pub fn is_likely_expired(&self, credential: &SessionCredential, now: DateTime<Utc>) -> bool {
        now - credential.created_at >= Duration::days(credential.max_age_days)
    }

    /// Flag the stored credential as rejected so later runs skip the source.
    ///
    /// Returns `false` when there was nothing stored to mark.
    #[instrument(level = "info", skip(self))]
    pub async fn mark_stale(&self, source: &str) -> Result<bool, StoreError> {
        let meta_path = self.meta_path(source);
        let raw = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut meta: SessionMeta = serde_json::from_slice(&raw)?;
        if !meta.stale {
            meta.stale = true;
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?).await?;
            warn!(source, "Marked session stale; re-authentication required");
        }
        Ok(true)
    }

    /// Load a credential and decide whether it can be used right now.
    pub async fn usable(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<SessionCredential, SessionProblem>, StoreError> {
        let Some(credential) = self.load(source).await? else {
            return Ok(Err(SessionProblem::Missing));
        };
        if credential.stale {
            return Ok(Err(SessionProblem::Stale));
        }
        if self.is_likely_expired(&credential, now) {
            return Ok(Err(SessionProblem::LikelyExpired));
        }
        Ok(Ok(credential))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(dir, DEFAULT_MAX_AGE_DAYS)
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load("kingdom").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_keeps_blob_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let blob = vec![0u8, 159, 146, 150, b'{', 0xff];
        let cred = store.credential_from_blob("kingdom", blob.clone(), Utc::now());
        store.save("kingdom", &cred).await.unwrap();

        let loaded = store.load("kingdom").await.unwrap().unwrap();
        assert_eq!(loaded.blob, blob);
        assert_eq!(loaded.max_age_days, DEFAULT_MAX_AGE_DAYS);
        assert!(!loaded.stale);
    }

    #[tokio::test]
    async fn test_is_likely_expired_uses_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        let fresh = store.credential_from_blob("s", vec![1], now - Duration::days(59));
        let old = store.credential_from_blob("s", vec![1], now - Duration::days(60));
        assert!(!store.is_likely_expired(&fresh, now));
        assert!(store.is_likely_expired(&old, now));
    }

    #[tokio::test]
    async fn test_mark_stale_then_save_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        let cred = store.credential_from_blob("kingdom", b"cookie=1".to_vec(), now);
        store.save("kingdom", &cred).await.unwrap();

        assert!(store.mark_stale("kingdom").await.unwrap());
        assert_eq!(
            store.usable("kingdom", now).await.unwrap().unwrap_err(),
            SessionProblem::Stale
        );

        store.save("kingdom", &cred).await.unwrap();
        assert!(store.usable("kingdom", now).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_mark_stale_without_credential() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!store(dir.path()).mark_stale("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_usable_reports_missing_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();
        assert_eq!(
            store.usable("kingdom", now).await.unwrap().unwrap_err(),
            SessionProblem::Missing
        );
        let old = store.credential_from_blob("kingdom", vec![1], now - Duration::days(90));
        store.save("kingdom", &old).await.unwrap();
        assert_eq!(
            store.usable("kingdom", now).await.unwrap().unwrap_err(),
            SessionProblem::LikelyExpired
        );
    }
}
