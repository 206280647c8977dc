//! Durable per-title feed state.
//!
//! [`FeedStore`] exclusively owns the feed files under its directory. Every
//! merge for a title runs under that title's async mutex, reads the current
//! file, inserts unseen entries, re-sorts newest first, truncates to the cap
//! and replaces the file atomically.

use super::rss::{self, Channel};
use crate::error::StoreError;
use crate::models::{FeedEntry, FetchResult, Title};
use crate::utils::{quarantine, slugify, write_atomic};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub evicted: usize,
    pub total: usize,
    /// The file was rewritten (false when nothing changed).
    pub written: bool,
}

#[derive(Debug)]
pub struct FeedStore {
    dir: PathBuf,
    cap: usize,
    /// Source id to display name, for channel descriptions.
    source_names: HashMap<String, String>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeedStore {
    pub fn new(dir: impl Into<PathBuf>, cap: usize) -> Self {
        Self {
            dir: dir.into(),
            cap: cap.max(1),
            source_names: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source_names(mut self, names: HashMap<String, String>) -> Self {
        self.source_names = names;
        self
    }

    pub fn path_for(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{}.xml", slugify(slug)))
    }

    fn lock_for(&self, slug: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(slug.to_string()).or_default().clone()
    }

    /// Read a title's current entries.
    ///
    /// A missing file is an empty feed. An unparseable one is logged, moved
    /// aside to `<slug>.xml.corrupt` and also treated as empty, so one broken
    /// file never stops the run.
    pub async fn load(&self, slug: &str) -> Result<Vec<FeedEntry>, StoreError> {
        let path = self.path_for(slug);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let moved = quarantine(&path).await?;
                warn!(slug, error = %e, moved_to = %moved.display(), "Feed file is not UTF-8; starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        match rss::parse(&raw, slug) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let moved = quarantine(&path).await?;
                warn!(slug, error = %e, moved_to = %moved.display(), "Feed file unreadable; starting empty");
                Ok(Vec::new())
            }
        }
    }

    /// Merge fetch results into `title`'s feed.
    ///
    /// Entries whose identifier is already present are left as they are, so
    /// merging the same result twice leaves the file byte-identical.
    #[instrument(level = "info", skip_all, fields(slug = %title.slug, results = results.len()))]
    pub async fn merge(&self, title: &Title, results: &[FetchResult]) -> Result<MergeOutcome, StoreError> {
        let lock = self.lock_for(&title.slug);
        let _held = lock.lock().await;

        let path = self.path_for(&title.slug);
        let mut entries = self.load(&title.slug).await?;
        let loaded = entries.len();
        let mut seen: HashSet<String> = entries.iter().map(|e| e.identifier.clone()).collect();

        let mut added = 0;
        for result in results.iter().filter(|r| r.slug == title.slug) {
            let entry = FeedEntry::from_result(title, result);
            if seen.insert(entry.identifier.clone()) {
                entries.push(entry);
                added += 1;
            } else {
                debug!(identifier = %entry.identifier, "Entry already present");
            }
        }

        entries.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.identifier.cmp(&b.identifier)));
        let evicted = entries.len().saturating_sub(self.cap);
        entries.truncate(self.cap);

        let total = entries.len();
        // A quarantined or absent file must be (re)created even with no new entries.
        let on_disk = fs::try_exists(&path).await.unwrap_or(false);
        if added == 0 && evicted == 0 && on_disk && total == loaded {
            debug!("Feed unchanged; not rewriting");
            return Ok(MergeOutcome { added, evicted, total, written: false });
        }

        let source_name = self.source_names.get(&title.source).unwrap_or(&title.source);
        let bytes = rss::render(&channel_for(title, source_name, &entries), &entries)?;
        write_atomic(&path, &bytes).await?;
        info!(added, evicted, total, "Feed written");
        Ok(MergeOutcome { added, evicted, total, written: true })
    }
}

fn channel_for(title: &Title, source_name: &str, entries: &[FeedEntry]) -> Channel {
    Channel {
        title: title.name.clone(),
        link: entries.first().map(|e| e.link.clone()).unwrap_or_default(),
        description: format!("Daily {} from {}", title.name, source_name),
    }
}
