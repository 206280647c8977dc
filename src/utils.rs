//! Utility functions for logging, file system operations and date handling.
//!
//! This module provides helper functions used throughout the crate:
//! - String truncation for log previews of fetched pages
//! - Identifier sanitisation for file names
//! - Atomic file replacement shared by every on-disk store
//! - File system validation for state and output directories

use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to at most `max` bytes (on a character
/// boundary) with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log("a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Convert an identifier to a file-name-safe slug.
///
/// Lowercases the text, drops anything that is not alphanumeric, `-` or `_`,
/// and replaces spaces with hyphens.
///
/// ```ignore
/// assert_eq!(slugify("Comics Kingdom"), "comics-kingdom");
/// assert_eq!(slugify("../etc"), "etc");
/// ```
pub fn slugify(id: &str) -> String {
    id.trim()
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ' && c != '-' && c != '_', "")
        .replace(' ', "-")
}

/// Expand `{path}`, `{yyyy}`, `{mm}`, `{dd}` and `{date}` in a URL template.
///
/// The path component is percent-encoded segment by segment so titles with
/// spaces or unicode names still produce valid URLs.
pub fn expand_url_template(template: &str, path: &str, date: NaiveDate) -> String {
    let encoded_path = path
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    template
        .replace("{path}", &encoded_path)
        .replace("{yyyy}", &format!("{:04}", date.year()))
        .replace("{mm}", &format!("{:02}", date.month()))
        .replace("{dd}", &format!("{:02}", date.day()))
        .replace("{date}", &date.format("%Y-%m-%d").to_string())
}

/// The sibling path used while a file is being replaced.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` without ever exposing a partial file.
///
/// The temporary file handle lives only inside the inner block, so it is
/// flushed, synced and closed before the rename on success, and dropped
/// (closed) on every error path. A failed write leaves the previous file
/// untouched and removes the temporary.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let tmp = temp_path_for(path);
    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    fs::rename(&tmp, path).await?;
    debug!(bytes = bytes.len(), "Replaced file atomically");
    Ok(())
}

/// Move an unreadable file to `<name>.corrupt` so it can be inspected later.
///
/// Returns the new location. Any earlier quarantined copy is replaced.
pub async fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    let target = path.with_file_name(name);
    fs::rename(path, &target).await?;
    Ok(target)
}

/// Ensure a directory exists and is writable.
///
/// This function creates the directory if it doesn't exist, then performs
/// a write test by creating and immediately deleting a probe file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await?;
    let probe_path = path.join("..__probe_write__");
    fs::File::create(&probe_path).await?;
    let _ = fs::remove_file(&probe_path).await;
    info!("Directory is writable");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundary() {
        let s = "ééééé";
        let result = truncate_for_log(s, 3);
        assert!(result.starts_with("é…"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Comics Kingdom"), "comics-kingdom");
        assert_eq!(slugify("gocomics"), "gocomics");
        assert_eq!(slugify("../etc/passwd"), "etcpasswd");
        assert_eq!(slugify("tiny_view"), "tiny_view");
    }

    #[test]
    fn test_expand_url_template() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 5).unwrap();
        assert_eq!(
            expand_url_template("https://example.com/{path}/{yyyy}/{mm}/{dd}", "calvin", date),
            "https://example.com/calvin/2025/06/05"
        );
        assert_eq!(
            expand_url_template("https://example.com/{path}?d={date}", "big nate", date),
            "https://example.com/big%20nate?d=2025-06-05"
        );
    }

    #[test]
    fn test_temp_path_for() {
        let p = Path::new("/feeds/garfield.xml");
        assert_eq!(temp_path_for(p), PathBuf::from("/feeds/garfield.xml.tmp"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!temp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, b"{broken").unwrap();
        let moved = quarantine(&path).await.unwrap();
        assert_eq!(moved, dir.path().join("schedule.json.corrupt"));
        assert!(!path.exists());
        assert_eq!(std::fs::read(&moved).unwrap(), b"{broken");
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state");
        ensure_writable_dir(&target).await.unwrap();
        assert!(target.is_dir());
        assert!(!target.join("..__probe_write__").exists());
    }
}
