use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Records the start timestamp of the last fully-committed ingestion cycle.
///
/// The timestamp lives in its own file, separate from the embedding store,
/// so a missing tracker next to an existing store reads as "never refreshed"
/// and the next cycle reprocesses everything. The file holds a single
/// RFC 3339 timestamp.
pub struct RefreshTracker {
    path: PathBuf,
}

impl RefreshTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RefreshTracker { path: path.into() }
    }

    /// Timestamp of the last committed cycle, or `None` if no cycle ever
    /// committed. An unreadable or unparseable file degrades to `None`.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no refresh marker, treating as never refreshed");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "refresh marker unreadable, treating as never refreshed");
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "refresh marker unparseable, treating as never refreshed");
                None
            }
        }
    }

    /// Durably records `timestamp`. Callers must only invoke this after the
    /// corresponding store writes are saved.
    pub fn mark_refreshed(&self, timestamp: DateTime<Utc>) -> std::io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(timestamp.to_rfc3339().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), %timestamp, "refresh marker updated");
        Ok(())
    }
}
