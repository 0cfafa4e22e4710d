//! Incremental file archival.
//!
//! An [`Archiver`] walks a source tree, picks the files newer than its
//! [`FileCursor`], and hands them one by one to an [`ArchiveSink`]. Per-run
//! quotas on file count and total size keep each run bounded; files beyond a
//! quota are left for a later run.
//!
//! # Ordering
//!
//! Files are ordered by `(timestamp, path)` before anything else happens, so
//! the cursor always names a single point in that order:
//!
//! ```text
//! sorted:   a(100) b(100) c(101) d(105) e(107)
//! cursor:          ^ (100, b)
//! pending:                c      d      e
//! max_files = 2:          c      d            -> cursor (105, d)
//! ```
//!
//! A file's timestamp is the one encoded in its path when it follows the
//! record path scheme, and its modification time otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cursor::{CursorStore, FileCursor, FileCursorStore};
use crate::error::{ArchiveError, ConfigError, Result};
use crate::record::timestamp_from_path;
use crate::sink::ArchiveSink;
use crate::store::{TMP_SUFFIX, prune_empty_parents};

/// Configuration of one archiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Archiver name.
    pub name: String,

    /// Root of the tree to archive.
    pub source: PathBuf,

    /// Private status directory holding the cursor.
    pub status: PathBuf,

    /// Maximum files per run; `0` means unlimited.
    #[serde(default)]
    pub max_files: usize,

    /// Maximum total bytes per run; `0` means unlimited.
    #[serde(default)]
    pub max_bytes: u64,

    /// File extensions to archive, without the dot; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    /// Delete source files once they are archived.
    #[serde(default)]
    pub remove_source_after_archive: bool,
}

impl ArchiverConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required setting is missing or an
    /// extension is empty.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let missing = |setting: &str| ConfigError::Missing {
            job: self.name.clone(),
            setting: setting.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        if self.source.as_os_str().is_empty() {
            return Err(missing("source"));
        }
        if self.status.as_os_str().is_empty() {
            return Err(missing("status"));
        }
        if self
            .extensions
            .iter()
            .any(|ext| ext.trim_start_matches('.').is_empty())
        {
            return Err(ConfigError::Invalid {
                job: self.name.clone(),
                setting: "extensions".to_string(),
                reason: "extensions cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// One file offered to an [`ArchiveSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveItem {
    /// Full path of the source file.
    pub path: PathBuf,
    /// Path relative to the source root.
    pub relative: PathBuf,
    /// Cursor identity: the full path as a string.
    pub identity: String,
    /// Path-encoded timestamp, or modification time in seconds.
    pub timestamp: i64,
    /// File size in bytes.
    pub size: u64,
    /// Modification time, when the platform reports one.
    pub modified: Option<SystemTime>,
}

/// Outcome of one archive run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchiveReport {
    /// Files handed to the sink.
    pub archived: usize,
    /// Total size of those files.
    pub bytes: u64,
    /// Eligible files left for later runs by the quotas.
    pub remaining: usize,
    /// The saved cursor, if it moved.
    pub cursor: Option<FileCursor>,
}

/// Archives new files from a source tree.
#[derive(Debug)]
pub struct Archiver {
    config: ArchiverConfig,
    extensions: Vec<String>,
    cursor: FileCursorStore,
}

impl Archiver {
    /// Creates an archiver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: ArchiverConfig) -> Result<Self> {
        config.validate()?;
        let extensions = config
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self {
            cursor: FileCursorStore::new(&config.status),
            extensions,
            config,
        })
    }

    /// Returns the archiver name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the cursor store.
    pub fn cursor(&self) -> &FileCursorStore {
        &self.cursor
    }

    /// True if a file is excluded for good, regardless of the cursor.
    fn is_excluded(&self, path: &Path, size: u64) -> bool {
        if size == 0 || path.to_string_lossy().ends_with(TMP_SUFFIX) {
            return true;
        }
        if self.extensions.is_empty() {
            return false;
        }
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        !ext.is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Lists every archivable file in the source tree, sorted by
    /// `(timestamp, identity)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::MissingSource`] if the source tree does not
    /// exist, or [`ArchiveError::Walk`] if its root cannot be read.
    pub fn scan(&self) -> Result<Vec<ArchiveItem>> {
        let source = &self.config.source;
        if !source.is_dir() {
            return Err(ArchiveError::MissingSource {
                path: source.clone(),
            }
            .into());
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(source) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(ArchiveError::Walk {
                        path: source.clone(),
                        source: e,
                    }
                    .into());
                }
                Err(e) => {
                    warn!(archiver = %self.config.name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || path.starts_with(&self.config.status) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(archiver = %self.config.name, path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            if self.is_excluded(path, metadata.len()) {
                debug!(archiver = %self.config.name, path = %path.display(), "excluded by filter");
                continue;
            }

            let modified = metadata.modified().ok();
            let timestamp = timestamp_from_path(source, path)
                .unwrap_or_else(|| modified.map_or(0, epoch_seconds));

            items.push(ArchiveItem {
                relative: path.strip_prefix(source).unwrap_or(path).to_path_buf(),
                identity: path.to_string_lossy().into_owned(),
                path: path.to_path_buf(),
                timestamp,
                size: metadata.len(),
                modified,
            });
        }

        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        Ok(items)
    }

    /// Applies the per-run quotas to pending items, in order.
    ///
    /// Stops at the first item that would exceed a quota. An item larger
    /// than the size quota is taken alone when it comes first, so one big
    /// file cannot stall the archiver.
    pub fn apply_quotas(&self, pending: Vec<ArchiveItem>) -> Vec<ArchiveItem> {
        let mut batch = Vec::new();
        let mut bytes = 0u64;

        for item in pending {
            if self.config.max_files > 0 && batch.len() >= self.config.max_files {
                break;
            }
            if self.config.max_bytes > 0 && bytes.saturating_add(item.size) > self.config.max_bytes {
                if batch.is_empty() {
                    warn!(
                        archiver = %self.config.name,
                        path = %item.path.display(),
                        size = item.size,
                        "file exceeds the size quota, archiving it alone"
                    );
                    batch.push(item);
                }
                break;
            }
            bytes += item.size;
            batch.push(item);
        }

        batch
    }

    /// Runs one archive pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be scanned, the sink fails an
    /// item or the batch, or the cursor cannot be saved. After a sink
    /// failure the cursor is unchanged and the remaining items are not
    /// offered.
    pub fn run(&self, sink: &mut dyn ArchiveSink) -> Result<ArchiveReport> {
        let cursor = self.cursor.load();
        let pending: Vec<ArchiveItem> = self
            .scan()?
            .into_iter()
            .filter(|item| {
                cursor
                    .as_ref()
                    .is_none_or(|c| c.precedes(item.timestamp, &item.identity))
            })
            .collect();
        let eligible = pending.len();
        let batch = self.apply_quotas(pending);

        let Some(last) = batch.last() else {
            debug!(archiver = %self.config.name, "nothing to archive");
            return Ok(ArchiveReport::default());
        };

        for item in &batch {
            if let Err(e) = sink.put(item) {
                error!(
                    archiver = %self.config.name,
                    sink = sink.name(),
                    path = %item.path.display(),
                    error = %e,
                    "archive sink failed, aborting batch"
                );
                return Err(e.into());
            }
        }
        if let Err(e) = sink.finish() {
            error!(archiver = %self.config.name, sink = sink.name(), error = %e, "archive sink failed to finish batch");
            return Err(e.into());
        }

        let next = FileCursor::new(last.timestamp, last.identity.clone());
        self.cursor.save(&next)?;

        if self.config.remove_source_after_archive {
            for item in &batch {
                match fs::remove_file(&item.path) {
                    Ok(()) => prune_empty_parents(&self.config.source, &item.path),
                    Err(e) => warn!(
                        archiver = %self.config.name,
                        path = %item.path.display(),
                        error = %e,
                        "could not remove archived file"
                    ),
                }
            }
        }

        let bytes: u64 = batch.iter().map(|item| item.size).sum();
        info!(
            archiver = %self.config.name,
            archived = batch.len(),
            bytes,
            remaining = eligible - batch.len(),
            cursor = %next,
            "archive run complete"
        );

        Ok(ArchiveReport {
            archived: batch.len(),
            bytes,
            remaining: eligible - batch.len(),
            cursor: Some(next),
        })
    }
}

fn epoch_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs()).map_or(i64::MIN, |s| -s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ArchiverConfig {
        ArchiverConfig {
            name: "arch".to_string(),
            source: dir.path().join("data"),
            status: dir.path().join("status"),
            max_files: 0,
            max_bytes: 0,
            extensions: Vec::new(),
            remove_source_after_archive: false,
        }
    }

    fn put(root: &Path, relative: &str, content: &str) -> PathBuf {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn item(timestamp: i64, identity: &str, size: u64) -> ArchiveItem {
        ArchiveItem {
            path: PathBuf::from(identity),
            relative: PathBuf::from(identity),
            identity: identity.to_string(),
            timestamp,
            size,
            modified: None,
        }
    }

    #[test]
    fn test_scan_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir);
        c.extensions = vec![".json".to_string()];
        let root = c.source.clone();
        put(&root, "1970/1/1/0/1/40.json", "{}"); // 100
        put(&root, "1970/1/1/0/0/50.json", "{}"); // 50
        put(&root, "1970/1/1/0/0/55.json", ""); // empty
        put(&root, "1970/1/1/0/0/56.json.tmp", "{}");
        put(&root, "notes.txt", "hello");

        let archiver = Archiver::new(c).unwrap();
        let items = archiver.scan().unwrap();
        let stamps: Vec<_> = items.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![50, 100]);
        assert_eq!(items[0].relative, PathBuf::from("1970/1/1/0/0/50.json"));
    }

    #[test]
    fn test_scan_uses_mtime_outside_path_scheme() {
        let dir = TempDir::new().unwrap();
        let c = config(&dir);
        let path = put(&c.source, "loose/readme.md", "x");
        let mtime = epoch_seconds(fs::metadata(&path).unwrap().modified().unwrap());

        let items = Archiver::new(c).unwrap().scan().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].timestamp, mtime);
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let archiver = Archiver::new(config(&dir)).unwrap();
        assert!(matches!(
            archiver.scan(),
            Err(crate::error::TimefoldError::Archive(ArchiveError::MissingSource { .. }))
        ));
    }

    #[test]
    fn test_size_quota_stops_at_first_overflow() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir);
        c.max_bytes = 10;
        let archiver = Archiver::new(c).unwrap();

        let batch = archiver.apply_quotas(vec![item(1, "a", 4), item(2, "b", 7), item(3, "c", 1)]);
        assert_eq!(batch.len(), 1);

        let batch = archiver.apply_quotas(vec![item(1, "big", 50), item(2, "b", 1)]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].identity, "big");
    }

    #[test]
    fn test_file_quota() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir);
        c.max_files = 2;
        let archiver = Archiver::new(c).unwrap();
        let batch = archiver.apply_quotas(vec![item(1, "a", 1), item(2, "b", 1), item(3, "c", 1)]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_validate_rejects_empty_extension() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir);
        c.extensions = vec![".".to_string()];
        assert!(c.validate().is_err());
    }
}
