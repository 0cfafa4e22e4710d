//! Resumable cursor protocol shared by incremental consumers.
//!
//! Every consumer (persister, archiver) keeps a durable marker of the last
//! item its sink confirmed, in a private status directory. The rule is the
//! same everywhere: write the batch, and only then save the advanced cursor.
//! A crash in between replays the batch on the next run, which is harmless
//! because sinks are idempotent or the consumer deduplicates.
//!
//! Two cursor shapes are provided:
//!
//! - [`FileCursor`]: `(timestamp, identity)` for file archival, stored as a
//!   single text line `"<timestamp> <identity>"`.
//! - [`Record`]: the last emitted record for persistence, stored as a JSON
//!   object. It is both the resume point and the deduplication baseline.
//!
//! Both live at `<status>/last_record`.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::error;

use crate::error::{CursorError, Result};
use crate::record::Record;
use crate::store::write_atomic;

/// Name of the cursor file inside a consumer's status directory.
pub const CURSOR_FILE: &str = "last_record";

/// Durable storage for one consumer's cursor.
pub trait CursorStore {
    /// The cursor type.
    type Cursor;

    /// Loads the saved cursor.
    ///
    /// Returns `None` if there is no cursor yet. A cursor file that cannot
    /// be read or parsed is logged and also treated as absent, so the
    /// consumer starts over from the beginning.
    fn load(&self) -> Option<Self::Cursor>;

    /// Saves the cursor, replacing the previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError`] if the status directory or file cannot be
    /// written.
    fn save(&self, cursor: &Self::Cursor) -> Result<()>;
}

/// Anything that can report how far a consumer has safely progressed.
///
/// Source records strictly older than every consumer's watermark are no
/// longer needed by anyone.
pub trait Watermark: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Timestamp below which the consumer needs no more data, or `None` if
    /// it has not progressed at all yet.
    fn watermark(&self) -> Option<i64>;
}

/// Resume marker for file archival.
///
/// Orders by timestamp, then by identity (the full source path), so items
/// sharing a timestamp have a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileCursor {
    /// Timestamp of the last archived item.
    pub timestamp: i64,
    /// Identity of the last archived item.
    pub identity: String,
}

impl FileCursor {
    /// Creates a cursor.
    pub fn new(timestamp: i64, identity: impl Into<String>) -> Self {
        Self {
            timestamp,
            identity: identity.into(),
        }
    }

    /// True if an item at `(timestamp, identity)` comes after this cursor.
    pub fn precedes(&self, timestamp: i64, identity: &str) -> bool {
        match timestamp.cmp(&self.timestamp) {
            Ordering::Greater => true,
            Ordering::Equal => identity > self.identity.as_str(),
            Ordering::Less => false,
        }
    }
}

impl Ord for FileCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.identity.cmp(&other.identity))
    }
}

impl PartialOrd for FileCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FileCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp, self.identity)
    }
}

impl FromStr for FileCursor {
    type Err = String;

    /// Parses `"<timestamp> <identity>"`. The identity is everything after
    /// the first space and may itself contain spaces.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        let (timestamp, identity) = line
            .split_once(' ')
            .ok_or_else(|| format!("expected '<timestamp> <identity>', got '{line}'"))?;
        let timestamp = timestamp
            .parse()
            .map_err(|_| format!("invalid timestamp '{timestamp}'"))?;
        if identity.is_empty() {
            return Err("empty identity".to_string());
        }
        Ok(Self::new(timestamp, identity))
    }
}

fn cursor_path(status_dir: &Path) -> PathBuf {
    status_dir.join(CURSOR_FILE)
}

fn read_cursor_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot read cursor, starting over");
            None
        }
    }
}

fn write_cursor_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CursorError::Save {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    write_atomic(path, data).map_err(|e| CursorError::Save {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// [`FileCursor`] persistence at `<status>/last_record`.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Creates a store for the cursor in `status_dir`.
    pub fn new<P: AsRef<Path>>(status_dir: P) -> Self {
        Self {
            path: cursor_path(status_dir.as_ref()),
        }
    }

    /// Returns the cursor file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for FileCursorStore {
    type Cursor = FileCursor;

    fn load(&self) -> Option<FileCursor> {
        let content = read_cursor_file(&self.path)?;
        match content.parse() {
            Ok(cursor) => Some(cursor),
            Err(reason) => {
                error!(path = %self.path.display(), %reason, "corrupt cursor, starting over");
                None
            }
        }
    }

    fn save(&self, cursor: &FileCursor) -> Result<()> {
        write_cursor_file(&self.path, cursor.to_string().as_bytes())
    }
}

impl Watermark for FileCursorStore {
    fn describe(&self) -> String {
        format!("archive cursor {}", self.path.display())
    }

    fn watermark(&self) -> Option<i64> {
        self.load().map(|cursor| cursor.timestamp)
    }
}

/// Last-emitted-record persistence at `<status>/last_record`.
#[derive(Debug, Clone)]
pub struct RecordCursorStore {
    path: PathBuf,
}

impl RecordCursorStore {
    /// Creates a store for the cursor in `status_dir`.
    pub fn new<P: AsRef<Path>>(status_dir: P) -> Self {
        Self {
            path: cursor_path(status_dir.as_ref()),
        }
    }

    /// Returns the cursor file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for RecordCursorStore {
    type Cursor = Record;

    fn load(&self) -> Option<Record> {
        let content = read_cursor_file(&self.path)?;
        let record = Record::from_json(&content);
        if record.is_none() {
            error!(path = %self.path.display(), "corrupt cursor, starting over");
        }
        record
    }

    fn save(&self, cursor: &Record) -> Result<()> {
        let data = serde_json::to_string(&cursor.to_json_map())
            .map_err(|e| CursorError::Serialize { source: e })?;
        write_cursor_file(&self.path, data.as_bytes())
    }
}

impl Watermark for RecordCursorStore {
    fn describe(&self) -> String {
        format!("persist cursor {}", self.path.display())
    }

    fn watermark(&self) -> Option<i64> {
        self.load().map(|record| record.timestamp)
    }
}
