//! Time-indexed store over a directory tree of record files.
//!
//! This module turns a tree of per-timestamp JSON files into a sorted,
//! cached index that can answer range and statistics queries, and loads
//! record contents on demand.
//!
//! # Design
//!
//! - One full walk of the tree builds a `timestamp -> path` index; the index
//!   is cached until a caller asks for a refresh.
//! - Files outside the six-level integer path scheme are skipped with a
//!   warning, never fatal.
//! - Record loads fan out across the rayon pool; corrupt or vanished files
//!   are skipped with a warning and excluded from the result.
//! - Writes go to a `.tmp` sibling first and are renamed into place, so a
//!   concurrent walk never sees a half-written record.
//!
//! # File Layout
//!
//! ```text
//! root/
//! └── 2024/                     <- year
//!     └── 3/                    <- month (not zero padded)
//!         └── 5/                <- day
//!             └── 7/            <- hour
//!                 └── 8/        <- minute
//!                     ├── 9.json    <- second
//!                     └── 14.json
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use timefold::store::TimeIndexedStore;
//!
//! let store = TimeIndexedStore::open("/var/lib/readings/weather");
//! let stats = store.stats(0, i64::MAX, true);
//! println!("{} records between {} and {}", stats.count, stats.range.start, stats.range.end);
//!
//! for (timestamp, fields) in store.records(stats.range.start, stats.range.end, false) {
//!     println!("{timestamp}: {fields:?}");
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use rayon::prelude::*;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::record::{Fields, Record, relative_record_path, timestamp_from_path};

/// Suffix of files that are still being written.
pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// Sorted mapping from timestamp to record file path.
pub type TimeIndex = BTreeMap<i64, PathBuf>;

/// Records loaded from a store, keyed by timestamp.
pub type RecordSet = BTreeMap<i64, Fields>;

/// Inclusive time range of data.
///
/// A range of `(0, 0)` means "no data". A tree holding a single record at
/// epoch 0 has the same range, so test a store for data with
/// [`TimeIndexedStore::is_empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataRange {
    /// First timestamp (inclusive).
    pub start: i64,
    /// Last timestamp (inclusive).
    pub end: i64,
}

impl DataRange {
    /// Creates a range from its bounds.
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// True for the zero range returned when there is no data.
    ///
    /// Also true for a range that really is `[0, 0]`.
    pub fn is_empty(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// Summary of the data inside a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataStats {
    /// Requested bounds snapped to the nearest existing records.
    pub range: DataRange,
    /// Number of records inside the requested bounds.
    pub count: usize,
}

/// A directory tree of record files, presented as a range-queryable store.
///
/// # Thread Safety
///
/// All queries take `&self`; the cached index sits behind a lock and is
/// shared with readers through an `Arc`, so a store can be used from the
/// worker threads of an aggregation run. A single process is assumed to own
/// the tree; concurrent external mutation gives undefined query results.
#[derive(Debug)]
pub struct TimeIndexedStore {
    /// Root directory of the tree.
    root: PathBuf,
    /// Cached index, `None` until the first walk.
    index: RwLock<Option<Arc<TimeIndex>>>,
}

impl TimeIndexedStore {
    /// Creates a store handle for the tree at `root`.
    ///
    /// No I/O happens until the first query. The directory does not need to
    /// exist; an absent tree behaves as an empty one.
    pub fn open<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index: RwLock::new(None),
        }
    }

    /// Returns the root directory of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the index, walking the tree if it has not been walked yet or
    /// if `refresh` is set.
    ///
    /// A refresh costs one full walk, O(file count).
    pub fn build_index(&self, refresh: bool) -> Arc<TimeIndex> {
        if !refresh
            && let Some(index) = self.index.read().unwrap_or_else(PoisonError::into_inner).as_ref()
        {
            return Arc::clone(index);
        }

        let index = Arc::new(self.walk());
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&index));
        index
    }

    /// Returns the number of records in the cached index.
    pub fn len(&self) -> usize {
        self.build_index(false).len()
    }

    /// True if the cached index holds no records.
    pub fn is_empty(&self) -> bool {
        self.build_index(false).is_empty()
    }

    /// Walks the tree and collects every well-formed record path.
    fn walk(&self) -> TimeIndex {
        let mut index = TimeIndex::new();
        if !self.root.exists() {
            return index;
        }

        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let e = StoreError::Walk {
                        path: self.root.clone(),
                        source: e,
                    };
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                debug!(path = %path.display(), "skipping in-progress file");
                continue;
            }

            match timestamp_from_path(&self.root, path) {
                Some(timestamp) => {
                    // Two files at the same second is a misconfiguration; last walked wins.
                    index.insert(timestamp, path.to_path_buf());
                }
                None => warn!(path = %path.display(), "skipping file outside the record path scheme"),
            }
        }

        index
    }

    /// Returns the first and last timestamps of the cached index.
    ///
    /// Returns the zero range if the tree is empty or absent.
    pub fn range(&self) -> DataRange {
        let index = self.build_index(false);
        match (index.first_key_value(), index.last_key_value()) {
            (Some((&start, _)), Some((&end, _))) => DataRange::new(start, end),
            _ => DataRange::default(),
        }
    }

    /// Returns the part of the index with `start <= timestamp <= end`.
    pub fn data_in_range(&self, start: i64, end: i64) -> TimeIndex {
        if start > end {
            return TimeIndex::new();
        }
        self.build_index(false)
            .range(start..=end)
            .map(|(&timestamp, path)| (timestamp, path.clone()))
            .collect()
    }

    /// Returns statistics for the requested range.
    ///
    /// The returned range is snapped to the nearest existing records: the
    /// start moves up to the first record at or after `start`, the end moves
    /// down to the last record at or before `end`. When no such record
    /// exists the bound falls back to the newest (for the start) or oldest
    /// (for the end) record, so callers computing processing windows always
    /// get real data boundaries rather than a miss.
    pub fn stats(&self, start: i64, end: i64, refresh: bool) -> DataStats {
        let index = self.build_index(refresh);
        if index.is_empty() {
            return DataStats::default();
        }

        let snapped_start = index
            .range(start..)
            .next()
            .or_else(|| index.last_key_value())
            .map_or(0, |(&timestamp, _)| timestamp);
        let snapped_end = index
            .range(..=end)
            .next_back()
            .or_else(|| index.first_key_value())
            .map_or(0, |(&timestamp, _)| timestamp);

        let count = if start > end {
            0
        } else {
            index.range(start..=end).count()
        };

        DataStats {
            range: DataRange::new(snapped_start, snapped_end),
            count,
        }
    }

    /// Loads every record with `start <= timestamp <= end`.
    ///
    /// Files are read in parallel. A file that is missing, empty, not valid
    /// JSON or lacks a `timestamp` key is skipped with a warning; it never
    /// aborts the query. Records are keyed by their path timestamp.
    pub fn records(&self, start: i64, end: i64, refresh: bool) -> RecordSet {
        if refresh {
            self.build_index(true);
        }
        let paths = self.data_in_range(start, end);
        if paths.is_empty() {
            return RecordSet::new();
        }

        paths
            .into_par_iter()
            .filter_map(|(timestamp, path)| {
                load_record(&path).map(|record| (timestamp, record.fields))
            })
            .collect()
    }

    /// Returns the full path a record with this timestamp is stored at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TimestampOutOfRange`] if the timestamp has no
    /// calendar representation.
    pub fn record_path(&self, timestamp: i64) -> Result<PathBuf> {
        Ok(self.root.join(relative_record_path(timestamp)?))
    }

    /// Writes a record to its encoded path, replacing any existing file.
    ///
    /// Parent directories are created as needed; losing a race with another
    /// writer creating the same directory is harmless. The cached index, if
    /// any, is updated to include the record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriteFailed`] if the directories or file cannot
    /// be written, or a serialization error if a value cannot be encoded.
    pub fn write_record(&self, record: &Record) -> Result<PathBuf> {
        let path = self.record_path(record.timestamp)?;
        let content = record.to_json()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        write_atomic(&path, content.as_bytes()).map_err(|e| StoreError::WriteFailed {
            path: path.clone(),
            source: e,
        })?;

        if let Some(index) = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Arc::make_mut(index).insert(record.timestamp, path.clone());
        }

        Ok(path)
    }
}

/// Reads and parses one record file, warning on anything unusable.
pub fn load_record(path: &Path) -> Option<Record> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable record");
            return None;
        }
    };

    if content.trim().is_empty() {
        warn!(path = %path.display(), "skipping empty record");
        return None;
    }

    let record = Record::from_json(&content);
    if record.is_none() {
        warn!(path = %path.display(), "skipping corrupt record");
    }
    record
}

/// Writes `data` to a `.tmp` sibling and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Removes the now-empty directories between `path` and `root`.
///
/// Walks up from the parent of `path` and stops at the first directory that
/// still has entries, or at `root`, which is never removed.
pub(crate) fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the climb.
        if fs::remove_dir(current).is_err() {
            break;
        }
        debug!(dir = %current.display(), "removed empty directory");
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(timestamp: i64, temp: f64) -> Record {
        let mut fields = Fields::new();
        fields.insert("temp".to_string(), json!(temp));
        Record::new(timestamp, fields)
    }

    fn store_with(dir: &Path, timestamps: &[i64]) -> TimeIndexedStore {
        let store = TimeIndexedStore::open(dir);
        for &ts in timestamps {
            #[allow(clippy::cast_precision_loss)] // small test values
            store.write_record(&record(ts, ts as f64)).unwrap();
        }
        store
    }

    #[test]
    fn test_absent_tree_is_empty() {
        let dir = tempdir().unwrap();
        let store = TimeIndexedStore::open(dir.path().join("missing"));
        assert!(store.build_index(true).is_empty());
        assert!(store.range().is_empty());
        assert_eq!(store.stats(0, 1000, true), DataStats::default());
        assert!(store.records(0, 1000, true).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_at_epoch_is_data() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[0]);
        assert_eq!(store.range(), DataRange::new(0, 0));
        assert!(!store.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_range_query_inclusive_bounds() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100, 105, 110, 120]);

        let found: Vec<i64> = store.data_in_range(101, 115).into_keys().collect();
        assert_eq!(found, vec![105, 110]);

        let found: Vec<i64> = store.data_in_range(105, 110).into_keys().collect();
        assert_eq!(found, vec![105, 110]);

        assert!(store.data_in_range(115, 101).is_empty());
    }

    #[test]
    fn test_range_bounds() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[120, 100, 110]);
        store.build_index(true);
        assert_eq!(store.range(), DataRange::new(100, 120));
    }

    #[test]
    fn test_stats_snap_to_available_data() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100, 105, 110, 120]);

        let stats = store.stats(101, 115, true);
        assert_eq!(stats.range, DataRange::new(105, 110));
        assert_eq!(stats.count, 2);

        let stats = store.stats(0, i64::MAX, false);
        assert_eq!(stats.range, DataRange::new(100, 120));
        assert_eq!(stats.count, 4);

        // No record at or after 200: start falls back to the newest record.
        let stats = store.stats(200, 300, false);
        assert_eq!(stats.range, DataRange::new(120, 120));
        assert_eq!(stats.count, 0);
    }

    #[test]
    fn test_cache_requires_refresh_for_external_writes() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100]);
        assert_eq!(store.build_index(true).len(), 1);

        // A second handle on the same tree writes behind the first one's back.
        let other = TimeIndexedStore::open(dir.path());
        other.write_record(&record(200, 1.0)).unwrap();

        assert_eq!(store.build_index(false).len(), 1);
        assert_eq!(store.build_index(true).len(), 2);
    }

    #[test]
    fn test_malformed_paths_are_skipped() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100]);

        fs::write(dir.path().join("README.md"), "notes").unwrap();
        let bad = dir.path().join("1970/1/1/0/x");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("5.json"), r#"{"timestamp":5}"#).unwrap();
        fs::write(dir.path().join("1970/1/1/0/1/50.json.tmp"), "{").unwrap();

        let index = store.build_index(true);
        assert_eq!(index.keys().copied().collect::<Vec<_>>(), vec![100]);
    }

    #[test]
    fn test_corrupt_records_are_skipped() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100, 101, 102, 103]);

        fs::write(store.record_path(101).unwrap(), "").unwrap();
        fs::write(store.record_path(102).unwrap(), "{broken").unwrap();
        fs::write(store.record_path(103).unwrap(), r#"{"temp":3}"#).unwrap();

        let records = store.records(0, 1000, true);
        assert_eq!(records.keys().copied().collect::<Vec<_>>(), vec![100]);
        assert_eq!(records[&100]["temp"], json!(100.0));
    }

    #[test]
    fn test_vanished_file_is_skipped() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100, 101]);
        store.build_index(true);
        fs::remove_file(store.record_path(101).unwrap()).unwrap();

        let records = store.records(0, 1000, false);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_write_record_overwrites() {
        let dir = tempdir().unwrap();
        let store = TimeIndexedStore::open(dir.path());
        store.write_record(&record(100, 1.0)).unwrap();
        store.write_record(&record(100, 2.0)).unwrap();

        let records = store.records(100, 100, true);
        assert_eq!(records[&100]["temp"], json!(2.0));
        assert!(!dir.path().join("1970/1/1/0/1/40.json.tmp").exists());
    }

    #[test]
    fn test_write_updates_cached_index() {
        let dir = tempdir().unwrap();
        let store = TimeIndexedStore::open(dir.path());
        store.build_index(true);
        store.write_record(&record(300, 1.0)).unwrap();
        assert_eq!(store.range(), DataRange::new(300, 300));
    }

    #[test]
    fn test_prune_empty_parents_stops_at_root_and_siblings() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[100, 130]);
        let first = store.record_path(100).unwrap();
        fs::remove_file(&first).unwrap();
        prune_empty_parents(dir.path(), &first);

        // 100 lives in minute 1, 130 in minute 2 of the same hour.
        assert!(!first.parent().unwrap().exists());
        assert!(dir.path().join("1970/1/1/0").exists());

        let second = store.record_path(130).unwrap();
        fs::remove_file(&second).unwrap();
        prune_empty_parents(dir.path(), &second);
        assert!(!dir.path().join("1970").exists());
        assert!(dir.path().exists());
    }
}
