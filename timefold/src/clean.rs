//! Retention for record trees.
//!
//! A [`Cleaner`] deletes the records every consumer of a tree is done with:
//! those strictly older than the smallest consumer [`Watermark`]. A consumer
//! that has not progressed yet holds everything back. Only files inside the
//! record path scheme are ever deleted.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cursor::{FileCursorStore, RecordCursorStore, Watermark};
use crate::error::{ConfigError, Result};
use crate::store::{TimeIndexedStore, prune_empty_parents};

/// Where a cleaner reads one consumer's progress from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatermarkSource {
    /// An archiver's status directory.
    Archive {
        /// The archiver's status directory.
        status: PathBuf,
    },
    /// A persister's status directory.
    Persist {
        /// The persister's status directory.
        status: PathBuf,
    },
    /// An aggregator's output tree; its newest record is the watermark.
    Aggregator {
        /// The aggregator's output tree.
        output: PathBuf,
    },
}

impl WatermarkSource {
    /// Opens the watermark this source describes.
    pub fn open(&self) -> Box<dyn Watermark> {
        match self {
            Self::Archive { status } => Box::new(FileCursorStore::new(status)),
            Self::Persist { status } => Box::new(RecordCursorStore::new(status)),
            Self::Aggregator { output } => Box::new(StoreWatermark::new(output)),
        }
    }
}

/// Watermark of an aggregator: the start of its newest output interval.
///
/// The aggregator recomputes that interval from records strictly after its
/// start, so anything at or before it is no longer read.
#[derive(Debug)]
pub struct StoreWatermark {
    store: TimeIndexedStore,
}

impl StoreWatermark {
    /// Creates a watermark over an aggregator's output tree.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            store: TimeIndexedStore::open(output.into()),
        }
    }
}

impl Watermark for StoreWatermark {
    fn describe(&self) -> String {
        format!("aggregator output {}", self.store.root().display())
    }

    fn watermark(&self) -> Option<i64> {
        let index = self.store.build_index(true);
        index.last_key_value().map(|(&timestamp, _)| timestamp)
    }
}

/// Configuration of one cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Cleaner name.
    pub name: String,

    /// Root of the tree to clean.
    pub root: PathBuf,

    /// Every consumer of the tree.
    pub consumers: Vec<WatermarkSource>,
}

impl CleanerConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the name, root or consumer list is missing.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let missing = |setting: &str| ConfigError::Missing {
            job: self.name.clone(),
            setting: setting.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        if self.root.as_os_str().is_empty() {
            return Err(missing("root"));
        }
        if self.consumers.is_empty() {
            return Err(missing("consumers"));
        }
        Ok(())
    }
}

/// Outcome of one clean run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanReport {
    /// The watermark applied, if every consumer had one.
    pub watermark: Option<i64>,
    /// Record files deleted.
    pub deleted: usize,
}

/// Deletes records no consumer needs any more.
pub struct Cleaner {
    name: String,
    store: TimeIndexedStore,
    consumers: Vec<Box<dyn Watermark>>,
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumers: Vec<String> = self.consumers.iter().map(|c| c.describe()).collect();
        f.debug_struct("Cleaner")
            .field("name", &self.name)
            .field("root", &self.store.root())
            .field("consumers", &consumers)
            .finish()
    }
}

impl Cleaner {
    /// Creates a cleaner from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: &CleanerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_consumers(
            config.name.clone(),
            &config.root,
            config.consumers.iter().map(WatermarkSource::open).collect(),
        ))
    }

    /// Creates a cleaner over `root` with explicit consumers.
    pub fn with_consumers(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        consumers: Vec<Box<dyn Watermark>>,
    ) -> Self {
        Self {
            name: name.into(),
            store: TimeIndexedStore::open(root.into()),
            consumers,
        }
    }

    /// Returns the cleaner name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The smallest consumer watermark, or `None` if any consumer has none.
    pub fn watermark(&self) -> Option<i64> {
        let mut lowest: Option<i64> = None;
        for consumer in &self.consumers {
            let Some(mark) = consumer.watermark() else {
                debug!(cleaner = %self.name, consumer = %consumer.describe(), "consumer has no watermark yet");
                return None;
            };
            lowest = Some(lowest.map_or(mark, |low| low.min(mark)));
        }
        lowest
    }

    /// Runs one clean pass.
    ///
    /// # Errors
    ///
    /// Does not fail at present: files that cannot be deleted are logged and
    /// skipped.
    pub fn run(&self) -> Result<CleanReport> {
        let Some(watermark) = self.watermark() else {
            info!(cleaner = %self.name, "not every consumer has progressed, nothing deleted");
            return Ok(CleanReport::default());
        };

        let index = self.store.build_index(true);
        let mut deleted = 0;
        for path in index.range(..watermark).map(|(_, path)| path) {
            match fs::remove_file(path) {
                Ok(()) => {
                    deleted += 1;
                    prune_empty_parents(self.store.root(), path);
                }
                Err(e) => warn!(cleaner = %self.name, path = %path.display(), error = %e, "could not delete record"),
            }
        }
        if deleted > 0 {
            self.store.build_index(true);
        }

        info!(cleaner = %self.name, watermark, deleted, "clean run complete");
        Ok(CleanReport {
            watermark: Some(watermark),
            deleted,
        })
    }
}
