//! Incremental record persistence.
//!
//! A [`Persister`] forwards records newer than its cursor from a store tree
//! to a [`RecordSink`], typically an aggregator's output going to a database.
//! The cursor is the last consumed record itself, which also serves as the
//! baseline for dropping consecutive duplicates.
//!
//! # Run outline
//!
//! 1. Load the cursor; candidates are records with a later timestamp.
//! 2. Drop candidates whose fields equal the previous record's (unless
//!    duplicates are written), stopping once `rows_per_run` rows are taken.
//! 3. Write the batch in one call.
//! 4. Save the last consumed record as the new cursor.
//!
//! A failed write leaves the cursor untouched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::cursor::{CursorStore, RecordCursorStore};
use crate::error::{ConfigError, Result};
use crate::record::{Fields, Record, TIMESTAMP_KEY};
use crate::sink::RecordSink;
use crate::store::TimeIndexedStore;

/// Configuration of one persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersisterConfig {
    /// Persister name.
    pub name: String,

    /// Root of the tree to read.
    pub source: PathBuf,

    /// Private status directory holding the cursor.
    pub status: PathBuf,

    /// Maximum rows written per run; `0` means unlimited.
    #[serde(default)]
    pub rows_per_run: usize,

    /// Write records even if they repeat the previous record's fields.
    #[serde(default)]
    pub write_duplicates: bool,

    /// Name of a field added to every row holding a SHA-256 content hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_field: Option<String>,

    /// Fields covered by the hash; empty means all fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_fields: Vec<String>,
}

impl PersisterConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required setting is missing or the hash
    /// field collides with `timestamp`.
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
        if let Some(field) = &self.hash_field
            && (field.trim().is_empty() || field == TIMESTAMP_KEY)
        {
            return Err(ConfigError::Invalid {
                job: self.name.clone(),
                setting: "hash_field".to_string(),
                reason: format!("'{field}' cannot be used as a hash field name"),
            });
        }
        Ok(())
    }
}

/// Outcome of one persist run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistReport {
    /// Rows written to the sink.
    pub written: usize,
    /// Candidates dropped as duplicates.
    pub duplicates: usize,
    /// Timestamp of the saved cursor, if it moved.
    pub cursor: Option<i64>,
}

/// Forwards new records from a store to a sink.
#[derive(Debug)]
pub struct Persister {
    config: PersisterConfig,
    store: TimeIndexedStore,
    cursor: RecordCursorStore,
}

impl Persister {
    /// Creates a persister.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: PersisterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: TimeIndexedStore::open(&config.source),
            cursor: RecordCursorStore::new(&config.status),
            config,
        })
    }

    /// Returns the persister name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the cursor store.
    pub fn cursor(&self) -> &RecordCursorStore {
        &self.cursor
    }

    /// Computes the content hash of a record.
    ///
    /// The hash covers the configured fields (all fields when none are
    /// configured) and, when duplicates are written, the timestamp.
    pub fn content_hash(&self, record: &Record) -> String {
        let mut covered: Fields = if self.config.hash_fields.is_empty() {
            record.fields.clone()
        } else {
            self.config
                .hash_fields
                .iter()
                .filter_map(|name| Some((name.clone(), record.fields.get(name)?.clone())))
                .collect()
        };
        if self.config.write_duplicates {
            covered.insert(TIMESTAMP_KEY.to_string(), Value::from(record.timestamp));
        }

        let mut hasher = Sha256::new();
        // BTreeMap keys serialize in order, so equal content hashes equally.
        hasher.update(Value::Object(covered.into_iter().collect()).to_string());
        format!("{:x}", hasher.finalize())
    }

    /// Selects the next batch: the rows to write and the record the cursor
    /// moves to once they are written.
    fn next_batch(&self, last: Option<Record>) -> (Vec<Record>, Option<Record>, usize) {
        let after = last.as_ref().map_or(i64::MIN, |record| record.timestamp);
        let candidates = self.store.records(after.saturating_add(1), i64::MAX, true);

        let mut rows = Vec::new();
        let mut duplicates = 0;
        let mut baseline = last;
        let mut consumed = None;

        for (timestamp, fields) in candidates {
            if self.config.rows_per_run > 0 && rows.len() >= self.config.rows_per_run {
                break;
            }
            let record = Record::new(timestamp, fields);
            let duplicate = !self.config.write_duplicates
                && baseline.as_ref().is_some_and(|b| b.same_content(&record));
            if duplicate {
                duplicates += 1;
            } else {
                rows.push(record.clone());
            }
            baseline = Some(record.clone());
            consumed = Some(record);
        }

        (rows, consumed, duplicates)
    }

    /// Runs one persist pass.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::SinkError`] if the sink fails the batch, or
    /// a [`crate::error::CursorError`] if the cursor cannot be saved. In both
    /// cases the stored cursor is unchanged.
    pub fn run(&self, sink: &mut dyn RecordSink) -> Result<PersistReport> {
        let (rows, consumed, duplicates) = self.next_batch(self.cursor.load());
        let Some(consumed) = consumed else {
            debug!(persister = %self.config.name, "no new records");
            return Ok(PersistReport::default());
        };

        if !rows.is_empty() {
            let batch: Vec<Record> = match &self.config.hash_field {
                Some(field) => rows
                    .iter()
                    .map(|record| {
                        let mut row = record.clone();
                        row.fields
                            .insert(field.clone(), Value::from(self.content_hash(record)));
                        row
                    })
                    .collect(),
                None => rows.clone(),
            };

            if let Err(e) = sink.write(&batch) {
                error!(
                    persister = %self.config.name,
                    sink = sink.name(),
                    rows = batch.len(),
                    error = %e,
                    "sink rejected batch, cursor not advanced"
                );
                return Err(e.into());
            }
        }

        self.cursor.save(&consumed)?;

        info!(
            persister = %self.config.name,
            written = rows.len(),
            duplicates,
            cursor = consumed.timestamp,
            "persist run complete"
        );

        Ok(PersistReport {
            written: rows.len(),
            duplicates,
            cursor: Some(consumed.timestamp),
        })
    }
}
