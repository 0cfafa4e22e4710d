//! Job file: the typed configuration of every job the CLI runs.
//!
//! A job file is a JSON object with four optional lists:
//!
//! ```json
//! {
//!   "aggregators": [
//!     {"name": "hourly", "source": "/data/raw", "output": "/data/hourly",
//!      "period": 3600, "fields": [
//!        {"name": "temp", "type": "direct", "reducer": "average"}
//!      ]}
//!   ],
//!   "persisters": [
//!     {"name": "db", "source": "/data/hourly", "status": "/data/status/db",
//!      "sink": {"type": "json_lines", "path": "/data/export/hourly.jsonl"}}
//!   ],
//!   "archivers": [
//!     {"name": "backup", "source": "/data/raw", "status": "/data/status/backup",
//!      "sink": {"type": "copy", "destination": "/mnt/backup"}},
//!     {"name": "monthly", "source": "/data/hourly", "status": "/data/status/monthly",
//!      "sink": {"type": "zip", "destination": "/mnt/zips"}}
//!   ],
//!   "cleaners": [
//!     {"name": "raw", "root": "/data/raw", "consumers": [
//!       {"kind": "archive", "status": "/data/status/backup"},
//!       {"kind": "aggregator", "output": "/data/hourly"}
//!     ]}
//!   ]
//! }
//! ```
//!
//! Each job entry is parsed and validated on its own. An entry that fails
//! (including one with a broken formula, which is parsed while the file is
//! read) is set aside in [`JobsConfig::rejected`] and the other jobs still
//! load. Only a file that is not JSON, or that reuses a job name, fails as a
//! whole.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::aggregate::AggregatorConfig;
use crate::archive::ArchiverConfig;
use crate::clean::CleanerConfig;
use crate::error::{ConfigError, Result};
use crate::persist::PersisterConfig;
use crate::sink::{ArchiveSink, CopySink, JsonLinesSink, RecordSink, UpdateRule, ZipSink};

/// Destination of a persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordSinkConfig {
    /// Append rows as JSON lines to a file.
    JsonLines {
        /// Output file.
        path: PathBuf,
    },

    /// Push numeric fields to a Prometheus remote-write endpoint.
    #[cfg(feature = "prometheus-remote-write")]
    Prometheus {
        /// Remote-write URL.
        endpoint: String,
        /// Metric name prefix.
        #[serde(default)]
        prefix: String,
        /// Labels added to every series.
        #[serde(default)]
        labels: std::collections::BTreeMap<String, String>,
        /// Record fields used as labels.
        #[serde(default)]
        label_fields: Vec<String>,
        /// Extra HTTP headers.
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
        /// Retries after a failed push.
        #[serde(default)]
        max_retries: Option<u32>,
        /// Request timeout in seconds.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl RecordSinkConfig {
    /// Builds the sink, named after its job.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink's client cannot be created.
    pub fn build(&self, job: &str) -> Result<Box<dyn RecordSink>> {
        match self {
            Self::JsonLines { path } => Ok(Box::new(JsonLinesSink::new(job, path))),
            #[cfg(feature = "prometheus-remote-write")]
            Self::Prometheus {
                endpoint,
                prefix,
                labels,
                label_fields,
                headers,
                max_retries,
                timeout_secs,
            } => {
                use crate::remote_write::{PrometheusSink, RemoteWriteConfig};

                let mut config = RemoteWriteConfig::new(endpoint.clone()).with_prefix(prefix.clone());
                for (name, value) in labels {
                    config = config.with_label(name.clone(), value.clone());
                }
                for field in label_fields {
                    config = config.with_label_field(field.clone());
                }
                for (name, value) in headers {
                    config = config.with_header(name.clone(), value.clone());
                }
                if let Some(retries) = max_retries {
                    config = config.with_max_retries(*retries);
                }
                if let Some(secs) = timeout_secs {
                    config = config.with_timeout(std::time::Duration::from_secs(*secs));
                }
                Ok(Box::new(PrometheusSink::new(job, config)?))
            }
        }
    }
}

/// Destination of an archiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveSinkConfig {
    /// Copy files into a local directory.
    Copy {
        /// Destination root.
        destination: PathBuf,
        /// What to do when the destination file exists.
        #[serde(default)]
        update_rule: UpdateRule,
    },

    /// Pack each run's files into one ZIP archive.
    Zip {
        /// Directory the archives are written to.
        destination: PathBuf,
    },

    /// Upload files with HTTP `PUT`.
    #[cfg(feature = "remote")]
    Http {
        /// Base URL.
        base_url: String,
        /// Extra HTTP headers.
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
        /// Retries after a failed upload.
        #[serde(default)]
        max_retries: Option<u32>,
        /// Connect timeout in seconds.
        #[serde(default)]
        connect_timeout_secs: Option<u64>,
        /// Request timeout in seconds.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl ArchiveSinkConfig {
    /// Builds the sink, named after its job.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink's client cannot be created.
    pub fn build(&self, job: &str) -> Result<Box<dyn ArchiveSink>> {
        match self {
            Self::Copy {
                destination,
                update_rule,
            } => Ok(Box::new(CopySink::new(job, destination, *update_rule))),
            Self::Zip { destination } => Ok(Box::new(ZipSink::new(job, destination))),
            #[cfg(feature = "remote")]
            Self::Http {
                base_url,
                headers,
                max_retries,
                connect_timeout_secs,
                timeout_secs,
            } => {
                use crate::sink::{HttpUploadConfig, HttpUploadSink};
                use std::time::Duration;

                let mut config = HttpUploadConfig::new(base_url.clone());
                for (name, value) in headers {
                    config = config.with_header(name.clone(), value.clone());
                }
                if let Some(retries) = max_retries {
                    config = config.with_max_retries(*retries);
                }
                if let Some(secs) = connect_timeout_secs {
                    config.connect_timeout = Duration::from_secs(*secs);
                }
                if let Some(secs) = timeout_secs {
                    config.timeout = Duration::from_secs(*secs);
                }
                Ok(Box::new(HttpUploadSink::new(job, config)?))
            }
        }
    }
}

/// A persister and where it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistJob {
    /// The persister settings.
    #[serde(flatten)]
    pub persister: PersisterConfig,
    /// The destination.
    pub sink: RecordSinkConfig,
}

/// An archiver and where it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveJob {
    /// The archiver settings.
    #[serde(flatten)]
    pub archiver: ArchiverConfig,
    /// The destination.
    pub sink: ArchiveSinkConfig,
}

/// A job entry that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedJob {
    /// Job kind, e.g. `aggregator`.
    pub kind: &'static str,
    /// The entry's `name`, or its kind and position if it has none.
    pub name: String,
    /// Why the entry was rejected.
    pub reason: String,
}

/// Every job in a job file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Aggregators, run first.
    #[serde(default)]
    pub aggregators: Vec<AggregatorConfig>,
    /// Persisters.
    #[serde(default)]
    pub persisters: Vec<PersistJob>,
    /// Archivers.
    #[serde(default)]
    pub archivers: Vec<ArchiveJob>,
    /// Cleaners, run last.
    #[serde(default)]
    pub cleaners: Vec<CleanerConfig>,
    /// Entries [`JobsConfig::load`] set aside as invalid.
    #[serde(skip)]
    pub rejected: Vec<RejectedJob>,
}

/// A job file before its entries are parsed.
#[derive(Deserialize)]
struct RawJobs {
    #[serde(default)]
    aggregators: Vec<Value>,
    #[serde(default)]
    persisters: Vec<Value>,
    #[serde(default)]
    archivers: Vec<Value>,
    #[serde(default)]
    cleaners: Vec<Value>,
}

/// Parses and validates the entries of one job list, setting aside the bad ones.
fn accept_entries<T, F>(
    kind: &'static str,
    entries: Vec<Value>,
    validate: F,
    rejected: &mut Vec<RejectedJob>,
) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> std::result::Result<(), ConfigError>,
{
    let mut accepted = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| format!("{kind} #{position}"), String::from);

        let outcome = serde_json::from_value::<T>(entry)
            .map_err(|e| e.to_string())
            .and_then(|job| validate(&job).map(|()| job).map_err(|e| e.to_string()));
        match outcome {
            Ok(job) => accepted.push(job),
            Err(reason) => {
                warn!(kind, job = %name, %reason, "rejecting invalid job");
                rejected.push(RejectedJob { kind, name, reason });
            }
        }
    }
    accepted
}

/// Fails on the first name used twice.
fn check_unique_names<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Invalid {
                job: name.to_string(),
                setting: "name".to_string(),
                reason: "job names must be unique".to_string(),
            });
        }
    }
    Ok(())
}

impl JobsConfig {
    /// Reads a job file, validating each job on its own.
    ///
    /// Invalid jobs do not fail the load; they are listed in
    /// [`JobsConfig::rejected`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not a JSON object of job lists, or
    /// [`ConfigError::Invalid`] if two jobs share a name.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let raw: RawJobs = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut rejected = Vec::new();
        let aggregators = accept_entries(
            "aggregator",
            raw.aggregators,
            AggregatorConfig::validate,
            &mut rejected,
        );
        let persisters = accept_entries(
            "persister",
            raw.persisters,
            |job: &PersistJob| job.persister.validate(),
            &mut rejected,
        );
        let archivers = accept_entries(
            "archiver",
            raw.archivers,
            |job: &ArchiveJob| job.archiver.validate(),
            &mut rejected,
        );
        let cleaners =
            accept_entries("cleaner", raw.cleaners, CleanerConfig::validate, &mut rejected);

        let config = Self {
            aggregators,
            persisters,
            archivers,
            cleaners,
            rejected,
        };
        check_unique_names(
            config
                .job_names()
                .chain(config.rejected.iter().map(|job| job.name.as_str())),
        )?;
        Ok(config)
    }

    /// Validates every job and checks that job names are unique.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for aggregator in &self.aggregators {
            aggregator.validate()?;
        }
        for job in &self.persisters {
            job.persister.validate()?;
        }
        for job in &self.archivers {
            job.archiver.validate()?;
        }
        for cleaner in &self.cleaners {
            cleaner.validate()?;
        }
        check_unique_names(self.job_names())
    }

    /// Names of all jobs in run order.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.aggregators
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.persisters.iter().map(|p| p.persister.name.as_str()))
            .chain(self.archivers.iter().map(|a| a.archiver.name.as_str()))
            .chain(self.cleaners.iter().map(|c| c.name.as_str()))
    }

    /// Whether no job is configured.
    pub fn is_empty(&self) -> bool {
        self.job_names().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimefoldError;
    use tempfile::TempDir;

    const JOBS: &str = r#"{
        "aggregators": [
            {"name": "five", "source": "/d/raw", "output": "/d/five", "period": 5,
             "max_intervals_per_run": 100, "fields": [
                {"name": "temp", "type": "direct", "reducer": "average"},
                {"name": "feel", "type": "expression", "expression": "temp - wind * 0.7", "reducer": "min"}
             ]}
        ],
        "persisters": [
            {"name": "db", "source": "/d/five", "status": "/d/status/db",
             "rows_per_run": 500, "hash_field": "row_hash",
             "sink": {"type": "json_lines", "path": "/d/out.jsonl"}}
        ],
        "archivers": [
            {"name": "backup", "source": "/d/raw", "status": "/d/status/backup",
             "max_files": 1000, "extensions": ["json"],
             "sink": {"type": "copy", "destination": "/mnt/b", "update_rule": "overwrite_if_newer"}}
        ],
        "cleaners": [
            {"name": "raw", "root": "/d/raw", "consumers": [
                {"kind": "archive", "status": "/d/status/backup"},
                {"kind": "aggregator", "output": "/d/five"}
            ]}
        ]
    }"#;

    fn write_jobs(dir: &TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("jobs.json");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_full_job_file() {
        let dir = TempDir::new().unwrap();
        let config = JobsConfig::load(write_jobs(&dir, JOBS)).unwrap();

        assert_eq!(config.aggregators[0].period, 5);
        assert_eq!(config.aggregators[0].fields.len(), 2);
        assert_eq!(config.persisters[0].persister.rows_per_run, 500);
        assert_eq!(
            config.persisters[0].sink,
            RecordSinkConfig::JsonLines {
                path: PathBuf::from("/d/out.jsonl")
            }
        );
        assert_eq!(
            config.archivers[0].sink,
            ArchiveSinkConfig::Copy {
                destination: PathBuf::from("/mnt/b"),
                update_rule: UpdateRule::OverwriteIfNewer,
            }
        );
        let names: Vec<_> = config.job_names().collect();
        assert_eq!(names, vec!["five", "db", "backup", "raw"]);
    }

    #[test]
    fn test_empty_file_has_no_jobs() {
        let dir = TempDir::new().unwrap();
        let config = JobsConfig::load(write_jobs(&dir, "{}")).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let dir = TempDir::new().unwrap();
        let text = JOBS.replace("\"name\": \"backup\"", "\"name\": \"db\"");
        let err = JobsConfig::load(write_jobs(&dir, &text)).unwrap_err();
        assert!(matches!(
            err,
            TimefoldError::Config(ConfigError::Invalid { ref setting, .. }) if setting == "name"
        ));
    }

    #[test]
    fn test_broken_formula_rejects_only_its_job() {
        let dir = TempDir::new().unwrap();
        let text = JOBS.replace("temp - wind * 0.7", "temp - * 0.7");
        let config = JobsConfig::load(write_jobs(&dir, &text)).unwrap();

        assert!(config.aggregators.is_empty());
        assert_eq!(config.rejected.len(), 1);
        assert_eq!(config.rejected[0].kind, "aggregator");
        assert_eq!(config.rejected[0].name, "five");
        let names: Vec<_> = config.job_names().collect();
        assert_eq!(names, vec!["db", "backup", "raw"]);
    }

    #[test]
    fn test_invalid_job_leaves_others_loaded() {
        let dir = TempDir::new().unwrap();
        let text = r#"{
            "aggregators": [
                {"name": "good", "source": "/d/raw", "output": "/d/good", "period": 5,
                 "fields": [{"name": "temp", "type": "direct", "reducer": "average"}]},
                {"name": "bad", "source": "/d/raw", "output": "/d/bad", "period": 0,
                 "fields": [{"name": "temp", "type": "direct", "reducer": "average"}]}
            ],
            "cleaners": [{"root": "/d/raw", "consumers": []}]
        }"#;
        let config = JobsConfig::load(write_jobs(&dir, text)).unwrap();

        assert_eq!(config.aggregators.len(), 1);
        assert_eq!(config.aggregators[0].name, "good");
        let rejected: Vec<_> = config.rejected.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(rejected, vec!["bad", "cleaner #0"]);
        assert!(config.rejected[0].reason.contains("period"));
    }

    #[test]
    fn test_rejected_name_still_counts_for_uniqueness() {
        let dir = TempDir::new().unwrap();
        let text = JOBS
            .replace("\"period\": 5", "\"period\": 0")
            .replace("\"name\": \"db\"", "\"name\": \"five\"");
        let err = JobsConfig::load(write_jobs(&dir, &text)).unwrap_err();
        assert!(matches!(err, TimefoldError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_not_a_job_file() {
        let dir = TempDir::new().unwrap();
        let err = JobsConfig::load(write_jobs(&dir, "[1, 2]")).unwrap_err();
        assert!(matches!(err, TimefoldError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let err = JobsConfig::load("/nonexistent/jobs.json").unwrap_err();
        assert!(matches!(err, TimefoldError::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn test_build_sinks() {
        let dir = TempDir::new().unwrap();
        let record_sink = RecordSinkConfig::JsonLines {
            path: dir.path().join("out.jsonl"),
        }
        .build("db")
        .unwrap();
        assert_eq!(record_sink.name(), "db");

        let archive_sink = ArchiveSinkConfig::Copy {
            destination: dir.path().join("copy"),
            update_rule: UpdateRule::Skip,
        }
        .build("backup")
        .unwrap();
        assert_eq!(archive_sink.name(), "backup");
    }

    #[test]
    fn test_zip_sink_from_job_file() {
        let sink: ArchiveSinkConfig =
            serde_json::from_str(r#"{"type": "zip", "destination": "/mnt/zips"}"#).unwrap();
        assert_eq!(
            sink,
            ArchiveSinkConfig::Zip {
                destination: PathBuf::from("/mnt/zips")
            }
        );
        assert_eq!(sink.build("backup").unwrap().name(), "backup");
    }
}
