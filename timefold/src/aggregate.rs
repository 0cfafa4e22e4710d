//! Interval aggregation engine.
//!
//! An [`IntervalAggregator`] folds the raw records of a source store into
//! one aggregate record per fixed-length interval, written to an output store
//! the aggregator owns.
//!
//! # Design
//!
//! The output store doubles as the aggregator's cursor: its newest record is
//! the start of the last interval written, and the next run begins there.
//! That interval is recomputed each run (its source data may have grown since)
//! and its file is simply overwritten, so re-runs are idempotent.
//!
//! ```text
//! source:   101 103 | 106 108 | 111      (raw records)
//!           ────────┼─────────┼──────
//! interval: [100,105) [105,110) [110,115)
//!                               └ not yet complete: source ends at 111
//! ```
//!
//! An interval `[s, s + period)` takes the source records with
//! `s < timestamp <= s + period`. Intervals of one run are independent and
//! are reduced on a bounded worker pool; the run ends only once the pool has
//! drained.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AggregateError, ConfigError, Result};
use crate::fields::{FieldDef, FieldStat, SourceContext};
use crate::record::{Fields, Record};
use crate::store::{DataRange, TimeIndexedStore};

/// Configuration of one aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Aggregator name, also available to fields as `$aggregator_id`.
    pub name: String,

    /// Root of the raw record tree.
    pub source: PathBuf,

    /// Root of the tree this aggregator writes.
    pub output: PathBuf,

    /// Interval length in seconds.
    pub period: u64,

    /// Upper bound on intervals processed per run; `0` means unlimited.
    #[serde(default)]
    pub max_intervals_per_run: u64,

    /// Reserved. Accepted and ignored.
    #[serde(default)]
    pub fill_data_gaps: bool,

    /// Worker pool size; defaults to the available parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Output fields.
    pub fields: Vec<FieldDef>,
}

impl AggregatorConfig {
    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required setting is missing, the period
    /// is zero or too large, the thread count is zero, or a field definition
    /// is invalid or duplicated.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |setting: &str, reason: String| ConfigError::Invalid {
            job: self.name.clone(),
            setting: setting.to_string(),
            reason,
        };
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
        if self.output.as_os_str().is_empty() {
            return Err(missing("output"));
        }
        if self.source == self.output {
            return Err(invalid(
                "output",
                "must differ from the source tree".to_string(),
            ));
        }
        if self.period == 0 || i64::try_from(self.period).is_err() {
            return Err(invalid(
                "period",
                format!("must be between 1 and {} seconds", i64::MAX),
            ));
        }
        if self.threads == Some(0) {
            return Err(invalid("threads", "cannot be zero".to_string()));
        }
        if self.fields.is_empty() {
            return Err(missing("fields"));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            field.validate()?;
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::InvalidField {
                    field: field.name.clone(),
                    reason: "defined more than once".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Outcome of one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationReport {
    /// Interval starts covered: `[range.start, range.end)`.
    pub range: DataRange,
    /// Number of intervals processed.
    pub intervals: usize,
    /// Number of intervals that produced an output record.
    pub written: usize,
}

/// Reduces a raw store into per-interval aggregate records.
pub struct IntervalAggregator {
    config: AggregatorConfig,
    period: i64,
    source: TimeIndexedStore,
    output: TimeIndexedStore,
    clock: Arc<dyn Clock>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for IntervalAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalAggregator")
            .field("name", &self.config.name)
            .field("source", &self.source.root())
            .field("output", &self.output.root())
            .field("period", &self.period)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl IntervalAggregator {
    /// Creates an aggregator reading the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the worker
    /// pool cannot be created.
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an aggregator reading the given clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the worker
    /// pool cannot be created.
    pub fn with_clock(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let period = i64::try_from(config.period).map_err(|_| ConfigError::Invalid {
            job: config.name.clone(),
            setting: "period".to_string(),
            reason: "too large".to_string(),
        })?;

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let name = config.name.clone();
        let pool = builder
            .thread_name(move |i| format!("{name}-agg-{i}"))
            .build()
            .map_err(ConfigError::from)?;

        if config.fill_data_gaps {
            debug!(aggregator = %config.name, "fill_data_gaps is reserved and has no effect");
        }

        Ok(Self {
            source: TimeIndexedStore::open(&config.source),
            output: TimeIndexedStore::open(&config.output),
            period,
            clock,
            pool,
            config,
        })
    }

    /// Returns the aggregator name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the raw source store.
    pub fn source(&self) -> &TimeIndexedStore {
        &self.source
    }

    /// Returns the store this aggregator writes.
    pub fn output(&self) -> &TimeIndexedStore {
        &self.output
    }

    /// Snaps a timestamp down to an interval boundary.
    pub fn align(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.period) * self.period
    }

    /// Computes the interval starts the next run covers, `[start, end)`.
    ///
    /// Both indexes are refreshed. The start is the newest own output (or
    /// the interval holding the oldest source record on a first run); the
    /// end is the earliest of now, the per-run limit and the newest source
    /// record. Both are snapped down to interval boundaries; an empty
    /// result has `end <= start`.
    ///
    /// With a per-run limit, a gap in the source wider than the limit right
    /// after the newest output is jumped over: the run starts at the interval
    /// holding the next record instead of re-covering the empty window.
    pub fn work_range(&self) -> DataRange {
        let own_end = self
            .output
            .build_index(true)
            .last_key_value()
            .map(|(&timestamp, _)| timestamp);
        let source = self.source.build_index(true);
        let Some((&source_end, _)) = source.last_key_value() else {
            return DataRange::default();
        };

        // A record on a boundary belongs to the interval ending there.
        let interval_of = |timestamp: i64| self.align(timestamp.saturating_sub(1));
        let first_new = source
            .range(own_end.unwrap_or(i64::MIN)..)
            .next()
            .map_or(source_end, |(&timestamp, _)| timestamp);
        let mut start = interval_of(first_new);
        if let Some(own_end) = own_end {
            start = start.max(own_end);
        }

        let mut end = self.clock.now().min(source_end);
        if self.config.max_intervals_per_run > 0 {
            let limit = i64::try_from(self.config.max_intervals_per_run)
                .unwrap_or(i64::MAX)
                .saturating_mul(self.period);

            if own_end == Some(start) {
                let after_current = start.saturating_add(self.period).saturating_add(1);
                if let Some((&next, _)) = source.range(after_current..).next()
                    && interval_of(next) >= start.saturating_add(limit)
                {
                    debug!(
                        aggregator = %self.config.name,
                        from = start,
                        to = interval_of(next),
                        "skipping source gap wider than the per-run limit"
                    );
                    start = interval_of(next);
                }
            }
            end = end.min(start.saturating_add(limit));
        }

        DataRange::new(start, self.align(end))
    }

    /// Reduces one interval without writing it.
    ///
    /// Returns `None` when no field produced a value.
    pub fn reduce_interval(&self, start: i64) -> Option<Record> {
        let records = self
            .source
            .records(start.saturating_add(1), start.saturating_add(self.period), false);
        if records.is_empty() {
            return None;
        }

        let context = SourceContext {
            aggregator: &self.config.name,
            period: self.config.period,
        };

        let mut stats: BTreeMap<&str, FieldStat> = BTreeMap::new();
        for (timestamp, fields) in &records {
            for def in &self.config.fields {
                match def.value_for(fields, context) {
                    Ok(Some(value)) => {
                        let stat = stats.entry(def.name.as_str()).or_default();
                        if !stat.add(value) && def.reducer.is_statistical() {
                            warn!(
                                aggregator = %self.config.name,
                                field = %def.name,
                                timestamp,
                                "value is not numeric, excluded from statistics"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            aggregator = %self.config.name,
                            field = %def.name,
                            timestamp,
                            error = %e,
                            "could not evaluate field for record"
                        );
                    }
                }
            }
        }

        let fields: Fields = self
            .config
            .fields
            .iter()
            .filter_map(|def| {
                let value = def.reducer.reduce(stats.get(def.name.as_str())?, def.precision)?;
                Some((def.name.clone(), value))
            })
            .collect();

        if fields.is_empty() {
            None
        } else {
            Some(Record::new(start, fields))
        }
    }

    /// Reduces and writes one interval. Returns whether a record was written.
    fn process_interval(&self, start: i64) -> Result<bool> {
        match self.reduce_interval(start) {
            Some(record) => {
                self.output.write_record(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs one aggregation pass.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::IntervalWrites`] if any interval output could
    /// not be written. Every other interval is still attempted and the pool
    /// drains before the error is returned.
    pub fn run(&self) -> Result<AggregationReport> {
        let range = self.work_range();
        let starts: Vec<i64> = if range.end > range.start {
            let span = range.end - range.start;
            (0..span / self.period)
                .map(|i| range.start + i * self.period)
                .collect()
        } else {
            Vec::new()
        };

        if starts.is_empty() {
            debug!(aggregator = %self.config.name, "no complete intervals to aggregate");
            return Ok(AggregationReport {
                range,
                intervals: 0,
                written: 0,
            });
        }

        let outcomes: Vec<(i64, Result<bool>)> = self.pool.install(|| {
            starts
                .par_iter()
                .map(|&start| (start, self.process_interval(start)))
                .collect()
        });

        let mut written = 0;
        let mut failed = Vec::new();
        for (start, outcome) in outcomes {
            match outcome {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        aggregator = %self.config.name,
                        interval = start,
                        error = %e,
                        "failed to write interval"
                    );
                    failed.push(start);
                }
            }
        }

        if let Some(&first_failed) = failed.iter().min() {
            return Err(AggregateError::IntervalWrites {
                aggregator: self.config.name.clone(),
                failed: failed.len(),
                first_failed,
            }
            .into());
        }

        info!(
            aggregator = %self.config.name,
            start = range.start,
            end = range.end,
            intervals = starts.len(),
            written,
            "aggregation run complete"
        );

        Ok(AggregationReport {
            range,
            intervals: starts.len(),
            written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::expr::Expression;
    use crate::fields::{ConstantValue, FieldSource, Reducer};
    use serde_json::json;
    use tempfile::TempDir;

    fn write(store: &TimeIndexedStore, timestamp: i64, value: serde_json::Value) {
        let fields: Fields = serde_json::from_value(value).unwrap();
        store.write_record(&Record::new(timestamp, fields)).unwrap();
    }

    fn config(dir: &TempDir, fields: Vec<FieldDef>) -> AggregatorConfig {
        AggregatorConfig {
            name: "agg".to_string(),
            source: dir.path().join("raw"),
            output: dir.path().join("agg"),
            period: 5,
            max_intervals_per_run: 0,
            fill_data_gaps: false,
            threads: Some(2),
            fields,
        }
    }

    fn avg_temp() -> FieldDef {
        FieldDef::new("temp", FieldSource::Direct { field: None }, Reducer::Average)
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let dir = TempDir::new().unwrap();
        let good = config(&dir, vec![avg_temp()]);
        assert!(good.validate().is_ok());

        let mut c = good.clone();
        c.period = 0;
        assert!(c.validate().is_err());

        let mut c = good.clone();
        c.fields.clear();
        assert!(c.validate().is_err());

        let mut c = good.clone();
        c.fields.push(avg_temp());
        assert!(matches!(c.validate(), Err(ConfigError::InvalidField { .. })));

        let mut c = good.clone();
        c.output = c.source.clone();
        assert!(c.validate().is_err());

        let mut c = good;
        c.threads = Some(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_align() {
        let dir = TempDir::new().unwrap();
        let agg = IntervalAggregator::new(config(&dir, vec![avg_temp()])).unwrap();
        assert_eq!(agg.align(104), 100);
        assert_eq!(agg.align(105), 105);
        assert_eq!(agg.align(-1), -5);
    }

    #[test]
    fn test_work_range_empty_source() {
        let dir = TempDir::new().unwrap();
        let agg = IntervalAggregator::with_clock(
            config(&dir, vec![avg_temp()]),
            Arc::new(FixedClock::new(1000)),
        )
        .unwrap();
        assert_eq!(agg.work_range(), DataRange::default());
        let report = agg.run().unwrap();
        assert_eq!(report.intervals, 0);
    }

    #[test]
    fn test_work_range_bounded_by_clock_and_limit() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir, vec![avg_temp()]);
        let source = TimeIndexedStore::open(&c.source);
        for t in [101, 120, 150] {
            write(&source, t, json!({"temp": 1}));
        }

        let clock = Arc::new(FixedClock::new(133));
        let agg = IntervalAggregator::with_clock(c.clone(), clock.clone()).unwrap();
        assert_eq!(agg.work_range(), DataRange::new(100, 130));

        c.max_intervals_per_run = 2;
        let agg = IntervalAggregator::with_clock(c, clock).unwrap();
        assert_eq!(agg.work_range(), DataRange::new(100, 110));
    }

    #[test]
    fn test_first_record_on_boundary_keeps_its_interval() {
        let dir = TempDir::new().unwrap();
        let c = config(&dir, vec![avg_temp()]);
        let source = TimeIndexedStore::open(&c.source);
        write(&source, 105, json!({"temp": 8}));
        write(&source, 107, json!({"temp": 9}));

        let agg = IntervalAggregator::with_clock(c, Arc::new(FixedClock::new(1000))).unwrap();
        assert_eq!(agg.work_range(), DataRange::new(100, 105));
        let report = agg.run().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(agg.output().records(100, 100, true)[&100]["temp"], json!(8.0));
    }

    #[test]
    fn test_record_at_epoch_is_aggregated() {
        let dir = TempDir::new().unwrap();
        let c = config(&dir, vec![avg_temp()]);
        let source = TimeIndexedStore::open(&c.source);
        write(&source, 0, json!({"temp": 4}));

        let agg = IntervalAggregator::with_clock(c, Arc::new(FixedClock::new(1000))).unwrap();
        assert_eq!(agg.work_range(), DataRange::new(-5, 0));
        assert_eq!(agg.run().unwrap().written, 1);
        assert_eq!(agg.output().records(-5, -5, true)[&-5]["temp"], json!(4.0));
    }

    #[test]
    fn test_reduce_interval_boundaries() {
        let dir = TempDir::new().unwrap();
        let c = config(
            &dir,
            vec![FieldDef::new(
                "n",
                FieldSource::Direct {
                    field: Some("temp".into()),
                },
                Reducer::Count,
            )],
        );
        let source = TimeIndexedStore::open(&c.source);
        for t in [100, 101, 105, 106] {
            write(&source, t, json!({"temp": t}));
        }
        let agg = IntervalAggregator::with_clock(c, Arc::new(FixedClock::new(1000))).unwrap();
        agg.source().build_index(true);

        // (100, 105]: 101 and 105
        let record = agg.reduce_interval(100).unwrap();
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.fields["n"], json!(2));
    }

    #[test]
    fn test_interval_without_values_is_skipped() {
        let dir = TempDir::new().unwrap();
        let c = config(&dir, vec![avg_temp()]);
        let source = TimeIndexedStore::open(&c.source);
        write(&source, 101, json!({"humidity": 40}));
        write(&source, 103, json!({"temp": "n/a"}));
        let agg = IntervalAggregator::with_clock(c, Arc::new(FixedClock::new(1000))).unwrap();
        agg.source().build_index(true);
        assert!(agg.reduce_interval(100).is_none());
    }

    #[test]
    fn test_expression_and_constant_fields() {
        let dir = TempDir::new().unwrap();
        let c = config(
            &dir,
            vec![
                FieldDef::new(
                    "spread",
                    FieldSource::Expression {
                        expression: Expression::parse("high - low").unwrap(),
                    },
                    Reducer::Max,
                ),
                FieldDef::new(
                    "by",
                    FieldSource::Constant {
                        constant: ConstantValue::AggregatorId,
                    },
                    Reducer::Constant,
                ),
            ],
        );
        let source = TimeIndexedStore::open(&c.source);
        write(&source, 101, json!({"high": 10, "low": 4}));
        write(&source, 102, json!({"high": 12, "low": 3}));
        write(&source, 103, json!({"high": 12}));
        let agg = IntervalAggregator::with_clock(c, Arc::new(FixedClock::new(1000))).unwrap();
        agg.source().build_index(true);

        let record = agg.reduce_interval(100).unwrap();
        assert_eq!(record.fields["spread"], json!(9.0));
        assert_eq!(record.fields["by"], json!("agg"));
    }
}
