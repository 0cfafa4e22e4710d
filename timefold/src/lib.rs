//! # timefold
//!
//! Time-indexed file store with interval aggregation and resumable consumers.
//!
//! timefold keeps each record as a small JSON file whose path encodes its
//! UTC timestamp, `<root>/<year>/<month>/<day>/<hour>/<minute>/<second>.json`,
//! and layers three kinds of jobs on top of such trees:
//!
//! - **aggregators** fold a raw tree into fixed-period summaries in an output
//!   tree, resuming from the output they already wrote;
//! - **persisters** and **archivers** forward new records or files to a sink,
//!   resuming from a cursor that is only advanced after the sink confirmed;
//! - **cleaners** delete records every consumer is done with.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - No database: the directory tree is the index, rebuilt on demand
//! - At-least-once delivery: write first, advance the cursor second
//! - Re-running any job over the same input produces the same files
//! - Per-item problems (corrupt files, odd paths, bad values) are logged and
//!   skipped, never fatal
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use timefold::{AggregatorConfig, FieldDef, FieldSource, IntervalAggregator, Reducer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AggregatorConfig {
//!     name: "five-minute".to_string(),
//!     source: "/var/lib/weather/raw".into(),
//!     output: "/var/lib/weather/5m".into(),
//!     period: 300,
//!     max_intervals_per_run: 1000,
//!     fill_data_gaps: false,
//!     threads: None,
//!     fields: vec![
//!         FieldDef::new("temp", FieldSource::Direct { field: None }, Reducer::Average),
//!         FieldDef::new("readings", FieldSource::Direct { field: Some("temp".into()) }, Reducer::Count),
//!     ],
//! };
//!
//! let aggregator = IntervalAggregator::new(config)?;
//! let report = aggregator.run()?;
//! println!("wrote {} of {} intervals", report.written, report.intervals);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`TimeIndexedStore`]: Path-encoded record tree with a cached time index
//! - [`IntervalAggregator`]: Folds a source tree into per-interval summaries
//! - [`Persister`]: Forwards new records to a [`RecordSink`]
//! - [`Archiver`]: Forwards new files to an [`ArchiveSink`]
//! - [`Cleaner`]: Retention driven by consumer [`Watermark`]s
//! - [`JobsConfig`]: A job file describing all of the above
//!
//! ## Modules
//!
//! - [`record`]: Records and the path scheme
//! - [`store`]: Time index, range queries and record writes
//! - [`expr`]: Field formulas
//! - [`fields`]: Field definitions and reducers
//! - [`aggregate`]: Interval aggregation
//! - [`cursor`]: Cursor persistence and watermarks
//! - [`persist`]: Record persistence
//! - [`archive`]: File archiving
//! - [`sink`]: Sink traits and local sinks
//! - [`clean`]: Retention
//! - [`clock`]: Time source
//! - [`config`]: Job files
//! - `remote_write`: Prometheus remote-write sink (feature
//!   `prometheus-remote-write`)
//! - [`error`]: Error types

pub mod aggregate;
pub mod archive;
pub mod clean;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod expr;
pub mod fields;
pub mod persist;
pub mod record;
#[cfg(feature = "prometheus-remote-write")]
pub mod remote_write;
pub mod sink;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{AggregationReport, AggregatorConfig, IntervalAggregator};
pub use archive::{ArchiveItem, ArchiveReport, Archiver, ArchiverConfig};
pub use clean::{CleanReport, Cleaner, CleanerConfig, WatermarkSource};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::JobsConfig;
pub use cursor::{CursorStore, FileCursor, Watermark};
pub use error::{Result, TimefoldError};
pub use expr::Expression;
pub use fields::{FieldDef, FieldSource, Reducer};
pub use persist::{PersistReport, Persister, PersisterConfig};
pub use record::{Fields, Record};
pub use sink::{ArchiveSink, RecordSink};
pub use store::{DataRange, DataStats, TimeIndexedStore};
