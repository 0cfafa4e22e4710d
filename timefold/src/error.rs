//! Error types for the timefold store, aggregator and consumers.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all timefold operations.
///
/// Per-item problems (a malformed path, a corrupt record, a value that is not
/// numeric, a formula that cannot be evaluated for one record) never surface
/// here: they are logged and the item is skipped. What does surface is the
/// set of failures that abort a job run.
#[derive(Error, Debug)]
pub enum TimefoldError {
    /// Error reading or writing a time-indexed store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid job configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A field formula could not be parsed or evaluated.
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// Error during an aggregation run.
    #[error("aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Error loading or saving a consumer cursor.
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// A sink rejected or failed a write.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Error during an archive run.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Error during Prometheus remote-write operations.
    #[cfg(feature = "prometheus-remote-write")]
    #[error("remote write error: {0}")]
    RemoteWrite(#[from] RemoteWriteError),
}

/// Errors that can occur while reading or writing a store tree.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory could not be walked.
    #[error("failed to walk store directory '{}': {source}", path.display())]
    Walk {
        /// The root being walked.
        path: PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// A record file or one of its parent directories could not be written.
    #[error("failed to write record '{}': {source}", path.display())]
    WriteFailed {
        /// The record path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize record at {timestamp}: {source}")]
    Serialize {
        /// Timestamp of the record.
        timestamp: i64,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The timestamp cannot be represented as a calendar date.
    #[error("timestamp {timestamp} is outside the representable date range")]
    TimestampOutOfRange {
        /// The offending timestamp.
        timestamp: i64,
    },
}

/// Errors found while validating configuration.
///
/// These are fatal for the job being constructed and nothing else.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required field is missing or empty.
    #[error("{job}: missing required setting '{setting}'")]
    Missing {
        /// Name of the job being configured.
        job: String,
        /// The missing setting.
        setting: String,
    },

    /// A setting has an unacceptable value.
    #[error("{job}: invalid setting '{setting}': {reason}")]
    Invalid {
        /// Name of the job being configured.
        job: String,
        /// The offending setting.
        setting: String,
        /// Why the value is unacceptable.
        reason: String,
    },

    /// A field definition is not usable.
    #[error("field '{field}': {reason}")]
    InvalidField {
        /// The output field name.
        field: String,
        /// Why the definition is unusable.
        reason: String,
    },

    /// The job file could not be read.
    #[error("failed to read job file '{}': {source}", path.display())]
    Read {
        /// The job file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The job file is not valid JSON for the expected shape.
    #[error("failed to parse job file '{}': {source}", path.display())]
    Parse {
        /// The job file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors produced by the formula parser and evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// An unexpected character in the formula.
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar {
        /// The offending character.
        ch: char,
        /// Byte offset into the formula.
        offset: usize,
    },

    /// The token stream does not form a valid expression.
    #[error("syntax error at offset {offset}: {reason}")]
    Syntax {
        /// Byte offset into the formula.
        offset: usize,
        /// What was expected.
        reason: String,
    },

    /// A function name is not known or is called with the wrong arity.
    #[error("unknown function '{name}' with {arity} argument(s)")]
    UnknownFunction {
        /// The function name.
        name: String,
        /// Number of arguments supplied.
        arity: usize,
    },

    /// A variable has no numeric binding for this record.
    #[error("variable '{0}' is not bound")]
    Unbound(String),

    /// Evaluation produced NaN or an infinity.
    #[error("expression evaluated to a non-finite value")]
    NonFinite,
}

/// Errors that can occur during an aggregation run.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// One or more interval outputs could not be written.
    #[error("{aggregator}: {failed} interval output(s) failed to write, first at {first_failed}")]
    IntervalWrites {
        /// Name of the aggregator.
        aggregator: String,
        /// How many intervals failed.
        failed: usize,
        /// Start timestamp of the earliest failed interval.
        first_failed: i64,
    },
}

/// Errors that can occur while loading or saving a cursor.
#[derive(Error, Debug)]
pub enum CursorError {
    /// The status directory or cursor file could not be written.
    #[error("failed to save cursor to '{}': {source}", path.display())]
    Save {
        /// The cursor file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The cursor could not be serialized.
    #[error("failed to serialize cursor: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by sinks.
///
/// A sink either accepts a whole batch or fails it; there is no partial
/// success variant.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Local I/O against the destination failed.
    #[error("sink '{sink}' failed writing '{}': {source}", path.display())]
    Io {
        /// Sink name.
        sink: String,
        /// Destination path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A row could not be encoded for the destination.
    #[error("sink '{sink}' could not encode a row: {source}")]
    Encode {
        /// Sink name.
        sink: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A ZIP archive could not be written.
    #[error("sink '{sink}' failed writing archive '{}': {source}", path.display())]
    Zip {
        /// Sink name.
        sink: String,
        /// Archive path.
        path: PathBuf,
        /// The underlying ZIP error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The destination rejected the write.
    #[error("sink '{sink}' rejected the write: {reason}")]
    Rejected {
        /// Sink name.
        sink: String,
        /// Reason given by the destination.
        reason: String,
    },

    /// HTTP transfer failed after retries.
    #[cfg(feature = "remote")]
    #[error("sink '{sink}' HTTP request failed: {source}")]
    Http {
        /// Sink name.
        sink: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// A Prometheus remote-write push failed.
    #[cfg(feature = "prometheus-remote-write")]
    #[error("sink '{sink}' remote write failed: {source}")]
    RemoteWrite {
        /// Sink name.
        sink: String,
        /// The underlying remote-write error.
        #[source]
        source: RemoteWriteError,
    },
}

/// Errors that can occur during an archive run.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The source tree does not exist.
    #[error("archive source '{}' does not exist", path.display())]
    MissingSource {
        /// The missing source directory.
        path: PathBuf,
    },

    /// The source tree could not be walked.
    #[error("failed to walk archive source '{}': {source}", path.display())]
    Walk {
        /// The source root.
        path: PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },
}

/// Errors that can occur during Prometheus remote-write operations.
#[cfg(feature = "prometheus-remote-write")]
#[derive(Error, Debug)]
pub enum RemoteWriteError {
    /// Failed to serialize `WriteRequest` to protobuf.
    #[error("failed to serialize write request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress data with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after retries.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned non-2xx status after retries.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

/// Type alias for `Result<T, TimefoldError>`.
pub type Result<T> = std::result::Result<T, TimefoldError>;
