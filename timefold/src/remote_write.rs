//! Prometheus remote-write sink for persisted records.
//!
//! Turns batches of records into the Prometheus remote-write protobuf
//! format: every numeric field becomes one sample of the series named after
//! the field, stamped with the record's timestamp. The payload is snappy
//! compressed and pushed with retry and exponential backoff.
//!
//! This module is only available when the `prometheus-remote-write` feature
//! is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use timefold::persist::{Persister, PersisterConfig};
//! use timefold::remote_write::{PrometheusSink, RemoteWriteConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let persister = Persister::new(PersisterConfig {
//!     name: "weather-prom".to_string(),
//!     source: "/var/lib/readings/hourly".into(),
//!     status: "/var/lib/readings/status/weather-prom".into(),
//!     rows_per_run: 500,
//!     write_duplicates: false,
//!     hash_field: None,
//!     hash_fields: Vec::new(),
//! })?;
//!
//! let config = RemoteWriteConfig::new("http://localhost:9090/api/v1/write")
//!     .with_prefix("weather_")
//!     .with_label("station", "north");
//! let mut sink = PrometheusSink::new("prometheus", config)?;
//! persister.run(&mut sink)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use prost::Message;
use tracing::warn;

use crate::error::{RemoteWriteError, Result, SinkError};
use crate::record::{Record, scalar_text, value_as_f64};
use crate::sink::RecordSink;

/// Prometheus remote-write protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto`.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Samples of this series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single sample.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// The sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

/// Configuration for a Prometheus remote-write endpoint.
#[derive(Debug, Clone)]
pub struct RemoteWriteConfig {
    /// Remote write endpoint URL (e.g., `http://localhost:9090/api/v1/write`).
    pub endpoint: String,
    /// HTTP timeout for write requests.
    pub timeout: Duration,
    /// Maximum number of retry attempts on failure.
    pub max_retries: u32,
    /// Initial backoff duration between retries (doubles each attempt).
    pub retry_backoff: Duration,
    /// Optional HTTP headers (e.g., for authentication).
    pub headers: Vec<(String, String)>,
    /// Prefix prepended to every metric name.
    pub prefix: String,
    /// Labels added to every series.
    pub labels: Vec<(String, String)>,
    /// Record fields turned into labels instead of samples.
    pub label_fields: Vec<String>,
}

impl RemoteWriteConfig {
    /// Creates a new config with sensible defaults.
    ///
    /// Defaults: 30s timeout, 3 retries, 100ms initial backoff, no prefix.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            headers: Vec::new(),
            prefix: String::new(),
            labels: Vec::new(),
            label_fields: Vec::new(),
        }
    }

    /// Adds an HTTP header (e.g., for authentication tokens).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the metric name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Adds a label to every series.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }

    /// Uses a record field as a label.
    #[must_use]
    pub fn with_label_field(mut self, field: impl Into<String>) -> Self {
        self.label_fields.push(field.into());
        self
    }
}

/// Pushes record batches to a remote-write endpoint.
#[derive(Debug)]
pub struct PrometheusSink {
    name: String,
    config: RemoteWriteConfig,
    client: reqwest::blocking::Client,
}

impl PrometheusSink {
    /// Creates the sink and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteWriteError::ClientCreate`] if the client cannot be
    /// built.
    pub fn new(name: impl Into<String>, config: RemoteWriteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteWriteError::ClientCreate { source: e })?;
        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }
}

impl RecordSink for PrometheusSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, batch: &[Record]) -> std::result::Result<(), SinkError> {
        let request = build_write_request(batch, &self.config);
        if request.timeseries.is_empty() {
            return Ok(());
        }
        serialize_write_request(&request)
            .and_then(|bytes| compress_snappy(&bytes))
            .and_then(|body| send_with_retry(&self.client, &self.config, &body))
            .map_err(|e| SinkError::RemoteWrite {
                sink: self.name.clone(),
                source: e,
            })
    }
}

/// Encodes records as a Prometheus remote-write payload.
///
/// Returns the snappy-compressed protobuf bytes suitable for HTTP POST.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode(records: &[Record], config: &RemoteWriteConfig) -> Result<Vec<u8>> {
    let request = build_write_request(records, config);
    let proto_bytes = serialize_write_request(&request)?;
    Ok(compress_snappy(&proto_bytes)?)
}

/// Converts records to a `WriteRequest`, one series per metric and label set.
fn build_write_request(records: &[Record], config: &RemoteWriteConfig) -> proto::WriteRequest {
    let mut series: BTreeMap<Vec<(String, String)>, Vec<proto::Sample>> = BTreeMap::new();

    for record in records {
        let mut record_labels = config.labels.clone();
        for field in &config.label_fields {
            if let Some(value) = record.fields.get(field) {
                record_labels.push((sanitize(field), scalar_text(value)));
            }
        }

        for (field, value) in &record.fields {
            if config.label_fields.contains(field) {
                continue;
            }
            let Some(sample) = value_as_f64(value) else {
                continue;
            };
            let name = format!("{}{}", config.prefix, sanitize(field));
            series
                .entry(build_labels(&name, &record_labels))
                .or_default()
                .push(proto::Sample {
                    value: sample,
                    timestamp: record.timestamp.saturating_mul(1000),
                });
        }
    }

    let timeseries = series
        .into_iter()
        .map(|(labels, samples)| proto::TimeSeries {
            labels: labels
                .into_iter()
                .map(|(name, value)| proto::Label { name, value })
                .collect(),
            samples,
        })
        .collect();

    proto::WriteRequest { timeseries }
}

/// Builds the sorted label set of one series.
///
/// Adds the `__name__` label; remote-write receivers expect labels sorted
/// by name.
fn build_labels(name: &str, labels: &[(String, String)]) -> Vec<(String, String)> {
    let mut result = Vec::with_capacity(labels.len() + 1);
    result.push(("__name__".to_string(), name.to_string()));
    result.extend(labels.iter().cloned());
    result.sort_by(|a, b| a.0.cmp(&b.0));
    result
}

/// Replaces characters not allowed in metric and label names with `_`.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Serializes a `WriteRequest` to protobuf bytes.
fn serialize_write_request(
    request: &proto::WriteRequest,
) -> std::result::Result<Vec<u8>, RemoteWriteError> {
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| RemoteWriteError::Serialization { source: e })?;
    Ok(buf)
}

/// Compresses bytes using Snappy (required by the remote-write protocol).
fn compress_snappy(data: &[u8]) -> std::result::Result<Vec<u8>, RemoteWriteError> {
    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(data)
        .map_err(|e| RemoteWriteError::Compression { source: e })
}

/// Sends compressed protobuf to the endpoint with exponential backoff retry.
fn send_with_retry(
    client: &reqwest::blocking::Client,
    config: &RemoteWriteConfig,
    body: &[u8],
) -> std::result::Result<(), RemoteWriteError> {
    let mut backoff = config.retry_backoff;
    let mut attempt = 0;

    loop {
        let mut request = client
            .post(&config.endpoint)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0");

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let error = match request.body(body.to_vec()).send() {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().unwrap_or_default();
                RemoteWriteError::HttpStatus { status, body: text }
            }
            Err(e) => RemoteWriteError::RequestFailed { source: e },
        };

        if attempt >= config.max_retries {
            return Err(error);
        }
        warn!(endpoint = %config.endpoint, attempt, error = %error, "remote write failed, retrying");
        std::thread::sleep(backoff);
        backoff *= 2;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use serde_json::json;

    fn record(timestamp: i64, value: serde_json::Value) -> Record {
        let fields: Fields = serde_json::from_value(value).unwrap();
        Record::new(timestamp, fields)
    }

    #[test]
    fn test_build_labels_sorted() {
        let labels = vec![
            ("station".to_string(), "north".to_string()),
            ("city".to_string(), "oslo".to_string()),
        ];
        let result = build_labels("temp", &labels);
        let names: Vec<_> = result.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["__name__", "city", "station"]);
        assert_eq!(result[0].1, "temp");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("wind.speed"), "wind_speed");
        assert_eq!(sanitize("1h-rain"), "_1h_rain");
        assert_eq!(sanitize("ok_name"), "ok_name");
    }

    #[test]
    fn test_build_write_request_groups_numeric_fields() {
        let config = RemoteWriteConfig::new("http://unused")
            .with_prefix("wx_")
            .with_label_field("station");
        let records = vec![
            record(100, json!({"temp": 10.5, "hum": "40", "sky": "clear", "station": "n"})),
            record(200, json!({"temp": 11.0, "station": "n"})),
            record(200, json!({"temp": 3.0, "station": "s"})),
        ];

        let request = build_write_request(&records, &config);
        // wx_hum{n}, wx_temp{n}, wx_temp{s}
        assert_eq!(request.timeseries.len(), 3);

        let temp_n = request
            .timeseries
            .iter()
            .find(|ts| {
                ts.labels.iter().any(|l| l.value == "wx_temp")
                    && ts.labels.iter().any(|l| l.name == "station" && l.value == "n")
            })
            .unwrap();
        assert_eq!(temp_n.samples.len(), 2);
        assert_eq!(temp_n.samples[0].timestamp, 100_000);
        assert_eq!(temp_n.samples[1].value, 11.0);
    }

    #[test]
    fn test_encode_roundtrip() {
        let config = RemoteWriteConfig::new("http://unused");
        let bytes = encode(&[record(1_700_000_000, json!({"temp": 99.9}))], &config).unwrap();

        let mut decoder = snap::raw::Decoder::new();
        let decompressed = decoder.decompress_vec(&bytes).unwrap();
        let request = proto::WriteRequest::decode(decompressed.as_slice()).unwrap();

        assert_eq!(request.timeseries.len(), 1);
        assert_eq!(request.timeseries[0].samples[0].value, 99.9);
        assert_eq!(request.timeseries[0].samples[0].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_write_without_numeric_fields_sends_nothing() {
        let mut sink =
            PrometheusSink::new("prom", RemoteWriteConfig::new("http://127.0.0.1:9/write")).unwrap();
        sink.write(&[record(1, json!({"sky": "clear"}))]).unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = RemoteWriteConfig::new("http://example.com/write")
            .with_header("Authorization", "Bearer token123")
            .with_timeout(Duration::from_secs(10))
            .with_max_retries(5);

        assert_eq!(config.endpoint, "http://example.com/write");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.headers.len(), 1);
    }
}
