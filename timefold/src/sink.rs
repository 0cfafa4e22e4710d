//! Destinations for the cursor-protocol consumers.
//!
//! A [`RecordSink`] receives whole batches of records from a persister and
//! either accepts the batch or fails it; there is no partial success. An
//! [`ArchiveSink`] receives files from an archiver one at a time, followed by
//! a single [`ArchiveSink::finish`] once the batch is complete.
//!
//! Sinks should be idempotent: after a crash between a confirmed write and the
//! cursor save, the same batch is offered again.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::archive::ArchiveItem;
use crate::error::SinkError;
use crate::record::Record;
use crate::store::TMP_SUFFIX;

/// Destination for batches of records.
pub trait RecordSink {
    /// Sink name used in logs and errors.
    fn name(&self) -> &str;

    /// Writes one batch, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the batch was not accepted.
    fn write(&mut self, batch: &[Record]) -> Result<(), SinkError>;
}

/// Destination for archived files.
pub trait ArchiveSink {
    /// Sink name used in logs and errors.
    fn name(&self) -> &str;

    /// Transfers one file.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the file was not transferred.
    fn put(&mut self, item: &ArchiveItem) -> Result<(), SinkError>;

    /// Completes the batch after every item was put.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the batch cannot be completed.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Appends records as JSON lines to a file.
///
/// Each batch is encoded fully before anything is written and is then
/// appended with a single write.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    name: String,
    path: PathBuf,
}

impl JsonLinesSink {
    /// Creates a sink appending to `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Returns the output file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            sink: self.name.clone(),
            path: self.path.clone(),
            source,
        }
    }
}

impl RecordSink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, batch: &[Record]) -> Result<(), SinkError> {
        let mut buf = String::new();
        for record in batch {
            let line =
                serde_json::to_string(&record.to_json_map()).map_err(|e| SinkError::Encode {
                    sink: self.name.clone(),
                    source: e,
                })?;
            buf.push_str(&line);
            buf.push('\n');
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(buf.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| self.io_error(e))
    }
}

/// Keeps written records in memory.
///
/// Can be told to fail its next writes, to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
    batches: usize,
    failure: Option<String>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail with `reason`.
    pub fn fail_with(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
    }

    /// Makes writes succeed again.
    pub fn recover(&mut self) {
        self.failure = None;
    }

    /// Records accepted so far.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of batches accepted so far.
    pub fn batches(&self) -> usize {
        self.batches
    }
}

impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, batch: &[Record]) -> Result<(), SinkError> {
        if let Some(reason) = &self.failure {
            return Err(SinkError::Rejected {
                sink: "memory".to_string(),
                reason: reason.clone(),
            });
        }
        self.records.extend_from_slice(batch);
        self.batches += 1;
        Ok(())
    }
}

/// What [`CopySink`] does when the destination file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRule {
    /// Always replace it.
    #[default]
    Overwrite,
    /// Replace it only if the source was modified later.
    OverwriteIfNewer,
    /// Leave it alone.
    Skip,
}

/// Copies files into a destination tree, preserving relative paths.
///
/// Each copy goes to a temporary file first and is renamed into place, and
/// carries the source modification time.
#[derive(Debug, Clone)]
pub struct CopySink {
    name: String,
    destination: PathBuf,
    rule: UpdateRule,
    copied: usize,
    skipped: usize,
}

impl CopySink {
    /// Creates a sink copying into `destination`.
    pub fn new(name: impl Into<String>, destination: impl Into<PathBuf>, rule: UpdateRule) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            rule,
            copied: 0,
            skipped: 0,
        }
    }

    /// Files copied so far.
    pub fn copied(&self) -> usize {
        self.copied
    }

    /// Files left alone because of the update rule.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn should_copy(&self, item: &ArchiveItem, target: &Path) -> bool {
        let Ok(existing) = fs::metadata(target) else {
            return true;
        };
        match self.rule {
            UpdateRule::Overwrite => true,
            UpdateRule::Skip => false,
            UpdateRule::OverwriteIfNewer => match (item.modified, existing.modified().ok()) {
                (Some(source), Some(target)) => source > target,
                _ => true,
            },
        }
    }
}

impl ArchiveSink for CopySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&mut self, item: &ArchiveItem) -> Result<(), SinkError> {
        let target = self.destination.join(&item.relative);
        if !self.should_copy(item, &target) {
            debug!(sink = %self.name, target = %target.display(), "destination is current, skipping");
            self.skipped += 1;
            return Ok(());
        }

        let io_error = |path: &Path, source| SinkError::Io {
            sink: self.name.clone(),
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let mut tmp = target.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        fs::copy(&item.path, &tmp).map_err(|e| io_error(&item.path, e))?;
        if let Some(modified) = item.modified {
            let file = OpenOptions::new()
                .write(true)
                .open(&tmp)
                .map_err(|e| io_error(&tmp, e))?;
            file.set_modified(modified).map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, &target).map_err(|e| io_error(&target, e))?;

        self.copied += 1;
        Ok(())
    }
}

/// Joins the components of a relative path with `/`.
pub(crate) fn slash_path(relative: &Path) -> String {
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    parts.join("/")
}

/// Packs each batch into one ZIP archive.
///
/// Entries are stored deflated under their relative paths. The archive is
/// written as `<destination>/<name>-<first>.zip.tmp` and only
/// [`ArchiveSink::finish`] renames it to `<name>-<first>-<last>.zip`, where
/// `first` and `last` are the timestamps of the batch's first and last
/// items. A batch that fails part way never produces a finished archive.
pub struct ZipSink {
    name: String,
    destination: PathBuf,
    open: Option<OpenArchive>,
    archives: Vec<PathBuf>,
}

/// The archive of the batch in progress.
struct OpenArchive {
    writer: ZipWriter<File>,
    tmp: PathBuf,
    first: i64,
    last: i64,
    entries: usize,
}

impl std::fmt::Debug for ZipSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipSink")
            .field("name", &self.name)
            .field("destination", &self.destination)
            .field("in_progress", &self.open.as_ref().map(|archive| &archive.tmp))
            .field("archives", &self.archives)
            .finish()
    }
}

impl ZipSink {
    /// Creates a sink writing archives into `destination`.
    pub fn new(name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            open: None,
            archives: Vec::new(),
        }
    }

    /// Archives finished so far.
    pub fn archives(&self) -> &[PathBuf] {
        &self.archives
    }

    fn io_error(&self, path: &Path, source: io::Error) -> SinkError {
        SinkError::Io {
            sink: self.name.clone(),
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip_error(&self, path: &Path, source: ZipError) -> SinkError {
        SinkError::Zip {
            sink: self.name.clone(),
            path: path.to_path_buf(),
            source,
        }
    }

    fn start_archive(&self, first: i64) -> Result<OpenArchive, SinkError> {
        fs::create_dir_all(&self.destination).map_err(|e| self.io_error(&self.destination, e))?;
        let tmp = self
            .destination
            .join(format!("{}-{first}.zip{TMP_SUFFIX}", self.name));
        let file = File::create(&tmp).map_err(|e| self.io_error(&tmp, e))?;
        Ok(OpenArchive {
            writer: ZipWriter::new(file),
            tmp,
            first,
            last: first,
            entries: 0,
        })
    }

    fn append(&self, archive: &mut OpenArchive, item: &ArchiveItem) -> Result<(), SinkError> {
        let mut source = File::open(&item.path).map_err(|e| self.io_error(&item.path, e))?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        archive
            .writer
            .start_file(slash_path(&item.relative), options)
            .map_err(|e| self.zip_error(&archive.tmp, e))?;
        io::copy(&mut source, &mut archive.writer).map_err(|e| self.io_error(&archive.tmp, e))?;
        archive.last = item.timestamp;
        archive.entries += 1;
        Ok(())
    }

    fn seal(&self, archive: OpenArchive) -> Result<PathBuf, SinkError> {
        let OpenArchive {
            writer,
            tmp,
            first,
            last,
            ..
        } = archive;
        let file = writer.finish().map_err(|e| self.zip_error(&tmp, e))?;
        file.sync_all().map_err(|e| self.io_error(&tmp, e))?;
        let target = self
            .destination
            .join(format!("{}-{first}-{last}.zip", self.name));
        fs::rename(&tmp, &target).map_err(|e| self.io_error(&target, e))?;
        Ok(target)
    }

    /// Drops an unfinished archive and its temporary file.
    fn discard(&self, archive: OpenArchive) {
        let OpenArchive { writer, tmp, .. } = archive;
        drop(writer);
        if let Err(e) = fs::remove_file(&tmp)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(sink = %self.name, path = %tmp.display(), error = %e, "could not remove unfinished archive");
        }
    }
}

impl ArchiveSink for ZipSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&mut self, item: &ArchiveItem) -> Result<(), SinkError> {
        let mut archive = match self.open.take() {
            Some(archive) => archive,
            None => self.start_archive(item.timestamp)?,
        };
        match self.append(&mut archive, item) {
            Ok(()) => {
                self.open = Some(archive);
                Ok(())
            }
            Err(e) => {
                self.discard(archive);
                Err(e)
            }
        }
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let Some(archive) = self.open.take() else {
            return Ok(());
        };
        let entries = archive.entries;
        let tmp = archive.tmp.clone();
        match self.seal(archive) {
            Ok(target) => {
                info!(sink = %self.name, archive = %target.display(), entries, "archive written");
                self.archives.push(target);
                Ok(())
            }
            Err(e) => {
                if let Err(remove) = fs::remove_file(&tmp)
                    && remove.kind() != io::ErrorKind::NotFound
                {
                    warn!(sink = %self.name, path = %tmp.display(), error = %remove, "could not remove unfinished archive");
                }
                Err(e)
            }
        }
    }
}

#[cfg(feature = "remote")]
pub use http::{HttpUploadConfig, HttpUploadSink};

#[cfg(feature = "remote")]
mod http {
    use std::time::Duration;

    use tracing::warn;

    use super::{ArchiveItem, ArchiveSink, SinkError, slash_path};

    /// Settings for [`HttpUploadSink`].
    #[derive(Debug, Clone)]
    pub struct HttpUploadConfig {
        /// Base URL; each file goes to `<base_url>/<relative path>`.
        pub base_url: String,
        /// Time allowed to establish a connection.
        pub connect_timeout: Duration,
        /// Time allowed for a whole request.
        pub timeout: Duration,
        /// Retries after the first failed attempt.
        pub max_retries: u32,
        /// Initial backoff between retries (doubles each attempt).
        pub retry_backoff: Duration,
        /// Extra HTTP headers, e.g. for authentication.
        pub headers: Vec<(String, String)>,
    }

    impl HttpUploadConfig {
        /// Creates a config with defaults.
        ///
        /// Defaults: 10s connect timeout, 60s request timeout, 3 retries,
        /// 200ms initial backoff.
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                connect_timeout: Duration::from_secs(10),
                timeout: Duration::from_secs(60),
                max_retries: 3,
                retry_backoff: Duration::from_millis(200),
                headers: Vec::new(),
            }
        }

        /// Adds an HTTP header.
        #[must_use]
        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }

        /// Sets the maximum number of retries.
        #[must_use]
        pub fn with_max_retries(mut self, max_retries: u32) -> Self {
            self.max_retries = max_retries;
            self
        }
    }

    /// Uploads each archived file with an HTTP `PUT`.
    #[derive(Debug)]
    pub struct HttpUploadSink {
        name: String,
        config: HttpUploadConfig,
        client: reqwest::blocking::Client,
        uploaded: usize,
    }

    impl HttpUploadSink {
        /// Creates the sink and its HTTP client.
        ///
        /// # Errors
        ///
        /// Returns [`SinkError::Http`] if the client cannot be built.
        pub fn new(name: impl Into<String>, config: HttpUploadConfig) -> Result<Self, SinkError> {
            let name = name.into();
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(config.connect_timeout)
                .timeout(config.timeout)
                .build()
                .map_err(|e| SinkError::Http {
                    sink: name.clone(),
                    source: e,
                })?;
            Ok(Self {
                name,
                config,
                client,
                uploaded: 0,
            })
        }

        /// Files uploaded so far.
        pub fn uploaded(&self) -> usize {
            self.uploaded
        }

        /// Destination URL of an item.
        pub fn url_for(&self, item: &ArchiveItem) -> String {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                slash_path(&item.relative)
            )
        }
    }

    impl ArchiveSink for HttpUploadSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn put(&mut self, item: &ArchiveItem) -> Result<(), SinkError> {
            let body = std::fs::read(&item.path).map_err(|e| SinkError::Io {
                sink: self.name.clone(),
                path: item.path.clone(),
                source: e,
            })?;
            let url = self.url_for(item);

            let mut backoff = self.config.retry_backoff;
            let mut attempt = 0;
            loop {
                let mut request = self.client.put(&url);
                for (name, value) in &self.config.headers {
                    request = request.header(name, value);
                }

                let error = match request.body(body.clone()).send() {
                    Ok(resp) if resp.status().is_success() => {
                        self.uploaded += 1;
                        return Ok(());
                    }
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let text = resp.text().unwrap_or_default();
                        SinkError::Rejected {
                            sink: self.name.clone(),
                            reason: format!("{url}: status {status}: {text}"),
                        }
                    }
                    Err(e) => SinkError::Http {
                        sink: self.name.clone(),
                        source: e,
                    },
                };

                if attempt >= self.config.max_retries {
                    return Err(error);
                }
                warn!(sink = %self.name, %url, attempt, error = %error, "upload failed, retrying");
                std::thread::sleep(backoff);
                backoff *= 2;
                attempt += 1;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::path::PathBuf;

        #[test]
        fn test_url_for_joins_relative_path() {
            let sink = HttpUploadSink::new(
                "up",
                HttpUploadConfig::new("http://archive.local/weather/"),
            )
            .unwrap();
            let item = ArchiveItem {
                path: PathBuf::from("/data/2024/3/5/7/8/9.json"),
                relative: PathBuf::from("2024/3/5/7/8/9.json"),
                identity: "/data/2024/3/5/7/8/9.json".to_string(),
                timestamp: 1_709_622_489,
                size: 10,
                modified: None,
            };
            assert_eq!(
                sink.url_for(&item),
                "http://archive.local/weather/2024/3/5/7/8/9.json"
            );
        }
    }
}
