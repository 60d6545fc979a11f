//! Destinations for generated payloads.
//!
//! A [`Sink`] is resolved once from the configured [`SinkTarget`] and owned by
//! the lifecycle controller for the whole run. A file sink appends raw payload
//! bytes to its path and keeps a human-readable audit trail in
//! [`AUDIT_LOG_NAME`] beside it. Both files are opened together or not at
//! all. Without a file sink payloads go to stdout, or nowhere when stdout is
//! suppressed.

use std::{
    fmt,
    io,
    num::NonZeroU64,
    path::{Path, PathBuf},
};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::{
    fs,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::{info, warn};

use crate::config::SinkTarget;

/// File name of the audit log kept beside a file sink.
pub const AUDIT_LOG_NAME: &str = "payloads.log";

/// Errors produced while resolving a [`Sink`]. All are fatal to the run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sink's parent directory could not be created.
    #[error("failed to create sink directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The payload file could not be opened.
    #[error("failed to open sink file {path}: {source}")]
    OpenPayload {
        /// Payload file path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The audit log could not be opened.
    #[error("failed to open audit log file {path}: {source}")]
    OpenAudit {
        /// Audit log path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

/// Format one audit line, newline included.
#[must_use]
pub fn audit_line(at: DateTime<Utc>, bytes: usize, name: &str, sequence: u64) -> String {
    format!(
        "{ts} wrote {bytes} bytes to {name} (record {sequence})\n",
        ts = at.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// Whether the record with 1-based `sequence` gets an audit line.
#[must_use]
pub fn is_audited(sequence: u64, audit_every: NonZeroU64) -> bool {
    sequence % audit_every == 0
}

/// A payload file together with its audit log.
#[derive(Debug)]
pub struct FileSink {
    payload: BufWriter<fs::File>,
    audit: BufWriter<fs::File>,
    /// Base name of the payload file, as it appears in audit lines.
    name: String,
    /// Records written this run.
    sequence: u64,
    audit_every: NonZeroU64,
}

impl FileSink {
    async fn open(path: &Path, audit_every: NonZeroU64) -> Result<Self, Error> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .await
            .map_err(|source| Error::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;

        let payload = append(path).await.map_err(|source| Error::OpenPayload {
            path: path.to_path_buf(),
            source,
        })?;
        // If this fails `payload` is dropped here, closing it before any
        // record is written.
        let audit_path = dir.join(AUDIT_LOG_NAME);
        let audit = append(&audit_path)
            .await
            .map_err(|source| Error::OpenAudit {
                path: audit_path.clone(),
                source,
            })?;

        info!(
            "sink opened {path}, auditing to {audit}",
            path = path.display(),
            audit = audit_path.display()
        );
        Ok(Self {
            payload: BufWriter::new(payload),
            audit: BufWriter::new(audit),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            sequence: 0,
            audit_every,
        })
    }

    async fn audit(&mut self, bytes: usize) -> io::Result<()> {
        self.sequence += 1;
        if !is_audited(self.sequence, self.audit_every) {
            return Ok(());
        }
        let line = audit_line(Utc::now(), bytes, &self.name, self.sequence);
        self.audit.write_all(line.as_bytes()).await
    }

    async fn close(mut self) -> io::Result<()> {
        let audit = close_file(&mut self.audit).await;
        let payload = close_file(&mut self.payload).await;
        audit.and(payload)
    }
}

async fn append(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn close_file(writer: &mut BufWriter<fs::File>) -> io::Result<()> {
    writer.flush().await?;
    writer.get_mut().sync_all().await
}

/// The resolved output of a run.
pub enum Sink {
    /// Append to a file, auditing writes.
    File(FileSink),
    /// Write to a stream, stdout unless constructed with [`Sink::stream`].
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    /// Generate and count payloads but write them nowhere.
    Discard,
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(file) => f.debug_tuple("File").field(&file.name).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Discard => f.write_str("Discard"),
        }
    }
}

impl Sink {
    /// Resolve the output for `target`.
    ///
    /// A file target takes priority over stdout. Without one, payloads go to
    /// stdout unless `no_stdout` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file target's directory, payload file or audit
    /// log cannot be created.
    pub async fn resolve(
        target: &SinkTarget,
        no_stdout: bool,
        audit_every: NonZeroU64,
    ) -> Result<Self, Error> {
        match target {
            SinkTarget::File(path) => Ok(Self::File(FileSink::open(path, audit_every).await?)),
            SinkTarget::Unsupported(raw) => {
                warn!("ignoring unsupported sink '{raw}', only file:<path> is recognised");
                Ok(Self::unfiled(no_stdout))
            }
            SinkTarget::None => Ok(Self::unfiled(no_stdout)),
        }
    }

    fn unfiled(no_stdout: bool) -> Self {
        if no_stdout {
            Self::Discard
        } else {
            Self::stream(tokio::io::stdout())
        }
    }

    /// A sink writing payloads to `writer`.
    #[must_use]
    pub fn stream<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Stream(Box::new(writer))
    }

    /// Write one payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error. Bytes may be buffered; see
    /// [`Sink::flush`].
    pub async fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::File(file) => file.payload.write_all(payload).await,
            Self::Stream(stream) => stream.write_all(payload).await,
            Self::Discard => Ok(()),
        }
    }

    /// Record that a payload of `bytes` length was written. Advances the
    /// record sequence of a file sink and appends an audit line when the
    /// sequence is a multiple of the audit interval. No-op for other sinks.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error of the audit write.
    pub async fn audit(&mut self, bytes: usize) -> io::Result<()> {
        match self {
            Self::File(file) => file.audit(bytes).await,
            Self::Stream(_) | Self::Discard => Ok(()),
        }
    }

    /// Flush buffered payload and audit bytes.
    ///
    /// # Errors
    ///
    /// Returns the first IO error encountered. Every buffer is flushed
    /// regardless.
    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(file) => {
                let payload = file.payload.flush().await;
                let audit = file.audit.flush().await;
                payload.and(audit)
            }
            Self::Stream(stream) => stream.flush().await,
            Self::Discard => Ok(()),
        }
    }

    /// Flush and release the sink. Files are synced to disk before closing.
    ///
    /// # Errors
    ///
    /// Returns the first IO error encountered. Both files are closed
    /// regardless.
    pub async fn close(self) -> io::Result<()> {
        match self {
            Self::File(file) => file.close().await,
            Self::Stream(mut stream) => stream.flush().await,
            Self::Discard => Ok(()),
        }
    }
}
