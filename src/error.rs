//! Error types for srcfetch
//!
//! Every library operation returns [`Result<T>`]. The variants follow the
//! failure classes of the pipeline: argument errors, transient network
//! errors, integrity errors, patch errors and external tool failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for srcfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur while acquiring, verifying and preparing sources
#[derive(Error, Debug)]
pub enum Error {
    // Argument validation
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid {what}: {value}")]
    InvalidArgument { what: &'static str, value: String },

    // Network
    #[error("download failed for {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    // Integrity
    #[error(
        "{algorithm} integrity check failed for '{path}'\n  expected: {expected}\n  got:      {actual}"
    )]
    HashMismatch {
        algorithm: &'static str,
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    // Archives
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("unsafe archive entry: {0}")]
    UnsafeArchiveEntry(String),

    // Patches
    #[error("{} patch(es) failed to apply from {}: {}", failed.len(), dir.display(), failed.join(", "))]
    PatchFailed { dir: PathBuf, failed: Vec<String> },

    // External tools
    #[error("command failed: {cmd} (exit code: {code:?})")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        diagnostics: Vec<String>,
    },

    #[error("{what} is locked by another process; if this is incorrect, delete '{}'", path.display())]
    Locked { what: String, path: PathBuf },

    #[error("invalid manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("interrupted by signal")]
    Interrupted,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Transport failures, server errors, timeouts and rate limits are
    /// retryable. A failed external command (e.g. `git clone`) is too, since
    /// it usually failed on the network. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::CommandFailed { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }

    /// Lines surfaced from diagnostic logs, if the error carries any.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            Self::CommandFailed { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

/// Attach context to raw I/O results, mirroring `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::io(f(), e))
    }
}
