//! Error types for the transfer engine.
//!
//! Chunk-level failures are classified as retryable or not; file-level
//! failures are classified as fatal to the whole batch or local to one file.
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced while planning, transferring or finalizing a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection failure, timeout or a broken response body.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success HTTP status.
    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// The provider answered with a non-zero error code.
    #[error("provider error {errno}: {message}")]
    Api { errno: i64, message: String },

    /// A local file could not be opened, written or read.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file cannot be transferred as requested.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Nothing matched the requested remote path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collector was closed before every planned chunk arrived.
    #[error("incomplete transfer: expected {expected} chunks, received {received}")]
    Incomplete { expected: usize, received: usize },

    /// A worker task panicked or was aborted by the runtime.
    #[error("worker task failed: {0}")]
    TaskFailed(String),

    /// The batch was aborted.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether a worker should repeat the same chunk operation after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_) | TransferError::Status { .. })
    }

    /// Whether this error halts every other file of the batch.
    ///
    /// Precondition and lookup failures only concern their own file.
    pub fn is_batch_fatal(&self) -> bool {
        !matches!(
            self,
            TransferError::Precondition(_) | TransferError::NotFound(_) | TransferError::Cancelled
        )
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransferError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => TransferError::Network(err.to_string()),
        }
    }
}

/// One file that did not make it through the batch.
#[derive(Debug)]
pub struct FileFailure {
    /// Remote path for uploads and downloads alike.
    pub path: String,
    pub error: TransferError,
}

/// Returned by the orchestrator when at least one file failed.
#[derive(Debug)]
pub struct BatchError {
    /// Files whose own pipeline failed.
    pub failures: Vec<FileFailure>,
    /// Files stopped because a sibling failed or the user aborted.
    pub aborted: Vec<String>,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} file(s) failed", self.failures.len())?;
        if !self.aborted.is_empty() {
            write!(f, ", {} aborted", self.aborted.len())?;
        }
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.path, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}
