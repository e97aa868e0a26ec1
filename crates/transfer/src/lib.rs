//! Resumable multipart transfer engine.
//!
//! Moves a single file between local disk and an object storage backend,
//! surviving interruption at part granularity. The pieces:
//!
//! - [`plan`]: splits a byte range into contiguous part spans
//! - [`checkpoint`]: persists per-part progress so a rerun resumes instead
//!   of restarting
//! - [`checksum`]: CRC-64/XZ streaming, file hashing and combination
//! - [`pool`]: bounded concurrent part execution with per-part timeouts
//! - [`upload`] / [`download`]: the orchestrators tying it together with
//!   bounded retries, integrity verification and session cleanup
//!
//! Callers construct an [`Uploader`] or [`Downloader`] over any
//! [`ObjectStore`](ossback_object_store::ObjectStore) and drive whole
//! transfers through a single call.

pub mod checkpoint;
pub mod checksum;
pub mod download;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use ossback_object_store::{BackendError, ErrorKind};

pub use checkpoint::{Checkpoint, CheckpointStore, FileSignature, PartCheckpoint};
pub use download::Downloader;
pub use plan::{PartSpan, PlanDecision};
pub use progress::{FileSink, NoopSink, ProgressReport, ProgressSink};
pub use upload::Uploader;

// ---------------------------------------------------------------------------
// Tuning defaults
// ---------------------------------------------------------------------------

/// Default part size: 2 MiB.
pub const DEFAULT_PART_SIZE: u64 = 2 * 1024 * 1024;

/// Files at or above this size go multipart; smaller ones in one request.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Default number of concurrent part workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default number of extra whole-transfer attempts after the first failure.
pub const DEFAULT_RETRIES: u32 = 2;

/// Default wall-clock budget for a single part attempt.
pub const DEFAULT_PART_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard cap on part count imposed by the backend; the planner scales the
/// part size up rather than exceed it.
pub const MAX_PARTS: u64 = 10_000;

/// How the finished object is checked against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Compare CRC-64/XZ checksums end to end.
    #[default]
    Crc64,
    /// Compare byte counts only (for backends that report no checksum).
    SizeOnly,
}

/// Knobs for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Requested part size in bytes. May be scaled up to honor [`MAX_PARTS`].
    pub part_size: u64,
    /// Sizes below this go as one request with no session or checkpoint.
    pub multipart_threshold: u64,
    /// Concurrent part workers.
    pub workers: usize,
    /// Extra attempts after the first failed one.
    pub retries: u32,
    /// Abort the remote session and drop the checkpoint when retries are
    /// exhausted, instead of leaving them for a later resume.
    pub auto_cancel: bool,
    /// Per-part attempt timeout.
    pub part_timeout: Duration,
    pub verify: VerifyMode,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            workers: DEFAULT_WORKERS,
            retries: DEFAULT_RETRIES,
            auto_cancel: true,
            part_timeout: DEFAULT_PART_TIMEOUT,
            verify: VerifyMode::Crc64,
        }
    }
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Size of the transferred object.
    pub bytes_total: u64,
    /// Bytes actually moved in this call; resumed or already-verified bytes
    /// are excluded.
    pub bytes_transferred: u64,
    /// Number of parts, or 1 for a single-shot transfer.
    pub parts: usize,
    /// Attempts spent, including the successful one.
    pub attempts: u32,
    /// Whether a checksum comparison was performed (as opposed to size only).
    pub crc_verified: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer input: {0}")]
    InvalidInput(String),

    #[error("remote object not found: {0}")]
    ObjectNotFound(String),

    #[error("integrity check failed: expected crc64 {expected:#018x}, computed {actual:#018x}")]
    Integrity { expected: u64, actual: u64 },

    #[error("size mismatch: expected {expected} bytes, stored {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("part {number} timed out after {timeout:?}")]
    PartTimeout { number: u32, timeout: Duration },

    #[error("{failed} of {total} parts failed: {first}")]
    PartsFailed {
        failed: usize,
        total: usize,
        /// Message of the first failed part, in part order.
        first: String,
        /// True when every part failure was itself retryable.
        retryable: bool,
    },

    #[error("transfer failed after {attempts} attempts, session aborted: {reason}")]
    Aborted { attempts: u32, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether another whole-transfer attempt could succeed.
    ///
    /// Integrity failures are deliberately not retryable here; the
    /// orchestrators grant them a single fresh attempt of their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Backend(e) => e.is_retryable(),
            TransferError::PartTimeout { .. } => true,
            TransferError::PartsFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// True when the failure already included backend cleanup (session
    /// aborted, checkpoint removed); nothing is left to resume.
    pub fn cleaned_up(&self) -> bool {
        matches!(self, TransferError::Aborted { .. })
    }

    /// Whether the failure means the transfer target is gone for good
    /// (missing object, dead session) and in-flight work should stop.
    pub(crate) fn is_fatal_for_pool(&self) -> bool {
        match self {
            TransferError::Backend(e) => {
                matches!(e.kind, ErrorKind::NotFound | ErrorKind::Forbidden)
            }
            TransferError::ObjectNotFound(_) => true,
            _ => false,
        }
    }
}
