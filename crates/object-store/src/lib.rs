//! Storage backend capability interface.
//!
//! The transfer engine talks to object storage exclusively through the
//! [`ObjectStore`] trait so it stays decoupled from any concrete provider
//! and testable with in-process backends. [`OssStore`] is the Alibaba Cloud
//! OSS adapter; [`MemoryStore`] backs tests and dry runs.

mod memory;
mod oss;

pub use memory::MemoryStore;
pub use oss::{OssConfig, OssStore};

use std::time::Duration;

use async_trait::async_trait;

/// Classification of backend failures.
///
/// Retry decisions are made on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested object or multipart session does not exist.
    NotFound,
    /// Authentication, permission or quota rejection.
    Forbidden,
    /// Connection failure, timeout or 5xx — safe to retry.
    Transient,
    /// Anything else.
    Other,
}

/// Error returned by a storage backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Other,
            message: message.into(),
        }
    }

    /// Returns `true` if the operation may succeed on a retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Metadata reported by the backend for a stored object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Entity tag, if the backend reports one.
    pub etag: Option<String>,
    /// CRC-64/XZ of the object content, if the backend reports one
    /// (`x-oss-hash-crc64ecma` on OSS).
    pub crc64: Option<u64>,
}

/// One entry from an object listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// One committed part of a multipart session, as needed to finalize it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub number: u32,
    /// Backend-assigned identifier for the uploaded part.
    pub etag: String,
}

/// Capability interface over an object storage backend.
///
/// All operations may fail with a [`BackendError`]; callers distinguish
/// retryable from terminal failures via [`BackendError::is_retryable`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart session for `key` and returns its upload id.
    async fn init_multipart(&self, key: &str) -> Result<String, BackendError>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, BackendError>;

    /// Commits a multipart session from its part ETags, in part order.
    ///
    /// Returns the finalized object's metadata (size/CRC as reported by the
    /// backend, used for post-transfer verification).
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, BackendError>;

    /// Releases a multipart session and any staged parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), BackendError>;

    /// Returns metadata for `key`, or `NotFound`.
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError>;

    /// Fetches `len` bytes of `key` starting at `offset`.
    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError>;

    /// Stores `data` as `key` in one shot.
    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<ObjectMeta, BackendError>;

    /// Deletes `key`. Deleting an absent key is not an error on OSS.
    async fn delete_object(&self, key: &str) -> Result<(), BackendError>;

    /// Lists objects under `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError>;

    /// Produces a pre-signed GET URL for `key`, valid for `expires_in`.
    fn sign_url(&self, key: &str, expires_in: Duration) -> Result<String, BackendError>;
}
