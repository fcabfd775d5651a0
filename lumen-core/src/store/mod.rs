//! Blob storage for cached analyses and archived source snapshots.
//!
//! The store is auxiliary infrastructure: callers treat every [`StoreError`]
//! as a cache miss or a skipped write, never as a request failure.
//!
//! ## Backends
//!
//! - [`HttpObjectStore`] - REST blob service with predictable object URLs
//! - [`FsObjectStore`] - local directory, for single-host deployments and the CLI
//! - [`MemoryObjectStore`] - in-process map with outage injection, for tests

mod fs;
mod http;
mod memory;

pub use fs::FsObjectStore;
pub use http::{HttpObjectStore, HttpObjectStoreConfig};
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from an object store backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with an unexpected status
    #[error("Object store returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Local filesystem failure
    #[error("Object store I/O error: {0}")]
    Io(String),

    /// Listing or metadata could not be decoded
    #[error("Object store response malformed: {0}")]
    Malformed(String),

    /// Path escapes the store namespace
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object path, including the listed prefix
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last write time as reported by the backend
    pub uploaded_at: DateTime<Utc>,
}

/// Write/overwrite blob storage. No read-modify-write semantics.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError>;

    /// Whether an object exists, without downloading it.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Create or overwrite an object.
    async fn put(&self, path: &str, body: Bytes, content_type: &str) -> Result<(), StoreError>;

    /// Objects whose path starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Reject paths that could escape the store root or address nothing.
pub(crate) fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment == "..")
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("vision/metadata/abc/latest.json").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("vision/../../etc").is_err());
        assert!(validate_path("vision\\metadata").is_err());
    }
}
