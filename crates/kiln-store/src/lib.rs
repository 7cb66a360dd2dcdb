mod local;
mod memory;

pub use local::LocalFsStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),
    #[error("artifact handle already closed: {0}")]
    Closed(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("store error: {0}")]
    Other(String),
}

/// Artifacts live in named boxes; one box per task is the usual layout.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Starts a fresh artifact, replacing any previous content on close.
    async fn create(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError>;
    /// Like `create`, but only for an artifact that already exists.
    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError>;
    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, StoreError>;
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, StoreError>;
    /// Removing a missing artifact is not an error.
    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError>;
    async fn copy_to(&self, bucket: &str, name: &str, dest_dir: &Path)
    -> Result<PathBuf, StoreError>;
}

/// A write handle. Content becomes visible once `close` succeeds.
#[async_trait]
pub trait ArtifactHandle: Send + Sync {
    async fn store(&mut self, chunk: &[u8]) -> Result<(), StoreError>;
    async fn close(&mut self) -> Result<(), StoreError>;
}

pub(crate) fn validate_part(part: &str) -> Result<(), StoreError> {
    if part.is_empty()
        || part == "."
        || part == ".."
        || part.contains('/')
        || part.contains('\\')
        || part.contains('\0')
    {
        return Err(StoreError::InvalidKey(part.to_string()));
    }
    Ok(())
}

/// The `bucket/name` form used in logs and task results.
pub fn key(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parts_cannot_escape_their_box() {
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_part(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_part("gl8900.bin").is_ok());
    }
}
