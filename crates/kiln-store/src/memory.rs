use crate::{ArtifactHandle, Storage, StoreError, key, validate_part};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Shelf {
    artifacts: HashMap<String, Bytes>,
    closes: HashMap<String, usize>,
}

/// Keeps artifacts in memory and counts handle closes per key.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shelf: Arc<Mutex<Shelf>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_count(&self, bucket: &str, name: &str) -> usize {
        self.lock()
            .closes
            .get(&key(bucket, name))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().artifacts.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, Shelf> {
        self.shelf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked_key(bucket: &str, name: &str) -> Result<String, StoreError> {
        validate_part(bucket)?;
        validate_part(name)?;
        Ok(key(bucket, name))
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError> {
        let key = Self::checked_key(bucket, name)?;
        Ok(Box::new(MemoryHandle {
            key,
            buffer: Some(Vec::new()),
            shelf: Arc::clone(&self.shelf),
        }))
    }

    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError> {
        if !self.exists(bucket, name).await? {
            return Err(StoreError::NotFound(key(bucket, name)));
        }
        self.create(bucket, name).await
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, StoreError> {
        let key = Self::checked_key(bucket, name)?;
        self.lock()
            .artifacts
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound(key))
    }

    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, StoreError> {
        let key = Self::checked_key(bucket, name)?;
        Ok(self.lock().artifacts.contains_key(&key))
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError> {
        let key = Self::checked_key(bucket, name)?;
        self.lock().artifacts.remove(&key);
        Ok(())
    }

    async fn copy_to(
        &self,
        bucket: &str,
        name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, StoreError> {
        let body = self.read(bucket, name).await?;
        let dest = dest_dir.join(name);
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::write(&dest, &body)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(dest)
    }
}

struct MemoryHandle {
    key: String,
    buffer: Option<Vec<u8>>,
    shelf: Arc<Mutex<Shelf>>,
}

#[async_trait]
impl ArtifactHandle for MemoryHandle {
    async fn store(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(StoreError::Closed(self.key.clone()));
        };
        buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let Some(buffer) = self.buffer.take() else {
            return Err(StoreError::Closed(self.key.clone()));
        };
        let mut shelf = self.shelf.lock().unwrap_or_else(|p| p.into_inner());
        shelf.artifacts.insert(self.key.clone(), Bytes::from(buffer));
        *shelf.closes.entry(self.key.clone()).or_insert(0) += 1;
        Ok(())
    }
}
