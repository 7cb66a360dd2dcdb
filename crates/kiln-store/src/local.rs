use crate::{ArtifactHandle, Storage, StoreError, key, validate_part};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tracing::debug;
use uuid::Uuid;

/// Stores each box as a directory under `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    base_dir: PathBuf,
}

impl LocalFsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_of(&self, bucket: &str, name: &str) -> Result<PathBuf, StoreError> {
        validate_part(bucket)?;
        validate_part(name)?;
        Ok(self.base_dir.join(bucket).join(name))
    }
}

#[async_trait]
impl Storage for LocalFsStore {
    async fn create(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError> {
        let path = self.path_of(bucket, name)?;
        let handle = LocalHandle::begin(key(bucket, name), path).await?;
        Ok(Box::new(handle))
    }

    async fn open(&self, bucket: &str, name: &str) -> Result<Box<dyn ArtifactHandle>, StoreError> {
        if !self.exists(bucket, name).await? {
            return Err(StoreError::NotFound(key(bucket, name)));
        }
        self.create(bucket, name).await
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, StoreError> {
        let path = self.path_of(bucket, name)?;
        let key = key(bucket, name);
        run_blocking(move || {
            if !path.is_file() {
                return Err(StoreError::NotFound(key));
            }
            fs::read(&path).map(Bytes::from).map_err(io_err)
        })
        .await
    }

    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(bucket, name)?;
        run_blocking(move || Ok(path.is_file())).await
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError> {
        let path = self.path_of(bucket, name)?;
        run_blocking(move || {
            if path.exists() {
                fs::remove_file(&path).map_err(io_err)?;
            }
            // Drop the box once its last artifact is gone.
            if let Some(dir) = path.parent() {
                let empty = fs::read_dir(dir)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if empty {
                    fs::remove_dir(dir).map_err(io_err)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn copy_to(
        &self,
        bucket: &str,
        name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, StoreError> {
        let path = self.path_of(bucket, name)?;
        let key = key(bucket, name);
        let dest = dest_dir.join(name);
        run_blocking(move || {
            if !path.is_file() {
                return Err(StoreError::NotFound(key));
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            fs::copy(&path, &dest).map_err(io_err)?;
            Ok(dest)
        })
        .await
    }
}

/// Writes to a sibling temp file and renames it into place on close.
struct LocalHandle {
    key: String,
    path: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
}

impl LocalHandle {
    async fn begin(key: String, path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = PathBuf::from(format!("{}.tmp-{}", path.to_string_lossy(), Uuid::new_v4()));
        let file = File::create(&tmp).await.map_err(io_err)?;
        Ok(Self {
            key,
            path,
            tmp,
            file: Some(file),
        })
    }
}

#[async_trait]
impl ArtifactHandle for LocalHandle {
    async fn store(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let Some(file) = self.file.as_mut() else {
            return Err(StoreError::Closed(self.key.clone()));
        };
        file.write_all(chunk).await.map_err(io_err)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let Some(mut file) = self.file.take() else {
            return Err(StoreError::Closed(self.key.clone()));
        };
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&self.tmp, &self.path)
            .await
            .map_err(io_err)?;
        debug!(key = %self.key, "artifact committed");
        Ok(())
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        // An abandoned handle leaves no partial artifact behind.
        if self.file.is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Other(format!("blocking task join error: {e}")))?
}

fn io_err(error: std::io::Error) -> StoreError {
    StoreError::Io(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn chunks_concatenate_on_close() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());

        let mut handle = store.create("t1", "out.bin").await.expect("create");
        for chunk in [&b"ab"[..], b"cd", b"ef"] {
            handle.store(chunk).await.expect("store chunk");
        }
        assert!(!store.exists("t1", "out.bin").await.expect("exists"));

        handle.close().await.expect("close");
        assert_eq!(
            store.read("t1", "out.bin").await.expect("read"),
            Bytes::from_static(b"abcdef")
        );

        let error = handle.close().await.expect_err("second close");
        assert_eq!(error, StoreError::Closed("t1/out.bin".to_string()));
    }

    #[tokio::test]
    async fn open_requires_existing_artifact() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());

        let error = store
            .open("t1", "missing.bin")
            .await
            .err()
            .expect("open missing");
        assert_eq!(error, StoreError::NotFound("t1/missing.bin".to_string()));
    }

    #[tokio::test]
    async fn copy_and_delete_clean_up_box() {
        let temp = tempdir().expect("create temp dir");
        let dest = tempdir().expect("create dest dir");
        let store = LocalFsStore::new(temp.path());

        let mut handle = store.create("t1", "out.bin").await.expect("create");
        handle.store(b"payload").await.expect("store");
        handle.close().await.expect("close");

        let copied = store
            .copy_to("t1", "out.bin", dest.path())
            .await
            .expect("copy");
        assert_eq!(fs::read(&copied).expect("read copy"), b"payload");

        store.delete("t1", "out.bin").await.expect("delete");
        store.delete("t1", "out.bin").await.expect("delete twice");
        assert!(!temp.path().join("t1").exists());
    }

    #[tokio::test]
    async fn dropped_handle_leaves_nothing() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());

        let mut handle = store.create("t1", "out.bin").await.expect("create");
        handle.store(b"partial").await.expect("store");
        drop(handle);

        let leftovers = fs::read_dir(temp.path().join("t1"))
            .expect("box dir")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsStore::new(temp.path());
        let error = store.read("..", "passwd").await.expect_err("escape");
        assert!(matches!(error, StoreError::InvalidKey(_)));
    }
}
