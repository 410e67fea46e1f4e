use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    /// Writes `content`, creating missing parent directories.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    /// Removes a file or a whole directory; missing paths are not an error.
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

// --- Native Implementation ---

#[derive(Debug, Default)]
pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to rename {} to {}", from, to))?;
        Ok(())
    }
}

// Created with `create_new`; dropping the guard removes the file.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    /// Returns `Ok(None)` when another holder already owns the lock.
    pub fn try_acquire(path: &str) -> Result<Option<Self>> {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to create lock {}", path.display())),
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_delete_removes_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let nested = dir.path().join("a").join("b").join("file.bin");
        let nested = nested.to_string_lossy().to_string();

        storage.write(&nested, b"data").await?;
        assert_eq!(storage.read(&nested).await?, b"data");

        let top = dir.path().join("a").to_string_lossy().to_string();
        storage.delete(&top).await?;
        assert!(!storage.exists(&nested).await?);
        // Deleting again is a no-op.
        storage.delete(&top).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_replaces_target() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let from = dir.path().join("x.tmp").to_string_lossy().to_string();
        let to = dir.path().join("x.json").to_string_lossy().to_string();

        storage.write(&to, b"old").await?;
        storage.write(&from, b"{}").await?;
        storage.rename(&from, &to).await?;

        assert!(!storage.exists(&from).await?);
        assert_eq!(storage.read(&to).await?, b"{}");
        Ok(())
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ns").join(".lock").to_string_lossy().to_string();

        let first = ProjectLock::try_acquire(&path)?;
        assert!(first.is_some());
        assert!(ProjectLock::try_acquire(&path)?.is_none());

        drop(first);
        assert!(ProjectLock::try_acquire(&path)?.is_some());
        Ok(())
    }
}
