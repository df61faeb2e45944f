//! Atomic installation of staged files into the cache.
//!
//! Producers write into a uniquely named staging file under the temp root
//! (same filesystem as the cache), then commit: the cache reserves room for
//! the final size and the staging file is renamed onto the destination.
//! The rename is the linearization point: observers either see no file at
//! the destination or a complete file of the declared size. On any failure
//! the staging file is deleted and now-empty staging directories are pruned
//! back up to the temp root.

use crate::lru::DiskCache;
use depot_core::ResourceKey;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

/// Factory for staged files under a temp root.
#[derive(Clone)]
pub struct AtomicWriter {
    temp_root: PathBuf,
}

impl AtomicWriter {
    /// Create a writer staging under `temp_root`, creating it if missing.
    pub fn new(temp_root: impl AsRef<Path>) -> crate::CacheResult<Self> {
        let temp_root = temp_root.as_ref().to_path_buf();
        std::fs::create_dir_all(&temp_root)?;
        Ok(Self { temp_root })
    }

    /// Open a staging file for `key`. The staging name carries a random
    /// suffix so concurrent writers for the same key never collide.
    pub async fn begin(&self, key: &ResourceKey) -> crate::CacheResult<StagedFile> {
        let path = self
            .temp_root
            .join(format!("{}.{}.inprogress", key.storage_key(), Uuid::new_v4()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(StagedFile {
            path,
            file: Some(file),
            temp_root: self.temp_root.clone(),
        })
    }

    /// Stage, produce, and commit in one call. The producer receives the
    /// staging path and an open writer; on producer or commit failure the
    /// staged file is removed.
    pub async fn write_atomic<F, Fut>(
        &self,
        cache: &DiskCache,
        key: &ResourceKey,
        producer: F,
    ) -> crate::CacheResult<PathBuf>
    where
        F: FnOnce(PathBuf, File) -> Fut,
        Fut: std::future::Future<Output = std::io::Result<File>>,
    {
        let mut staged = self.begin(key).await?;
        let file = staged.file.take().ok_or(crate::CacheError::StagingConsumed)?;
        match producer(staged.path.clone(), file).await {
            Ok(file) => {
                staged.file = Some(file);
                staged.commit(cache, key).await
            }
            Err(e) => {
                staged.discard().await;
                Err(e.into())
            }
        }
    }
}

/// A staging file that must be committed or discarded.
pub struct StagedFile {
    path: PathBuf,
    file: Option<File>,
    temp_root: PathBuf,
}

impl StagedFile {
    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open writer.
    pub fn writer(&mut self) -> crate::CacheResult<&mut File> {
        self.file.as_mut().ok_or(crate::CacheError::StagingConsumed)
    }

    /// Flush, reserve cache room for the final size, and rename the staged
    /// file onto the cache destination. On failure the staged file is
    /// removed.
    pub async fn commit(
        mut self,
        cache: &DiskCache,
        key: &ResourceKey,
    ) -> crate::CacheResult<PathBuf> {
        let result = self.commit_inner(cache, key).await;
        match result {
            Ok(dest) => {
                prune_empty_parents(&self.path, &self.temp_root).await;
                Ok(dest)
            }
            Err(e) => {
                self.discard().await;
                Err(e)
            }
        }
    }

    async fn commit_inner(
        &mut self,
        cache: &DiskCache,
        key: &ResourceKey,
    ) -> crate::CacheResult<PathBuf> {
        let file = self.file.take().ok_or(crate::CacheError::StagingConsumed)?;
        file.sync_all().await?;
        drop(file);

        let size = fs::metadata(&self.path).await?.len();
        let dest = cache.reserve(key, size)?;
        if let Err(e) = fs::rename(&self.path, &dest).await {
            cache.cancel_reservation(key);
            return Err(e.into());
        }
        cache.commit(key, size);
        Ok(dest)
    }

    /// Delete the staged file and prune empty staging directories.
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged file");
            }
        }
        prune_empty_parents(&self.path, &self.temp_root).await;
    }
}

/// Remove now-empty directories from the staged file's parent up to, but
/// never past, the temp root. Stops at the first non-empty directory.
async fn prune_empty_parents(path: &Path, temp_root: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == temp_root || !dir.starts_with(temp_root) {
            break;
        }
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::TreeHash;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid as RawUuid;

    fn artifact(byte: u8) -> ResourceKey {
        ResourceKey::artifact(TreeHash::from_bytes([byte; 20]))
    }

    fn package(byte: u8) -> ResourceKey {
        ResourceKey::package(
            RawUuid::parse_str("01234567-89ab-4def-8123-456789abcdef").unwrap(),
            TreeHash::from_bytes([byte; 20]),
        )
    }

    #[tokio::test]
    async fn write_atomic_commits_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), 1024).unwrap();
        let writer = AtomicWriter::new(dir.path().join("temp")).unwrap();

        let key = artifact(1);
        let dest = writer
            .write_atomic(&cache, &key, |_path, mut file| async move {
                file.write_all(b"payload bytes").await?;
                Ok(file)
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload bytes");
        assert_eq!(cache.path_of(&key).unwrap(), dest);
        assert_eq!(cache.resident_bytes(), 13);
    }

    #[tokio::test]
    async fn failed_producer_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), 1024).unwrap();
        let temp_root = dir.path().join("temp");
        let writer = AtomicWriter::new(&temp_root).unwrap();

        let key = package(2);
        let result = writer
            .write_atomic(&cache, &key, |_path, mut file| async move {
                file.write_all(b"partial").await?;
                Err(std::io::Error::other("producer failed"))
            })
            .await;

        assert!(result.is_err());
        assert!(!cache.contains(&key));
        // Staged file gone and the package/uuid staging dirs pruned.
        assert!(std::fs::read_dir(&temp_root).unwrap().next().is_none());
        assert!(cache.path_of(&key).is_none());
    }

    #[tokio::test]
    async fn staging_names_are_unique_per_begin() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AtomicWriter::new(dir.path().join("temp")).unwrap();

        let key = artifact(3);
        let a = writer.begin(&key).await.unwrap();
        let b = writer.begin(&key).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().extension().is_some_and(|e| e == "inprogress"));
        a.discard().await;
        b.discard().await;
    }

    #[tokio::test]
    async fn commit_is_visible_only_after_rename() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"), 1024).unwrap();
        let writer = AtomicWriter::new(dir.path().join("temp")).unwrap();

        let key = artifact(4);
        let mut staged = writer.begin(&key).await.unwrap();
        staged.writer().unwrap().write_all(b"committed").await.unwrap();

        let dest = cache.destination(&key);
        assert!(!dest.exists());
        let committed = staged.commit(&cache, &key).await.unwrap();
        assert_eq!(committed, dest);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 9);
    }

    #[tokio::test]
    async fn discard_prunes_nested_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("temp");
        let writer = AtomicWriter::new(&temp_root).unwrap();

        let staged = writer.begin(&package(5)).await.unwrap();
        assert!(staged.path().starts_with(&temp_root));
        staged.discard().await;
        assert!(temp_root.exists());
        assert!(std::fs::read_dir(&temp_root).unwrap().next().is_none());
    }
}
