//! ShardedFileStore: gzip-compressed objects in a sharded directory tree.
//!
//! Layout (standard sharding):
//! ```text
//! {base_path}/
//! ├── 37/33/CD/977F/
//! │   └── 3733CD977F...E4D5.gz    # gzip of the asset bytes
//! └── E3/B0/C4/4298/
//!     └── E3B0C44298...B855       # legacy uncompressed object, read-only
//! ```
//!
//! Objects are written to a temp file in the shard directory and renamed into
//! place, so a reader sees either nothing or the complete object.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::compress::{gunzip, gzip};
use crate::config::FileBackendConfig;
use crate::hash::ContentHash;
use crate::store::{BackendKind, BackendStore, PutOutcome};

/// Filesystem-based backend store.
#[derive(Debug, Clone)]
pub struct ShardedFileStore {
    config: FileBackendConfig,
}

impl ShardedFileStore {
    /// Create a store rooted at `config.base_path`, creating the root if needed.
    pub fn new(config: FileBackendConfig) -> Result<Self> {
        if config.base_path.as_os_str().is_empty() {
            bail!("filesystem backend requires base_path");
        }
        fs::create_dir_all(&config.base_path).with_context(|| {
            format!(
                "failed to create asset base directory {}",
                config.base_path.display()
            )
        })?;

        Ok(Self { config })
    }

    /// Create a store at a specific path with the standard layout.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::new(FileBackendConfig::with_base_path(path))
    }

    /// Get the configuration.
    pub fn config(&self) -> &FileBackendConfig {
        &self.config
    }

    /// Path of the compressed object for `hash`.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.legacy_path(hash).with_extension("gz")
    }

    /// Path of an uncompressed object written by older servers.
    fn legacy_path(&self, hash: &ContentHash) -> PathBuf {
        self.config
            .base_path
            .join(self.config.layout.relative_path(hash))
    }

    /// Check if an object (compressed or legacy) exists.
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.object_path(hash).is_file() || self.legacy_path(hash).is_file()
    }

    /// Read and decompress the object for `hash`.
    ///
    /// A compressed object that fails to decompress is reported as missing so
    /// callers fall through to their next source.
    pub fn read(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(hash);
        if path.is_file() {
            let packed = fs::read(&path)
                .with_context(|| format!("failed to read object file {}", path.display()))?;
            return match gunzip(&packed) {
                Ok(data) => Ok(Some(data)),
                Err(e) => {
                    warn!(hash = %hash, path = %path.display(), "corrupt object: {e:#}");
                    Ok(None)
                }
            };
        }

        let legacy = self.legacy_path(hash);
        if legacy.is_file() {
            let data = fs::read(&legacy)
                .with_context(|| format!("failed to read object file {}", legacy.display()))?;
            return Ok(Some(data));
        }

        Ok(None)
    }

    /// Compress and write `data` under `hash`.
    ///
    /// Without `overwrite`, an existing object is left untouched.
    pub fn write(&self, hash: &ContentHash, data: &[u8], overwrite: bool) -> Result<PutOutcome> {
        if !overwrite && self.exists(hash) {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let path = self.object_path(hash);
        let dir = path
            .parent()
            .context("object path has no parent directory")?;
        ensure_dir(&self.config.base_path, dir)?;

        let packed = gzip(data)?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&packed).context("failed to write object temp file")?;
        tmp.as_file()
            .sync_all()
            .context("failed to sync object temp file")?;

        if overwrite {
            tmp.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("failed to move object into {}", path.display()))?;
            return Ok(PutOutcome::Created);
        }

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(PutOutcome::Created),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.error)
                .with_context(|| format!("failed to move object into {}", path.display())),
        }
    }

    /// Remove the object (both compressed and legacy forms).
    pub fn remove(&self, hash: &ContentHash) -> Result<bool> {
        let mut removed = false;
        for path in [self.object_path(hash), self.legacy_path(hash)] {
            if path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove object {}", path.display()))?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Run a closure against a clone of this store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ShardedFileStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .context("filesystem task panicked")?
    }
}

#[async_trait]
impl BackendStore for ShardedFileStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    fn location(&self, hash: &ContentHash) -> String {
        self.object_path(hash).display().to_string()
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        let hash = hash.clone();
        self.blocking(move |store| Ok(store.exists(&hash))).await
    }

    async fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome> {
        let hash = hash.clone();
        let data = data.to_vec();
        self.blocking(move |store| store.write(&hash, &data, false))
            .await
    }

    async fn replace(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let hash = hash.clone();
        let data = data.to_vec();
        self.blocking(move |store| store.write(&hash, &data, true).map(|_| ()))
            .await
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let hash = hash.clone();
        self.blocking(move |store| store.read(&hash)).await
    }

    async fn delete(&self, hash: &ContentHash) -> Result<bool> {
        let hash = hash.clone();
        self.blocking(move |store| store.remove(&hash)).await
    }
}

/// Steps of the directory repair loop in [`ensure_dir`].
#[derive(Debug)]
enum DirRepair {
    /// Try to create the target directory.
    Create,
    /// `PathBuf` could not be created; check whether its parent can.
    Probe(PathBuf),
    /// The parent of `PathBuf` exists, so `PathBuf` itself is in the way.
    Clear(PathBuf),
}

/// Create `dir` (below `base`), removing plain files that squat on a path
/// component where a directory is needed.
///
/// Old asset trees occasionally contain a file named like a shard directory.
/// The repair walks up from `dir` to the first component whose parent can be
/// created, removes that component if it is not a directory, and retries.
/// Nothing at or above `base` is ever removed, and the number of removals is
/// bounded by the depth of `dir` below `base`.
pub fn ensure_dir(base: &Path, dir: &Path) -> Result<()> {
    let max_repairs = dir
        .strip_prefix(base)
        .map(|rel| rel.components().count())
        .unwrap_or(0);
    let mut repairs = 0;
    let mut step = DirRepair::Create;

    loop {
        step = match step {
            DirRepair::Create => match fs::create_dir_all(dir) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(dir = %dir.display(), "directory creation failed: {e}");
                    DirRepair::Probe(dir.to_path_buf())
                }
            },
            DirRepair::Probe(candidate) => {
                if candidate == base || !candidate.starts_with(base) {
                    bail!("could not resolve path creation error for {}", dir.display());
                }
                let Some(parent) = candidate.parent() else {
                    bail!("could not resolve path creation error for {}", dir.display());
                };
                match fs::create_dir_all(parent) {
                    Ok(()) => DirRepair::Clear(candidate),
                    Err(_) => DirRepair::Probe(parent.to_path_buf()),
                }
            }
            DirRepair::Clear(blocker) => {
                let is_file = fs::symlink_metadata(&blocker)
                    .map(|m| !m.is_dir())
                    .unwrap_or(false);
                if !is_file || repairs >= max_repairs {
                    bail!("could not resolve path creation error for {}", dir.display());
                }
                warn!(path = %blocker.display(), "removing file blocking shard directory");
                fs::remove_file(&blocker)
                    .with_context(|| format!("failed to remove {}", blocker.display()))?;
                repairs += 1;
                DirRepair::Create
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ShardLayout;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let data = b"Hello, World!";
        let hash = ContentHash::from_data(data);
        assert_eq!(store.write(&hash, data, false)?, PutOutcome::Created);

        let retrieved = store.read(&hash)?.expect("should exist");
        assert_eq!(retrieved, data);

        Ok(())
    }

    #[test]
    fn test_objects_are_gzipped_under_shard_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let hash = ContentHash::from_data(b"HELLO");
        store.write(&hash, b"HELLO", false)?;

        let expected = temp_dir
            .path()
            .join("37/33/CD/977F")
            .join(format!("{}.gz", hash));
        assert_eq!(store.object_path(&hash), expected);

        let raw = fs::read(&expected)?;
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        Ok(())
    }

    #[test]
    fn test_grid_layout_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config =
            FileBackendConfig::with_base_path(temp_dir.path()).with_layout(ShardLayout::Grid);
        let store = ShardedFileStore::new(config)?;

        let hash = ContentHash::from_data(b"HELLO");
        store.write(&hash, b"HELLO", false)?;
        assert!(temp_dir
            .path()
            .join("373/3CD")
            .join(format!("{}.gz", hash))
            .is_file());

        Ok(())
    }

    #[test]
    fn test_second_write_is_noop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let hash = ContentHash::from_data(b"Duplicate Me");
        assert_eq!(store.write(&hash, b"Duplicate Me", false)?, PutOutcome::Created);
        assert_eq!(
            store.write(&hash, b"Duplicate Me", false)?,
            PutOutcome::AlreadyPresent
        );

        let shard = store.object_path(&hash).parent().unwrap().to_path_buf();
        let files: Vec<_> = fs::read_dir(shard)?.collect();
        assert_eq!(files.len(), 1, "no stray temp files or duplicates");

        Ok(())
    }

    #[test]
    fn test_overwrite_replaces_damaged_object() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let hash = ContentHash::from_data(b"repair me");
        store.write(&hash, b"repair me", false)?;
        fs::write(store.object_path(&hash), b"truncated")?;
        assert_eq!(store.read(&hash)?, None);

        store.write(&hash, b"repair me", true)?;
        assert_eq!(store.read(&hash)?, Some(b"repair me".to_vec()));

        Ok(())
    }

    #[test]
    fn test_reads_legacy_uncompressed_object() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let hash = ContentHash::from_data(b"legacy");
        let legacy = temp_dir
            .path()
            .join(ShardLayout::Standard.relative_path(&hash));
        fs::create_dir_all(legacy.parent().unwrap())?;
        fs::write(&legacy, b"legacy")?;

        assert!(store.exists(&hash));
        assert_eq!(store.read(&hash)?, Some(b"legacy".to_vec()));
        assert!(store.remove(&hash)?);
        assert!(!store.exists(&hash));

        Ok(())
    }

    #[test]
    fn test_exists_and_remove() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        let hash = ContentHash::from_data(b"existence test");
        assert!(!store.exists(&hash));
        assert_eq!(store.read(&hash)?, None);
        assert!(!store.remove(&hash)?);

        store.write(&hash, b"existence test", false)?;
        assert!(store.exists(&hash));
        assert!(store.remove(&hash)?);
        assert!(!store.exists(&hash));

        Ok(())
    }

    #[test]
    fn test_file_squatting_on_shard_directory_is_removed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        // A stray file where the second shard level should be a directory.
        fs::create_dir_all(temp_dir.path().join("37"))?;
        fs::write(temp_dir.path().join("37/33"), b"chicken bone")?;

        let hash = ContentHash::from_data(b"HELLO");
        assert_eq!(store.write(&hash, b"HELLO", false)?, PutOutcome::Created);
        assert!(temp_dir.path().join("37/33").is_dir());
        assert_eq!(store.read(&hash)?, Some(b"HELLO".to_vec()));

        Ok(())
    }

    #[test]
    fn test_file_squatting_on_leaf_directory_is_removed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ShardedFileStore::at_path(temp_dir.path())?;

        fs::create_dir_all(temp_dir.path().join("37/33/CD"))?;
        fs::write(temp_dir.path().join("37/33/CD/977F"), b"chicken bone")?;

        let hash = ContentHash::from_data(b"HELLO");
        store.write(&hash, b"HELLO", false)?;
        assert!(store.exists(&hash));

        Ok(())
    }

    #[test]
    fn test_ensure_dir_never_touches_paths_outside_base() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path().join("base");
        fs::create_dir_all(&base)?;
        fs::write(temp_dir.path().join("outside"), b"keep me")?;

        let result = ensure_dir(&base, &temp_dir.path().join("outside/child"));
        assert!(result.is_err());
        assert!(temp_dir.path().join("outside").is_file());

        Ok(())
    }

    #[test]
    fn test_new_rejects_empty_base_path() {
        assert!(ShardedFileStore::at_path("").is_err());
    }

    #[test]
    fn test_concurrent_writes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(ShardedFileStore::at_path(temp_dir.path())?);

        let data = b"Concurrent Data";
        let hash = ContentHash::from_data(data);

        let mut handles = vec![];
        for _ in 0..10 {
            let store_clone = store.clone();
            let hash = hash.clone();
            handles.push(thread::spawn(move || {
                store_clone.write(&hash, data, false).expect("write failed")
            }));
        }

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == PutOutcome::Created)
            .count();
        assert!(created >= 1);

        let retrieved = store.read(&hash)?.expect("should exist");
        assert_eq!(retrieved, data);

        Ok(())
    }

    #[tokio::test]
    async fn test_backend_trait_roundtrip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backend: Arc<dyn BackendStore> = Arc::new(ShardedFileStore::at_path(temp_dir.path())?);

        let hash = ContentHash::from_data(b"through the trait");
        assert!(!backend.exists(&hash).await?);
        assert_eq!(backend.put(&hash, b"through the trait").await?, PutOutcome::Created);
        assert_eq!(
            backend.put(&hash, b"through the trait").await?,
            PutOutcome::AlreadyPresent
        );
        assert!(backend.exists(&hash).await?);
        assert_eq!(backend.get(&hash).await?, Some(b"through the trait".to_vec()));
        assert!(backend.location(&hash).ends_with(".gz"));
        assert!(backend.delete(&hash).await?);
        assert_eq!(backend.get(&hash).await?, None);

        Ok(())
    }
}
