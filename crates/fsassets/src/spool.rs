//! Write-behind spool.
//!
//! `Store` drops new asset bytes here and returns; the [`SpoolWriter`] moves
//! them into the backend on its own schedule.
//!
//! Layout:
//! ```text
//! {spool_dir}/
//! ├── spool/               # temp files while a write is in progress
//! └── 3733CD97...F0.asset  # staged, complete, waiting for the writer
//! ```
//!
//! A staged file only ever appears through an atomic rename from `spool/`,
//! so the writer never sees a partial file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cas::{BackendStore, ContentHash, PutOutcome};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STAGED_EXT: &str = "asset";

/// The spool directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
    staging: PathBuf,
}

impl Spool {
    /// Open the spool at `dir`, creating it and its staging subdirectory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let staging = dir.join("spool");
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create spool dir {}", staging.display()))?;
        Ok(Self { dir, staging })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the staged file for `hash` lives.
    pub fn staged_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{}.{}", hash, STAGED_EXT))
    }

    /// Stage `data` under `hash`: write a temp file, then rename it into place.
    pub fn stage(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let mut temp = NamedTempFile::new_in(&self.staging)
            .with_context(|| format!("failed to create temp file in {}", self.staging.display()))?;
        temp.write_all(data).context("failed to write spool file")?;
        temp.as_file().sync_all().context("failed to sync spool file")?;

        let target = self.staged_path(hash);
        temp.persist(&target)
            .with_context(|| format!("failed to move spool file to {}", target.display()))?;

        debug!(%hash, bytes = data.len(), "staged");
        Ok(())
    }

    pub fn is_staged(&self, hash: &ContentHash) -> bool {
        self.staged_path(hash).is_file()
    }

    /// Bytes of a staged file, or `None` if it is not (or no longer) staged.
    pub fn read_staged(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let path = self.staged_path(hash);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// All staged hashes. Files that are not named after a digest are skipped.
    pub fn list_staged(&self) -> Result<Vec<ContentHash>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list spool dir {}", self.dir.display()))?;

        let mut staged = Vec::new();
        for entry in entries {
            let entry = entry.context("failed to read spool entry")?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(STAGED_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match ContentHash::from_str_checked(stem) {
                Ok(hash) => staged.push(hash),
                Err(e) => warn!(path = %path.display(), "ignoring stray spool file: {e}"),
            }
        }
        staged.sort();
        Ok(staged)
    }

    /// Delete a staged file. Returns whether it existed.
    pub fn remove(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.staged_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// What one writer cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Objects created in the backend.
    pub written: usize,
    /// Staged files whose object already existed.
    pub already_present: usize,
    /// Files left in the spool for the next cycle.
    pub failed: usize,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.written + self.already_present + self.failed
    }
}

/// Moves staged files into the backend.
#[derive(Clone)]
pub struct SpoolWriter {
    spool: Spool,
    backend: Arc<dyn BackendStore>,
}

impl SpoolWriter {
    pub fn new(spool: Spool, backend: Arc<dyn BackendStore>) -> Self {
        Self { spool, backend }
    }

    /// Run one writer cycle over everything currently staged.
    ///
    /// A file that fails is logged and left for the next cycle; it never stops
    /// the rest of the batch.
    pub async fn flush_once(&self) -> FlushReport {
        let mut report = FlushReport::default();

        let spool = self.spool.clone();
        let staged = match tokio::task::spawn_blocking(move || spool.list_staged()).await {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => {
                warn!("spool scan failed: {e:#}");
                return report;
            }
            Err(e) => {
                warn!("spool scan panicked: {e}");
                return report;
            }
        };
        if staged.is_empty() {
            return report;
        }

        let started = Instant::now();
        for hash in &staged {
            match self.flush_file(hash).await {
                Ok(Some(PutOutcome::Created)) => report.written += 1,
                Ok(Some(PutOutcome::AlreadyPresent)) => report.already_present += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(%hash, "failed to flush staged asset, will retry: {e:#}");
                    report.failed += 1;
                }
            }
        }

        let elapsed = started.elapsed();
        let files = report.total().max(1) as u32;
        info!(
            files = report.total(),
            written = report.written,
            already_present = report.already_present,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            avg_ms = (elapsed / files).as_secs_f64() * 1000.0,
            "spool flush complete"
        );
        report
    }

    async fn flush_file(&self, hash: &ContentHash) -> Result<Option<PutOutcome>> {
        let spool = self.spool.clone();
        let key = hash.clone();
        let Some(data) = tokio::task::spawn_blocking(move || spool.read_staged(&key))
            .await
            .context("spool read panicked")??
        else {
            return Ok(None);
        };

        let outcome = self.backend.put(hash, &data).await?;

        let spool = self.spool.clone();
        let key = hash.clone();
        tokio::task::spawn_blocking(move || spool.remove(&key))
            .await
            .context("spool remove panicked")??;

        debug!(%hash, location = %self.backend.location(hash), ?outcome, "flushed");
        Ok(Some(outcome))
    }

    /// Run [`flush_once`](Self::flush_once) every `interval` until cancelled.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                spool = %self.spool.dir().display(),
                backend = %self.backend.kind(),
                interval_ms = interval.as_millis() as u64,
                "spool writer started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("spool writer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cas::{BackendKind, ShardedFileStore};
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, Spool, Arc<ShardedFileStore>)> {
        let temp_dir = TempDir::new()?;
        let spool = Spool::new(temp_dir.path().join("spool"))?;
        let store = Arc::new(ShardedFileStore::at_path(temp_dir.path().join("data"))?);
        Ok((temp_dir, spool, store))
    }

    #[test]
    fn test_stage_and_read() -> Result<()> {
        let (_temp, spool, _) = setup()?;
        let hash = ContentHash::from_data(b"HELLO");

        assert!(!spool.is_staged(&hash));
        assert_eq!(spool.read_staged(&hash)?, None);

        spool.stage(&hash, b"HELLO")?;
        assert!(spool.is_staged(&hash));
        assert_eq!(spool.read_staged(&hash)?, Some(b"HELLO".to_vec()));
        assert_eq!(
            spool.staged_path(&hash).file_name().and_then(|n| n.to_str()),
            Some(format!("{}.asset", hash).as_str())
        );

        assert!(spool.remove(&hash)?);
        assert!(!spool.remove(&hash)?);
        assert!(!spool.is_staged(&hash));

        Ok(())
    }

    #[test]
    fn test_stage_leaves_no_temp_files() -> Result<()> {
        let (_temp, spool, _) = setup()?;
        spool.stage(&ContentHash::from_data(b"a"), b"a")?;
        spool.stage(&ContentHash::from_data(b"a"), b"a")?;

        assert_eq!(fs::read_dir(spool.dir().join("spool"))?.count(), 0);
        assert_eq!(spool.list_staged()?.len(), 1);

        Ok(())
    }

    #[test]
    fn test_list_skips_stray_files() -> Result<()> {
        let (_temp, spool, _) = setup()?;
        let hash = ContentHash::from_data(b"real");
        spool.stage(&hash, b"real")?;

        fs::write(spool.dir().join("notes.txt"), b"x")?;
        fs::write(spool.dir().join("not-a-hash.asset"), b"x")?;
        fs::write(spool.dir().join("spool").join("inflight"), b"x")?;

        assert_eq!(spool.list_staged()?, vec![hash]);
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_moves_staged_into_backend() -> Result<()> {
        let (_temp, spool, store) = setup()?;
        let hello = ContentHash::from_data(b"HELLO");
        let world = ContentHash::from_data(b"WORLD");
        spool.stage(&hello, b"HELLO")?;
        spool.stage(&world, b"WORLD")?;

        let writer = SpoolWriter::new(spool.clone(), store.clone());
        let report = writer.flush_once().await;

        assert_eq!(report.written, 2);
        assert_eq!(report.failed, 0);
        assert!(spool.list_staged()?.is_empty());
        assert_eq!(store.read(&hello)?, Some(b"HELLO".to_vec()));
        assert!(store.object_path(&world).is_file());

        assert_eq!(writer.flush_once().await, FlushReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_counts_existing_objects() -> Result<()> {
        let (_temp, spool, store) = setup()?;
        let hash = ContentHash::from_data(b"dup");
        store.write(&hash, b"dup", false)?;
        spool.stage(&hash, b"dup")?;

        let report = SpoolWriter::new(spool.clone(), store).flush_once().await;
        assert_eq!(report.already_present, 1);
        assert!(!spool.is_staged(&hash));

        Ok(())
    }

    #[tokio::test]
    async fn test_flush_repairs_chicken_bone() -> Result<()> {
        let (temp, spool, store) = setup()?;
        let hash = ContentHash::from_data(b"HELLO");
        // 37/33 should be a directory on the way to the object
        fs::create_dir_all(temp.path().join("data/37"))?;
        fs::write(temp.path().join("data/37/33"), b"bone")?;
        spool.stage(&hash, b"HELLO")?;

        let report = SpoolWriter::new(spool.clone(), store.clone()).flush_once().await;

        assert_eq!(report.written, 1);
        assert!(temp.path().join("data/37/33").is_dir());
        assert_eq!(store.read(&hash)?, Some(b"HELLO".to_vec()));
        assert!(!spool.is_staged(&hash));
        Ok(())
    }

    struct BrokenBackend;

    #[async_trait]
    impl BackendStore for BrokenBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ObjectStorage
        }
        fn location(&self, hash: &ContentHash) -> String {
            hash.to_string()
        }
        async fn exists(&self, _hash: &ContentHash) -> Result<bool> {
            anyhow::bail!("bucket unreachable")
        }
        async fn put(&self, _hash: &ContentHash, _data: &[u8]) -> Result<PutOutcome> {
            anyhow::bail!("bucket unreachable")
        }
        async fn replace(&self, _hash: &ContentHash, _data: &[u8]) -> Result<()> {
            anyhow::bail!("bucket unreachable")
        }
        async fn get(&self, _hash: &ContentHash) -> Result<Option<Vec<u8>>> {
            anyhow::bail!("bucket unreachable")
        }
        async fn delete(&self, _hash: &ContentHash) -> Result<bool> {
            anyhow::bail!("bucket unreachable")
        }
    }

    #[tokio::test]
    async fn test_failed_files_stay_for_retry() -> Result<()> {
        let (_temp, spool, _) = setup()?;
        let hash = ContentHash::from_data(b"retry me");
        spool.stage(&hash, b"retry me")?;

        let writer = SpoolWriter::new(spool.clone(), Arc::new(BrokenBackend));
        let report = writer.flush_once().await;

        assert_eq!(report.failed, 1);
        assert!(spool.is_staged(&hash));
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_writer_flushes_and_stops() -> Result<()> {
        let (_temp, spool, store) = setup()?;
        let hash = ContentHash::from_data(b"background");
        spool.stage(&hash, b"background")?;

        let cancel = CancellationToken::new();
        let handle = SpoolWriter::new(spool.clone(), store.clone())
            .spawn(Duration::from_millis(20), cancel.clone());

        for _ in 0..100 {
            if !spool.is_staged(&hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store.exists(&hash));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        Ok(())
    }
}
