//! Metadata catalog: logical id to content hash and descriptor.
//!
//! The service never persists descriptors on its own; every record goes
//! through a [`MetadataStore`]. Two implementations are provided: an
//! in-process map for tests and embedding, and a directory of JSON records.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cas::ContentHash;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::asset::{Asset, AssetDescriptor};

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,

    #[serde(default)]
    pub full_id: Uuid,

    pub hash: ContentHash,

    #[serde(flatten)]
    pub descriptor: AssetDescriptor,

    pub created_at: DateTime<Utc>,
}

impl MetadataRecord {
    /// Record for `asset`, whose data hashes to `hash`.
    pub fn for_asset(asset: &Asset, hash: ContentHash) -> Self {
        Self {
            id: asset.id.clone(),
            full_id: asset.full_id,
            hash,
            descriptor: asset.descriptor.clone(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild the asset this record describes around `data`.
    pub fn into_asset(self, data: Vec<u8>) -> Asset {
        Asset {
            id: self.id,
            full_id: self.full_id,
            descriptor: self.descriptor,
            data,
        }
    }
}

/// Stream of catalog records, as returned by [`MetadataStore::enumerate_all`].
pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<MetadataRecord>> + Send + 'a>>;

/// The metadata catalog consumed by the asset service.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a record. A missing id is `Ok(None)`.
    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>>;

    /// Insert or replace a record. Returns `false` if the store refused it.
    async fn put(&self, record: MetadataRecord) -> Result<bool>;

    /// Remove a record. Returns whether one existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Existence of each id, in order.
    async fn exists(&self, ids: &[String]) -> Result<Vec<bool>>;

    /// Every record in the catalog. Per-record failures are yielded as errors
    /// without ending the stream.
    fn enumerate_all(&self) -> RecordStream<'_>;

    /// Number of records.
    async fn count(&self) -> Result<usize>;
}

/// In-process catalog.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetadataStore {
    records: Arc<DashMap<String, MetadataRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn put(&self, record: MetadataRecord) -> Result<bool> {
        self.records.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn exists(&self, ids: &[String]) -> Result<Vec<bool>> {
        Ok(ids.iter().map(|id| self.records.contains_key(id)).collect())
    }

    fn enumerate_all(&self) -> RecordStream<'_> {
        let mut snapshot: Vec<MetadataRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

/// Catalog persisted as one JSON file per record.
///
/// Layout: `root/records/<2-char prefix>/<digest of id>.json`. The file name
/// is derived from the id rather than the id itself so arbitrary id strings
/// are safe as file names.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    root: PathBuf,
}

impl JsonMetadataStore {
    /// Open (creating if needed) a catalog under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let records = root.join("records");
        std::fs::create_dir_all(&records)
            .with_context(|| format!("failed to create metadata dir {}", records.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        let key = ContentHash::from_data(id.as_bytes());
        self.records_dir()
            .join(&key.as_str()[..2])
            .join(format!("{}.json", key))
    }
}

fn write_record(path: &Path, record: &MetadataRecord) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("record path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create record dir {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(record).context("failed to serialize record")?;
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(&json).context("failed to write record")?;
    temp.as_file().sync_all().context("failed to sync record")?;
    temp.persist(path)
        .with_context(|| format!("failed to persist record {}", path.display()))?;
    Ok(())
}

async fn read_record(path: &Path) -> Result<MetadataRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read record {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse record {}", path.display()))
}

fn record_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<MetadataRecord>> {
        let path = self.record_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        read_record(&path).await.map(Some)
    }

    async fn put(&self, record: MetadataRecord) -> Result<bool> {
        let path = self.record_path(&record.id);
        tokio::task::spawn_blocking(move || write_record(&path, &record))
            .await
            .context("record writer panicked")??;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove record {}", path.display()))
            }
        }
    }

    async fn exists(&self, ids: &[String]) -> Result<Vec<bool>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.record_path(id);
            let present = tokio::fs::try_exists(&path)
                .await
                .with_context(|| format!("failed to stat record {}", path.display()))?;
            found.push(present);
        }
        Ok(found)
    }

    fn enumerate_all(&self) -> RecordStream<'_> {
        let dir = self.records_dir();
        Box::pin(async_stream::stream! {
            let files = match tokio::task::spawn_blocking(move || record_files(&dir)).await {
                Ok(files) => files,
                Err(e) => {
                    yield Err(anyhow::Error::new(e).context("record scan panicked"));
                    return;
                }
            };
            for path in files {
                yield read_record(&path).await;
            }
        })
    }

    async fn count(&self) -> Result<usize> {
        let dir = self.records_dir();
        let files = tokio::task::spawn_blocking(move || record_files(&dir))
            .await
            .context("record scan panicked")?;
        Ok(files.len())
    }
}
