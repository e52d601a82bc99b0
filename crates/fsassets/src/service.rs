//! AssetService: the write-behind store and tiered read path.
//!
//! Writes stage bytes in the spool (or go straight to the backend when
//! write-behind is off), record metadata and warm the cache. Reads walk
//! cache, then metadata plus spool/backend, then the fallback source; a
//! fallback hit is stored locally so the next read stays local.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cas::{BackendStore, ContentHash};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::asset::{Asset, ZERO_ID};
use crate::cache::{open_cache, AssetCache, CachedAsset};
use crate::config::{MetadataKind, ServiceConfig};
use crate::fallback::{FallbackAssetSource, HttpFallback};
use crate::metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataRecord, MetadataStore};
use crate::spool::{FlushReport, Spool, SpoolWriter};
use crate::stats::{spawn_stats_task, ReadStats};

/// Runtime switches, fixed at construction.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Stage writes in the spool rather than writing the backend inline.
    pub write_behind: bool,
    /// Whether this instance runs the background loops.
    pub is_leader: bool,
    pub writer_interval: Duration,
    pub stats_interval: Duration,
    pub show_stats: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            write_behind: true,
            is_leader: true,
            writer_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(60),
            show_stats: true,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            write_behind: config.service.write_behind,
            is_leader: config.is_leader(),
            writer_interval: config.writer_interval(),
            stats_interval: config.stats_interval(),
            show_stats: config.service.show_stats,
        }
    }
}

/// Builder for [`AssetService`].
pub struct AssetServiceBuilder {
    metadata: Arc<dyn MetadataStore>,
    backend: Arc<dyn BackendStore>,
    spool_dir: PathBuf,
    cache: Option<Arc<dyn AssetCache>>,
    fallback: Option<Arc<dyn FallbackAssetSource>>,
    options: ServiceOptions,
}

impl AssetServiceBuilder {
    pub fn cache(mut self, cache: Arc<dyn AssetCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackAssetSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<AssetService> {
        let spool = Spool::new(self.spool_dir)?;
        Ok(AssetService {
            metadata: self.metadata,
            backend: self.backend,
            spool,
            cache: self.cache,
            fallback: self.fallback,
            stats: Arc::new(ReadStats::new()),
            options: self.options,
        })
    }
}

/// The asset store.
pub struct AssetService {
    metadata: Arc<dyn MetadataStore>,
    backend: Arc<dyn BackendStore>,
    spool: Spool,
    cache: Option<Arc<dyn AssetCache>>,
    fallback: Option<Arc<dyn FallbackAssetSource>>,
    stats: Arc<ReadStats>,
    options: ServiceOptions,
}

impl AssetService {
    pub fn builder(
        metadata: Arc<dyn MetadataStore>,
        backend: Arc<dyn BackendStore>,
        spool_dir: impl Into<PathBuf>,
    ) -> AssetServiceBuilder {
        AssetServiceBuilder {
            metadata,
            backend,
            spool_dir: spool_dir.into(),
            cache: None,
            fallback: None,
            options: ServiceOptions::default(),
        }
    }

    /// Open every component named in `config`.
    ///
    /// Configuration errors are fatal here. An unreachable cache is not; the
    /// service runs without one.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        let backend = config
            .backend
            .as_ref()
            .context("no storage backend configured")?
            .open()?;

        let metadata: Arc<dyn MetadataStore> = match config.metadata.kind {
            MetadataKind::Json => Arc::new(JsonMetadataStore::open(&config.metadata.path)?),
            MetadataKind::Memory => Arc::new(MemoryMetadataStore::new()),
        };

        let mut builder = Self::builder(metadata, backend, &config.service.spool_dir)
            .options(ServiceOptions::from_config(config));

        if let Some(cache) = open_cache(&config.cache).await {
            builder = builder.cache(cache);
        }
        if let Some(endpoint) = &config.fallback.endpoint {
            let timeout = Duration::from_secs(config.fallback.timeout_secs);
            builder = builder.fallback(Arc::new(HttpFallback::new(endpoint, timeout)?));
        }

        let service = builder.build()?;
        info!(
            backend = %service.backend.kind(),
            spool = %service.spool.dir().display(),
            write_behind = service.options.write_behind,
            leader = service.options.is_leader,
            cache = service.cache.is_some(),
            fallback = service.fallback.is_some(),
            "asset service ready"
        );
        Ok(service)
    }

    pub fn backend(&self) -> &Arc<dyn BackendStore> {
        &self.backend
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn stats(&self) -> &Arc<ReadStats> {
        &self.stats
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn is_leader(&self) -> bool {
        self.options.is_leader
    }

    /// Store an asset and return its logical id.
    ///
    /// With write-behind on, this returns once the bytes are staged; the
    /// writer makes them durable later. If the metadata store refuses the
    /// record, [`ZERO_ID`] is returned. Errors are I/O failures while staging
    /// or writing the bytes.
    pub async fn store(&self, mut asset: Asset) -> Result<String> {
        asset.truncate_fields();
        asset.sanitize();
        let hash = asset.hash();

        if self.options.write_behind {
            self.stage_if_new(&hash, &asset.data).await?;
        } else {
            let outcome = self.backend.put(&hash, &asset.data).await?;
            debug!(%hash, ?outcome, "stored inline");
        }

        asset.assign_ids();
        if asset.descriptor.content_type.is_empty() {
            asset.descriptor.content_type = asset.asset_type().content_type().to_string();
        }

        let record = MetadataRecord::for_asset(&asset, hash);
        match self.metadata.put(record.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                error!(asset = %asset.id, "metadata store rejected record");
                return Ok(ZERO_ID.to_string());
            }
            Err(e) => {
                error!(asset = %asset.id, "failed to store metadata: {e:#}");
                return Ok(ZERO_ID.to_string());
            }
        }

        if let Some(cache) = &self.cache {
            cache
                .insert(CachedAsset {
                    record,
                    data: asset.data,
                })
                .await;
        }
        Ok(asset.id)
    }

    async fn stage_if_new(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let present = match self.backend.exists(hash).await {
            Ok(present) => present,
            Err(e) => {
                warn!(%hash, "backend check failed, staging anyway: {e:#}");
                false
            }
        };
        if present {
            debug!(%hash, "already in backend");
            return Ok(());
        }

        let spool = self.spool.clone();
        let hash = hash.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            if spool.is_staged(&hash) {
                return Ok(());
            }
            spool.stage(&hash, &data)
        })
        .await
        .context("spool write panicked")?
    }

    /// Fetch an asset by id.
    pub async fn get(&self, id: &str) -> Result<Option<Asset>> {
        Ok(self.get_with_hash(id).await?.map(|(asset, _)| asset))
    }

    /// Fetch an asset by id together with the digest of its data.
    ///
    /// Misses at every tier are `Ok(None)`. Backend and fallback failures are
    /// logged and treated as misses.
    pub async fn get_with_hash(&self, id: &str) -> Result<Option<(Asset, ContentHash)>> {
        if let Some(hit) = self.cached(id).await {
            let hash = hit.record.hash.clone();
            let mut asset = hit.record.into_asset(hit.data);
            asset.sanitize();
            return Ok(Some((asset, hash)));
        }

        let started = Instant::now();
        let Some(record) = self.lookup_record(id).await else {
            let found = self.from_fallback(id).await;
            if found.is_none() {
                self.stats.record_missing_metadata();
            }
            return Ok(found);
        };

        if let Some(data) = self.fetch_data(&record.hash).await {
            self.stats.record_read(started.elapsed());
            let hash = record.hash.clone();
            if let Some(cache) = &self.cache {
                cache
                    .insert(CachedAsset {
                        record: record.clone(),
                        data: data.clone(),
                    })
                    .await;
            }
            let mut asset = record.into_asset(data);
            asset.sanitize();
            return Ok(Some((asset, hash)));
        }

        let found = self.from_fallback(id).await;
        if found.is_none() {
            debug!(asset = %id, hash = %record.hash, "asset data missing from backend");
            self.stats.record_missing_backend();
        }
        Ok(found)
    }

    /// Only the bytes of an asset. The fallback source is not consulted.
    pub async fn get_data(&self, id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.cached(id).await {
            return Ok(Some(hit.data));
        }
        let Some(record) = self.lookup_record(id).await else {
            return Ok(None);
        };
        Ok(self.fetch_data(&record.hash).await)
    }

    /// The metadata record for `id`, without its data.
    pub async fn get_metadata(&self, id: &str) -> Result<Option<MetadataRecord>> {
        self.metadata.get(id).await
    }

    /// Existence of each id in the metadata catalog.
    pub async fn exists(&self, ids: &[String]) -> Result<Vec<bool>> {
        self.metadata.exists(ids).await
    }

    /// Remove an asset's metadata record and cache entry.
    ///
    /// The backend object stays: other ids may share the same content.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if let Some(cache) = &self.cache {
            cache.remove(id).await;
        }
        self.metadata.delete(id).await
    }

    /// A writer over this service's spool and backend.
    pub fn writer(&self) -> SpoolWriter {
        SpoolWriter::new(self.spool.clone(), self.backend.clone())
    }

    /// Run one writer cycle now.
    pub async fn flush_spool(&self) -> FlushReport {
        self.writer().flush_once().await
    }

    /// Start the writer and stats loops. Secondary instances start nothing.
    pub fn start_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.options.is_leader {
            info!("secondary instance, background loops not started");
            return Vec::new();
        }

        let mut handles = vec![self
            .writer()
            .spawn(self.options.writer_interval, cancel.clone())];
        if self.options.show_stats {
            handles.push(spawn_stats_task(
                self.stats.clone(),
                self.options.stats_interval,
                cancel,
            ));
        }
        handles
    }

    async fn cached(&self, id: &str) -> Option<CachedAsset> {
        match &self.cache {
            Some(cache) => cache.lookup(id).await,
            None => None,
        }
    }

    async fn lookup_record(&self, id: &str) -> Option<MetadataRecord> {
        match self.metadata.get(id).await {
            Ok(record) => record,
            Err(e) => {
                error!(asset = %id, "metadata lookup failed: {e:#}");
                None
            }
        }
    }

    /// Bytes for `hash`: the spool first, then the backend. Empty data counts
    /// as missing.
    async fn fetch_data(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        let spool = self.spool.clone();
        let key = hash.clone();
        match tokio::task::spawn_blocking(move || spool.read_staged(&key)).await {
            Ok(Ok(Some(data))) if !data.is_empty() => return Some(data),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(%hash, "failed to read staged data: {e:#}"),
            Err(e) => warn!(%hash, "spool read panicked: {e}"),
        }

        match self.backend.get(hash).await {
            Ok(data) => data.filter(|d| !d.is_empty()),
            Err(e) => {
                error!(%hash, location = %self.backend.location(hash), "backend read failed: {e:#}");
                None
            }
        }
    }

    /// Ask the fallback source and store a hit locally.
    async fn from_fallback(&self, id: &str) -> Option<(Asset, ContentHash)> {
        let fallback = self.fallback.as_ref()?;
        let mut asset = match fallback.get(id).await {
            Ok(Some(asset)) => asset,
            Ok(None) => return None,
            Err(e) => {
                warn!(asset = %id, "fallback lookup failed: {e:#}");
                return None;
            }
        };

        asset.descriptor.content_type = asset.asset_type().content_type().to_string();
        if asset.id.is_empty() {
            asset.id = id.to_string();
        }
        asset.assign_ids();
        asset.sanitize();
        let hash = asset.hash();

        info!("Added asset {} from fallback to local store", id);
        match self.store(asset.clone()).await {
            Ok(stored) if stored == ZERO_ID => {
                warn!(asset = %id, "fallback asset could not be recorded locally")
            }
            Ok(_) => {}
            Err(e) => warn!(asset = %id, "failed to store fallback asset: {e:#}"),
        }

        Some((asset, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetType;
    use cas::ShardedFileStore;
    use tempfile::TempDir;

    fn service(temp: &TempDir, options: ServiceOptions) -> Result<AssetService> {
        let backend = Arc::new(ShardedFileStore::at_path(temp.path().join("data"))?);
        AssetService::builder(
            Arc::new(MemoryMetadataStore::new()),
            backend,
            temp.path().join("spool"),
        )
        .options(options)
        .build()
    }

    #[tokio::test]
    async fn test_store_stages_then_flush_persists() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;

        let id = svc.store(Asset::new("a", AssetType::Notecard, b"HELLO".to_vec())).await?;
        let hash = ContentHash::from_data(b"HELLO");
        assert_eq!(id, "a");
        assert!(svc.spool().is_staged(&hash));
        assert!(!svc.backend().exists(&hash).await?);

        let report = svc.flush_spool().await;
        assert_eq!(report.written, 1);
        assert!(svc.backend().exists(&hash).await?);
        assert_eq!(svc.get_data("a").await?, Some(b"HELLO".to_vec()));

        Ok(())
    }

    #[tokio::test]
    async fn test_sync_mode_writes_backend_inline() -> Result<()> {
        let temp = TempDir::new()?;
        let options = ServiceOptions {
            write_behind: false,
            ..Default::default()
        };
        let svc = service(&temp, options)?;

        svc.store(Asset::new("a", AssetType::Texture, b"inline".to_vec())).await?;
        let hash = ContentHash::from_data(b"inline");
        assert!(svc.backend().exists(&hash).await?);
        assert!(!svc.spool().is_staged(&hash));

        Ok(())
    }

    #[tokio::test]
    async fn test_store_skips_staging_for_known_content() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;
        let hash = ContentHash::from_data(b"known");
        svc.backend().put(&hash, b"known").await?;

        svc.store(Asset::new("a", AssetType::Texture, b"known".to_vec())).await?;
        assert!(!svc.spool().is_staged(&hash));

        Ok(())
    }

    #[tokio::test]
    async fn test_store_assigns_id_and_content_type() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;

        let id = svc.store(Asset::new("", AssetType::Sound, b"ogg".to_vec())).await?;
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let record = svc.get_metadata(&id).await?.expect("record");
        assert_eq!(record.full_id.to_string(), id);
        assert_eq!(record.descriptor.content_type, "audio/ogg");

        Ok(())
    }

    #[tokio::test]
    async fn test_object_assets_are_sanitized_before_hashing() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;

        svc.store(Asset::new("o", AssetType::Object, b"<a xmlns:xmlns:b=\"c\"/>".to_vec()))
            .await?;
        let (asset, hash) = svc.get_with_hash("o").await?.expect("asset");
        assert_eq!(asset.data, b"<a xmlns:b=\"c\"/>".to_vec());
        assert_eq!(hash, ContentHash::from_data(b"<a xmlns:b=\"c\"/>"));

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_metadata_only() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;
        svc.store(Asset::new("a", AssetType::Texture, b"shared".to_vec())).await?;
        svc.store(Asset::new("b", AssetType::Texture, b"shared".to_vec())).await?;
        svc.flush_spool().await;

        assert!(svc.delete("a").await?);
        assert!(!svc.delete("a").await?);
        assert_eq!(svc.get("a").await?, None);
        assert_eq!(
            svc.get("b").await?.map(|a| a.data),
            Some(b"shared".to_vec())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backend_object_is_a_miss() -> Result<()> {
        let temp = TempDir::new()?;
        let svc = service(&temp, ServiceOptions::default())?;
        svc.store(Asset::new("empty", AssetType::Texture, Vec::new())).await?;
        svc.flush_spool().await;

        assert_eq!(svc.get("empty").await?, None);
        assert_eq!(svc.stats().snapshot().missing_backend, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_secondary_starts_no_loops() -> Result<()> {
        let temp = TempDir::new()?;
        let options = ServiceOptions {
            is_leader: false,
            ..Default::default()
        };
        let svc = service(&temp, options)?;
        assert!(svc.start_background(CancellationToken::new()).is_empty());

        let leader = service(&temp, ServiceOptions::default())?;
        let cancel = CancellationToken::new();
        let handles = leader.start_background(cancel.clone());
        assert_eq!(handles.len(), 2);
        cancel.cancel();
        for handle in handles {
            handle.await?;
        }

        Ok(())
    }
}
