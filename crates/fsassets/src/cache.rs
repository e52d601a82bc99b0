//! Read-through cache of recently stored or read assets.
//!
//! The cache is never authoritative. Every failure (connection refused,
//! timeouts, undecodable entries) is logged and reported as a miss, so a
//! broken cache only costs latency.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::metadata::MetadataRecord;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached (record, data) pair for one logical id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub record: MetadataRecord,
    pub data: Vec<u8>,
}

/// Best-effort key/value layer in front of the metadata store and backend.
#[async_trait]
pub trait AssetCache: Send + Sync {
    /// Cached entry for `id`, or `None` on miss, expiry or cache failure.
    async fn lookup(&self, id: &str) -> Option<CachedAsset>;

    /// Insert or refresh an entry. Failures are logged, never returned.
    async fn insert(&self, entry: CachedAsset);

    /// Drop the entry for `id`, if any.
    async fn remove(&self, id: &str);
}

/// Build the cache described by `config`.
///
/// An empty connection string disables caching, `"memory"` selects the
/// in-process cache, anything else is treated as a Redis connection string.
/// A Redis server that cannot be reached degrades to running without a cache.
pub async fn open_cache(config: &CacheConfig) -> Option<Arc<dyn AssetCache>> {
    let connection = config.connection.trim();
    if connection.is_empty() {
        return None;
    }

    let ttl = config.ttl();
    if connection.eq_ignore_ascii_case("memory") {
        info!(ttl_secs = ttl.as_secs(), "using in-process asset cache");
        return Some(Arc::new(MemoryCache::new(ttl, config.max_entries)));
    }

    match RedisCache::connect(connection, ttl).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(e) => {
            warn!("asset cache disabled: {e:#}");
            None
        }
    }
}

/// Cache backed by a shared Redis server.
///
/// Each asset occupies two keys, `<id>:data` (raw bytes) and `<id>:meta`
/// (JSON record), both written with the same expiry.
pub struct RedisCache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisCache {
    pub async fn connect(connection: &str, ttl: Duration) -> Result<Self> {
        let url = normalize_redis_url(connection);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid redis connection string {connection:?}"))?;

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .context("timed out connecting to redis")?
            .context("failed to connect to redis")?;

        info!(ttl_secs = ttl.as_secs(), "connected to redis asset cache");
        Ok(Self { conn, ttl })
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

fn data_key(id: &str) -> String {
    format!("{id}:data")
}

fn meta_key(id: &str) -> String {
    format!("{id}:meta")
}

#[async_trait]
impl AssetCache for RedisCache {
    async fn lookup(&self, id: &str) -> Option<CachedAsset> {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<(Option<Vec<u8>>, Option<String>)> = redis::pipe()
            .get(data_key(id))
            .get(meta_key(id))
            .query_async(&mut conn)
            .await;

        match reply {
            Ok((Some(data), Some(meta))) => match serde_json::from_str::<MetadataRecord>(&meta) {
                Ok(record) => Some(CachedAsset { record, data }),
                Err(e) => {
                    warn!(asset = %id, "undecodable cache entry: {e}");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                warn!(asset = %id, "cache lookup failed: {e}");
                None
            }
        }
    }

    async fn insert(&self, entry: CachedAsset) {
        let id = entry.record.id.clone();
        let meta = match serde_json::to_string(&entry.record) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(asset = %id, "failed to encode cache entry: {e}");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let ttl = self.ttl_secs();
        let reply: redis::RedisResult<()> = redis::pipe()
            .set_ex(data_key(&id), entry.data, ttl)
            .ignore()
            .set_ex(meta_key(&id), meta, ttl)
            .ignore()
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(()) => debug!(asset = %id, "cached"),
            Err(e) => warn!(asset = %id, "cache insert failed: {e}"),
        }
    }

    async fn remove(&self, id: &str) {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<()> = redis::pipe()
            .del(data_key(id))
            .ignore()
            .del(meta_key(id))
            .ignore()
            .query_async(&mut conn)
            .await;

        if let Err(e) = reply {
            warn!(asset = %id, "cache remove failed: {e}");
        }
    }
}

/// Turn a configured connection string into a redis URL.
///
/// Accepts full `redis://` / `rediss://` URLs, strips a stray `http://` or
/// `https://` prefix, and converts the `host:port,password=...,ssl=true`
/// form into a URL.
pub fn normalize_redis_url(connection: &str) -> String {
    let trimmed = connection.trim();
    let stripped = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);

    if stripped.starts_with("redis://")
        || stripped.starts_with("rediss://")
        || stripped.starts_with("redis+unix://")
        || stripped.starts_with("unix://")
    {
        return stripped.to_string();
    }

    let mut parts = stripped.split(',');
    let host = parts.next().unwrap_or_default().trim();
    let mut password = None;
    let mut tls = false;
    for option in parts {
        let Some((key, value)) = option.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "password" => password = Some(value.trim()),
            "ssl" => tls = value.trim().eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    let scheme = if tls { "rediss" } else { "redis" };
    match password {
        Some(password) if !password.is_empty() => format!("{scheme}://:{password}@{host}"),
        _ => format!("{scheme}://{host}"),
    }
}

/// In-process cache with per-entry time-to-live.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, CachedAsset>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl AssetCache for MemoryCache {
    async fn lookup(&self, id: &str) -> Option<CachedAsset> {
        self.entries.get(id).await
    }

    async fn insert(&self, entry: CachedAsset) {
        self.entries.insert(entry.record.id.clone(), entry).await;
    }

    async fn remove(&self, id: &str) {
        self.entries.invalidate(id).await;
    }
}
