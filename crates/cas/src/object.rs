//! ObjectBackend: gzip-compressed objects in an S3-compatible bucket.
//!
//! The digest is the object key (after an optional configured prefix). The
//! bucket indexes keys directly, so no sharding is needed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload};

use crate::compress::{gunzip, gzip};
use crate::config::ObjectBackendConfig;
use crate::hash::ContentHash;
use crate::store::{BackendKind, BackendStore, PutOutcome};

/// Object storage backend.
#[derive(Debug, Clone)]
pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
}

impl ObjectBackend {
    /// Build an S3 client from configuration.
    ///
    /// Credentials not given in the config are picked up from the usual AWS
    /// environment variables.
    pub fn from_config(config: &ObjectBackendConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http)
            .with_client_options(
                ClientOptions::new().with_timeout(Duration::from_secs(config.request_timeout_secs)),
            );

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &config.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let s3 = builder
            .build()
            .with_context(|| format!("failed to configure S3 client for bucket {}", config.bucket))?;

        Ok(Self::with_store(Arc::new(s3), config.key_prefix.clone()))
    }

    /// Wrap an existing object store (e.g. `InMemory` in tests).
    pub fn with_store(store: Arc<dyn ObjectStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// Object key for `hash`.
    pub fn key(&self, hash: &ContentHash) -> String {
        format!("{}{}", self.key_prefix, hash)
    }

    fn object_path(&self, hash: &ContentHash) -> ObjectPath {
        ObjectPath::from(self.key(hash))
    }

    async fn upload(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let packed = gzip(data)?;
        self.store
            .put(&self.object_path(hash), PutPayload::from(packed))
            .await
            .with_context(|| format!("failed to upload object {}", self.key(hash)))?;
        Ok(())
    }
}

#[async_trait]
impl BackendStore for ObjectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStorage
    }

    fn location(&self, hash: &ContentHash) -> String {
        self.key(hash)
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        match self.store.head(&self.object_path(hash)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to stat object {}", self.key(hash))),
        }
    }

    async fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome> {
        if self.exists(hash).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }
        self.upload(hash, data).await?;
        Ok(PutOutcome::Created)
    }

    async fn replace(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.upload(hash, data).await
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let result = match self.store.get(&self.object_path(hash)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to fetch object {}", self.key(hash)))
            }
        };

        let packed = result
            .bytes()
            .await
            .with_context(|| format!("failed to read object body {}", self.key(hash)))?;

        match gunzip(&packed) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                tracing::warn!(key = %self.key(hash), "corrupt object: {e:#}");
                Ok(None)
            }
        }
    }

    async fn delete(&self, hash: &ContentHash) -> Result<bool> {
        if !self.exists(hash).await? {
            return Ok(false);
        }
        self.store
            .delete(&self.object_path(hash))
            .await
            .with_context(|| format!("failed to delete object {}", self.key(hash)))?;
        Ok(true)
    }
}
