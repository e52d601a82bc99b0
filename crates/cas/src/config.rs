//! Backend configuration and the backend factory.
//!
//! Backends are a closed set selected by the `kind` tag:
//!
//! ```toml
//! [backend]
//! kind = "filesystem"
//! base_path = "/srv/assets/data"
//! layout = "standard"
//! ```
//!
//! ```toml
//! [backend]
//! kind = "object_storage"
//! bucket = "assets"
//! region = "us-east-1"
//! endpoint = "http://127.0.0.1:9000"
//! allow_http = true
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::file::ShardedFileStore;
use crate::layout::ShardLayout;
use crate::object::ObjectBackend;
use crate::store::{BackendKind, BackendStore};

/// Configuration for the sharded filesystem backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Root of the sharded object tree.
    pub base_path: PathBuf,

    /// Directory sharding scheme.
    #[serde(default)]
    pub layout: ShardLayout,
}

impl FileBackendConfig {
    /// Create a config with a specific base path and the standard layout.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            layout: ShardLayout::default(),
        }
    }

    /// Builder: set the shard layout.
    pub fn with_layout(mut self, layout: ShardLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Configuration for an S3-compatible object storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBackendConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Prepended to every object key, e.g. `"assets/"`.
    #[serde(default)]
    pub key_prefix: String,

    /// Permit plain-http endpoints.
    #[serde(default)]
    pub allow_http: bool,

    /// Per-request timeout enforced by the client.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl ObjectBackendConfig {
    /// Create a config for a bucket with all other settings at their defaults.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: default_region(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            key_prefix: String::new(),
            allow_http: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Any supported backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Filesystem(FileBackendConfig),
    ObjectStorage(ObjectBackendConfig),
}

impl BackendConfig {
    /// Which kind of backend this config builds.
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Filesystem(_) => BackendKind::Filesystem,
            BackendConfig::ObjectStorage(_) => BackendKind::ObjectStorage,
        }
    }

    /// Check required settings without touching the backend.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Filesystem(fs) => {
                if fs.base_path.as_os_str().is_empty() {
                    bail!("filesystem backend requires base_path");
                }
            }
            BackendConfig::ObjectStorage(s3) => {
                if s3.bucket.trim().is_empty() {
                    bail!("object storage backend requires bucket");
                }
            }
        }
        Ok(())
    }

    /// Build the backend described by this config.
    pub fn open(&self) -> Result<Arc<dyn BackendStore>> {
        self.validate()?;
        Ok(match self {
            BackendConfig::Filesystem(fs) => Arc::new(ShardedFileStore::new(fs.clone())?),
            BackendConfig::ObjectStorage(s3) => Arc::new(ObjectBackend::from_config(s3)?),
        })
    }
}
