//! BackendStore: durable, content-keyed blob storage.
//!
//! Every implementation stores objects under a location derived solely from
//! the content hash. Objects are write-once: `put` never rewrites an existing
//! object, so concurrent writers of the same content cannot conflict and no
//! locking is required.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Which kind of backend an implementation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Filesystem,
    ObjectStorage,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Filesystem => write!(f, "filesystem"),
            BackendKind::ObjectStorage => write!(f, "object storage"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fs" | "filesystem" => Ok(BackendKind::Filesystem),
            "s3" | "object_storage" | "object-storage" => Ok(BackendKind::ObjectStorage),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// What a `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The object was written by this call.
    Created,
    /// An object already existed at the location; nothing was written.
    AlreadyPresent,
}

/// Trait for content storage backends.
///
/// "Not found" is never an error: `exists` returns `false`, `get` returns
/// `Ok(None)` and `delete` returns `Ok(false)`. Errors are reserved for
/// transport, permission and I/O failures.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Human-readable location of the object for `hash` (path or key).
    fn location(&self, hash: &ContentHash) -> String;

    /// Check whether a durable object exists for `hash`.
    async fn exists(&self, hash: &ContentHash) -> Result<bool>;

    /// Store `data` under `hash` unless an object is already there.
    ///
    /// The object is fully durable and visible only once this returns; readers
    /// never observe a partial object.
    async fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<PutOutcome>;

    /// Store `data` under `hash`, overwriting any existing object.
    ///
    /// Only used by forced migrations to repair damaged objects.
    async fn replace(&self, hash: &ContentHash, data: &[u8]) -> Result<()>;

    /// Retrieve the (decompressed) object for `hash`.
    async fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>>;

    /// Remove the object for `hash`. Returns whether anything was removed.
    ///
    /// Backends do not reference-count; callers must know no metadata record
    /// still points at the hash.
    async fn delete(&self, hash: &ContentHash) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("fs".parse::<BackendKind>(), Ok(BackendKind::Filesystem));
        assert_eq!("S3".parse::<BackendKind>(), Ok(BackendKind::ObjectStorage));
        assert_eq!(
            "object_storage".parse::<BackendKind>(),
            Ok(BackendKind::ObjectStorage)
        );
        assert!("tape".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::ObjectStorage).unwrap();
        assert_eq!(json, "\"object_storage\"");
    }
}
