//! Mapping from a content hash to its sharded location on disk.
//!
//! Two layouts are supported:
//!
//! ```text
//! standard:  3733CD977F...  ->  37/33/CD/977F/3733CD977F...
//! grid:      3733CD977F...  ->  373/3CD/3733CD977F...
//! ```
//!
//! The grid layout exists because some large grids already have millions of
//! assets laid out that way. Both are stable: a hash always maps to the same
//! path, and the path never depends on the asset's logical id.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Directory sharding scheme for the filesystem backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardLayout {
    /// Four levels: 2, 2, 2 and 4 hex chars.
    #[default]
    Standard,
    /// Two levels of 3 hex chars.
    Grid,
}

impl ShardLayout {
    /// Character ranges of the hash used for each directory level.
    fn segments(&self) -> &'static [(usize, usize)] {
        match self {
            ShardLayout::Standard => &[(0, 2), (2, 4), (4, 6), (6, 10)],
            ShardLayout::Grid => &[(0, 3), (3, 6)],
        }
    }

    /// Number of directory levels below the base path.
    pub fn depth(&self) -> usize {
        self.segments().len()
    }

    /// Directory (relative to the backend base) holding the object for `hash`.
    pub fn shard_dir(&self, hash: &ContentHash) -> PathBuf {
        let s = hash.as_str();
        self.segments()
            .iter()
            .map(|&(start, end)| &s[start..end])
            .collect()
    }

    /// Full relative path of the object, without any backend suffix.
    pub fn relative_path(&self, hash: &ContentHash) -> PathBuf {
        self.shard_dir(hash).join(hash.as_str())
    }
}

impl fmt::Display for ShardLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardLayout::Standard => write!(f, "standard"),
            ShardLayout::Grid => write!(f, "grid"),
        }
    }
}

impl FromStr for ShardLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(ShardLayout::Standard),
            "grid" | "osgrid" => Ok(ShardLayout::Grid),
            other => Err(format!("unknown shard layout: {other}")),
        }
    }
}
