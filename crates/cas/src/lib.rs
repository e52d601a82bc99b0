//! Content-addressed backend storage for the fsassets asset service.
//!
//! Asset bytes are keyed by their SHA-256 digest. Two backends implement the
//! same [`BackendStore`] contract:
//! - **[`ShardedFileStore`]**: gzip files in a sharded directory tree
//! - **[`ObjectBackend`]**: gzip objects in an S3-compatible bucket
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cas::{BackendConfig, ContentHash, FileBackendConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BackendConfig::Filesystem(FileBackendConfig::with_base_path("/srv/assets"));
//! let backend = config.open()?;
//!
//! let data = b"Hello, World!";
//! let hash = ContentHash::from_data(data);
//! backend.put(&hash, data).await?;
//!
//! if let Some(bytes) = backend.get(&hash).await? {
//!     println!("Got {} bytes from {}", bytes.len(), backend.location(&hash));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Shared Storage
//!
//! Objects are write-once and named by content, so several processes may
//! write into the same tree or bucket without coordination.

pub mod compress;
pub mod config;
pub mod file;
pub mod hash;
pub mod layout;
pub mod object;
pub mod store;

// Re-exports for convenience
pub use config::{BackendConfig, FileBackendConfig, ObjectBackendConfig};
pub use file::{ensure_dir, ShardedFileStore};
pub use hash::{ContentHash, HashError};
pub use layout::ShardLayout;
pub use object::ObjectBackend;
pub use store::{BackendKind, BackendStore, PutOutcome};
