//! fsassets: a write-behind, content-addressed asset service.
//!
//! Assets are stored once per distinct content. Many logical ids may point at
//! the same bytes through their metadata records.
//!
//! - **Writes** stage bytes in a local spool and return immediately. A
//!   background writer moves staged files into the configured backend.
//! - **Reads** try the cache, then metadata plus spool or backend, then an
//!   optional fallback asset server. Fallback hits are stored locally.
//! - **Backends** are the sharded filesystem tree and the object-storage
//!   bucket from the `cas` crate.
//!
//! ```rust,no_run
//! use fsassets::{Asset, AssetService, AssetType, ServiceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::load()?;
//! let service = AssetService::from_config(&config).await?;
//!
//! let id = service
//!     .store(Asset::new("", AssetType::Notecard, b"hello".to_vec()).with_name("greeting"))
//!     .await?;
//! let asset = service.get(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod asset;
pub mod cache;
pub mod config;
pub mod fallback;
pub mod metadata;
pub mod migrate;
pub mod service;
pub mod spool;
pub mod stats;
pub mod telemetry;

pub use admin::{AdminCommand, AdminConsole};
pub use asset::{Asset, AssetDescriptor, AssetType, ZERO_ID};
pub use cache::{open_cache, AssetCache, CachedAsset, MemoryCache, RedisCache};
pub use config::{ConfigError, ServiceConfig};
pub use fallback::{FallbackAssetSource, HttpFallback};
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataRecord, MetadataStore};
pub use migrate::{MigrationReport, Migrator};
pub use service::{AssetService, AssetServiceBuilder, ServiceOptions};
pub use spool::{FlushReport, Spool, SpoolWriter};
pub use stats::{ReadCounters, ReadStats};
