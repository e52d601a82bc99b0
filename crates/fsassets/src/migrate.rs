//! Bulk copy of every referenced object from one backend to another.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use cas::{BackendStore, ContentHash, PutOutcome};
use futures::StreamExt;
use tracing::{info, warn};

use crate::metadata::MetadataStore;

const PROGRESS_EVERY: usize = 1000;

/// Counts from one migration run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.migrated + self.skipped + self.failed
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migrated: {}, Skipped: {}, Failed: {}",
            self.migrated, self.skipped, self.failed
        )
    }
}

enum Copied {
    Migrated,
    Skipped,
}

/// Copies the objects behind every metadata record from `source` to
/// `destination`.
pub struct Migrator {
    metadata: Arc<dyn MetadataStore>,
    source: Arc<dyn BackendStore>,
    destination: Arc<dyn BackendStore>,
}

impl Migrator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        source: Arc<dyn BackendStore>,
        destination: Arc<dyn BackendStore>,
    ) -> Self {
        Self {
            metadata,
            source,
            destination,
        }
    }

    /// Migrate everything.
    ///
    /// Without `force`, objects already at the destination are skipped. With
    /// `force`, they are overwritten. A failure on one object is counted and
    /// the run continues.
    pub async fn run(&self, force: bool) -> MigrationReport {
        let mut report = MigrationReport::default();
        let mut seen: HashSet<ContentHash> = HashSet::new();
        let started = Instant::now();

        info!(
            from = %self.source.kind(),
            to = %self.destination.kind(),
            force,
            "migration started"
        );

        let mut records = self.metadata.enumerate_all();
        while let Some(item) = records.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!("unreadable metadata record: {e:#}");
                    report.failed += 1;
                    continue;
                }
            };

            // Many ids can share one object.
            if !seen.insert(record.hash.clone()) {
                report.skipped += 1;
                continue;
            }

            match self.copy(&record.hash, force).await {
                Ok(Copied::Migrated) => report.migrated += 1,
                Ok(Copied::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(asset = %record.id, hash = %record.hash, "migration failed: {e:#}");
                    report.failed += 1;
                }
            }

            if report.total() % PROGRESS_EVERY == 0 {
                info!(processed = report.total(), %report, "migration progress");
            }
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            %report,
            "migration finished"
        );
        report
    }

    async fn copy(&self, hash: &ContentHash, force: bool) -> Result<Copied> {
        if !force {
            match self.destination.exists(hash).await {
                Ok(true) => return Ok(Copied::Skipped),
                Ok(false) => {}
                Err(e) => warn!(%hash, "destination check failed, copying anyway: {e:#}"),
            }
        }

        let data = self
            .source
            .get(hash)
            .await?
            .with_context(|| format!("not found at {}", self.source.location(hash)))?;

        if force {
            self.destination.replace(hash, &data).await?;
            return Ok(Copied::Migrated);
        }
        match self.destination.put(hash, &data).await? {
            PutOutcome::Created => Ok(Copied::Migrated),
            PutOutcome::AlreadyPresent => Ok(Copied::Skipped),
        }
    }
}
