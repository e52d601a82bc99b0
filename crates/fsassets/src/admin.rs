//! Operator commands: stats, digest inspection, deletion, migration.
//!
//! Every command returns the plain text to show the operator. The same
//! dispatcher serves the `serve` console on stdin and the one-shot CLI
//! subcommands.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use cas::BackendStore;

use crate::migrate::Migrator;
use crate::service::AssetService;

const DUMP_BYTES_PER_LINE: usize = 16;
const DUMP_MAX_LINES: usize = 5;

const HELP: &str = "\
Commands:
  show stats                     total asset count and current read counters
  show digest <id>               metadata, storage location and first bytes of an asset
  delete asset <id>              remove an asset's metadata (stored bytes are kept)
  migrate [--force] [--reverse]  copy all objects to (or, reversed, from) the migration target
  flush                          run one spool writer cycle now
  help                           this text";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    ShowStats,
    ShowDigest(String),
    DeleteAsset(String),
    Migrate { force: bool, reverse: bool },
    Flush,
    Help,
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["show", "stats"] => Ok(AdminCommand::ShowStats),
            ["show", "digest", id] => Ok(AdminCommand::ShowDigest(id.to_string())),
            ["show", "digest"] => bail!("Syntax: show digest <ID>"),
            ["delete", "asset", id] => Ok(AdminCommand::DeleteAsset(id.to_string())),
            ["delete", "asset"] => bail!("Syntax: delete asset <ID>"),
            ["migrate", flags @ ..] => {
                let mut force = false;
                let mut reverse = false;
                for flag in flags {
                    match *flag {
                        "--force" | "-f" => force = true,
                        "--reverse" | "-r" => reverse = true,
                        other => bail!("Unknown migrate option: {other}"),
                    }
                }
                Ok(AdminCommand::Migrate { force, reverse })
            }
            ["flush"] => Ok(AdminCommand::Flush),
            ["help"] | ["?"] => Ok(AdminCommand::Help),
            _ => bail!("Unknown command: {}. Type 'help' for a list.", line.trim()),
        }
    }
}

/// Command handlers over a running service.
pub struct AdminConsole {
    service: Arc<AssetService>,
    migration_target: Option<Arc<dyn BackendStore>>,
}

impl AdminConsole {
    pub fn new(service: Arc<AssetService>) -> Self {
        Self {
            service,
            migration_target: None,
        }
    }

    pub fn with_migration_target(mut self, target: Arc<dyn BackendStore>) -> Self {
        self.migration_target = Some(target);
        self
    }

    /// Parse and run one console line.
    pub async fn execute(&self, line: &str) -> Result<String> {
        match AdminCommand::parse(line)? {
            AdminCommand::ShowStats => self.show_stats().await,
            AdminCommand::ShowDigest(id) => self.show_digest(&id).await,
            AdminCommand::DeleteAsset(id) => self.delete_asset(&id).await,
            AdminCommand::Migrate { force, reverse } => self.migrate(force, reverse).await,
            AdminCommand::Flush => Ok(self.flush().await),
            AdminCommand::Help => Ok(HELP.to_string()),
        }
    }

    pub async fn show_stats(&self) -> Result<String> {
        let total = self.service.metadata().count().await?;
        let counters = self.service.stats().snapshot();

        let mut out = format!("Total asset count: {total}\n");
        let _ = write!(
            out,
            "Reads: {}, avg {:.2} ms, missing metadata: {}, missing in backend: {}",
            counters.reads,
            counters.average().as_secs_f64() * 1000.0,
            counters.missing_metadata,
            counters.missing_backend
        );
        Ok(out)
    }

    pub async fn show_digest(&self, id: &str) -> Result<String> {
        let Some(record) = self.service.get_metadata(id).await? else {
            return Ok("Asset not found".to_string());
        };
        let data = self.service.get_data(id).await?.unwrap_or_default();
        let d = &record.descriptor;

        let mut out = String::new();
        let _ = writeln!(out, "Name: {}", d.name);
        let _ = writeln!(out, "Description: {}", d.description);
        let _ = writeln!(out, "Type: {}", d.asset_type.code());
        let _ = writeln!(out, "Content-type: {}", d.content_type);
        let _ = writeln!(out, "Flags: {}", d.flags);
        let _ = writeln!(out, "FS file: {}", self.service.backend().location(&record.hash));
        out.push_str(&hex_dump(&data));
        Ok(out.trim_end().to_string())
    }

    pub async fn delete_asset(&self, id: &str) -> Result<String> {
        if self.service.get_metadata(id).await?.is_none() {
            return Ok("Asset not found".to_string());
        }
        self.service.delete(id).await?;
        Ok("Asset deleted".to_string())
    }

    /// Copy every object to the migration target, or from it with `reverse`.
    pub async fn migrate(&self, force: bool, reverse: bool) -> Result<String> {
        let Some(target) = &self.migration_target else {
            bail!("No migration target configured");
        };

        let primary = self.service.backend().clone();
        let (source, destination) = if reverse {
            (target.clone(), primary)
        } else {
            // Staged bytes are not in the primary backend yet.
            self.service.flush_spool().await;
            (primary, target.clone())
        };

        let kind = destination.kind();
        let migrator = Migrator::new(self.service.metadata().clone(), source, destination);
        let report = migrator.run(force).await;
        Ok(format!("Migration to {kind} completed. {report}"))
    }

    pub async fn flush(&self) -> String {
        let report = self.service.flush_spool().await;
        format!(
            "Flushed {} files (written {}, already present {}, failed {})",
            report.total(),
            report.written,
            report.already_present,
            report.failed
        )
    }
}

/// Hex dump of up to the first 80 bytes, 16 per line: `0010: 3C-3F-78-...`.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data
        .chunks(DUMP_BYTES_PER_LINE)
        .take(DUMP_MAX_LINES)
        .enumerate()
    {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        let _ = writeln!(
            out,
            "{:04x}: {}",
            line * DUMP_BYTES_PER_LINE,
            bytes.join("-")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, AssetType};
    use crate::metadata::MemoryMetadataStore;
    use cas::{ContentHash, ObjectBackend, ShardedFileStore};
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn console(temp: &TempDir) -> Result<(AdminConsole, Arc<ObjectBackend>)> {
        let backend = Arc::new(ShardedFileStore::at_path(temp.path().join("data"))?);
        let service = AssetService::builder(
            Arc::new(MemoryMetadataStore::new()),
            backend,
            temp.path().join("spool"),
        )
        .build()?;
        let bucket = Arc::new(ObjectBackend::with_store(Arc::new(InMemory::new()), "assets/"));
        let console = AdminConsole::new(Arc::new(service)).with_migration_target(bucket.clone());
        Ok((console, bucket))
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(AdminCommand::parse("show stats").unwrap(), AdminCommand::ShowStats);
        assert_eq!(
            AdminCommand::parse("  show   digest  abc ").unwrap(),
            AdminCommand::ShowDigest("abc".to_string())
        );
        assert_eq!(
            AdminCommand::parse("migrate --reverse --force").unwrap(),
            AdminCommand::Migrate {
                force: true,
                reverse: true
            }
        );
        assert!(AdminCommand::parse("show digest").is_err());
        assert!(AdminCommand::parse("migrate --sideways").is_err());
        assert!(AdminCommand::parse("reboot").is_err());
    }

    #[test]
    fn test_hex_dump_format() {
        let dump = hex_dump(b"<?xml");
        assert_eq!(dump, "0000: 3C-3F-78-6D-6C\n");

        let long = vec![0xABu8; 200];
        let dump = hex_dump(&long);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].starts_with("0010: AB-AB"));
        assert!(lines[4].starts_with("0040: "));
        assert_eq!(lines[0].split('-').count(), 16);
    }

    #[tokio::test]
    async fn test_show_digest_and_delete() -> Result<()> {
        let temp = TempDir::new()?;
        let (console, _) = console(&temp)?;
        assert_eq!(console.execute("show digest nope").await?, "Asset not found");

        console
            .service
            .store(
                Asset::new("n1", AssetType::Notecard, b"HELLO".to_vec())
                    .with_name("note")
                    .with_description("a note")
                    .with_flags(4),
            )
            .await?;

        let digest = console.show_digest("n1").await?;
        assert!(digest.contains("Name: note"));
        assert!(digest.contains("Description: a note"));
        assert!(digest.contains("Type: 7"));
        assert!(digest.contains("Content-type: application/vnd.ll.notecard"));
        assert!(digest.contains("Flags: 4"));
        assert!(digest.contains(&format!("FS file: {}", temp.path().join("data").display())));
        assert!(digest.ends_with("0000: 48-45-4C-4C-4F"));

        assert_eq!(console.execute("delete asset n1").await?, "Asset deleted");
        assert_eq!(console.execute("delete asset n1").await?, "Asset not found");

        Ok(())
    }

    #[tokio::test]
    async fn test_show_stats_counts_assets() -> Result<()> {
        let temp = TempDir::new()?;
        let (console, _) = console(&temp)?;
        console
            .service
            .store(Asset::new("a", AssetType::Texture, b"1".to_vec()))
            .await?;
        console
            .service
            .store(Asset::new("b", AssetType::Texture, b"2".to_vec()))
            .await?;
        console.service.get("missing").await?;

        let stats = console.execute("show stats").await?;
        assert!(stats.starts_with("Total asset count: 2"));
        assert!(stats.contains("missing metadata: 1"));

        Ok(())
    }

    #[tokio::test]
    async fn test_migrate_flushes_spool_first() -> Result<()> {
        let temp = TempDir::new()?;
        let (console, bucket) = console(&temp)?;
        console
            .service
            .store(Asset::new("a", AssetType::Texture, b"staged".to_vec()))
            .await?;

        let out = console.execute("migrate").await?;
        assert_eq!(
            out,
            "Migration to object storage completed. Migrated: 1, Skipped: 0, Failed: 0"
        );
        assert!(bucket.exists(&ContentHash::from_data(b"staged")).await?);

        let out = console.execute("migrate --reverse").await?;
        assert_eq!(
            out,
            "Migration to filesystem completed. Migrated: 0, Skipped: 1, Failed: 0"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_migrate_without_target() -> Result<()> {
        let temp = TempDir::new()?;
        let backend = Arc::new(ShardedFileStore::at_path(temp.path().join("data"))?);
        let service = AssetService::builder(
            Arc::new(MemoryMetadataStore::new()),
            backend,
            temp.path().join("spool"),
        )
        .build()?;
        let console = AdminConsole::new(Arc::new(service));
        assert!(console.execute("migrate").await.is_err());
        assert_eq!(
            console.execute("flush").await?,
            "Flushed 0 files (written 0, already present 0, failed 0)"
        );
        Ok(())
    }
}
