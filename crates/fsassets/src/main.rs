//! fsassets - write-behind asset service and operator CLI
//!
//! Subcommands:
//! - `fsassets serve` - Run the writer and stats loops with an admin console on stdin
//! - `fsassets store <id>` - Store an asset from a file or stdin
//! - `fsassets get <id>` - Fetch an asset
//! - `fsassets migrate` - Copy all objects to the migration target

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fsassets::{telemetry, AdminConsole, Asset, AssetService, AssetType, ServiceConfig, ZERO_ID};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fsassets")]
#[command(about = "Write-behind, content-addressed asset service")]
#[command(version)]
struct Cli {
    /// Config file (default: discover fsassets.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run background loops and read admin commands from stdin
    Serve,

    /// Store an asset
    Store {
        /// Asset id (empty assigns a new UUID)
        #[arg(default_value = "")]
        id: String,

        /// Numeric asset type (0 texture, 6 object, 7 notecard, ...)
        #[arg(short = 't', long = "type", default_value = "0", allow_negative_numbers = true)]
        asset_type: i8,

        #[arg(short, long, default_value = "")]
        name: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Read data from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Fetch an asset and print its metadata
    Get {
        id: String,

        /// Write the asset bytes here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check which ids exist
    Exists {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete an asset's metadata
    Delete { id: String },

    /// Show metadata, location and leading bytes of an asset
    ShowDigest { id: String },

    /// Show asset count and read counters
    ShowStats,

    /// Move staged files into the backend now
    Flush,

    /// Copy all objects to the migration target
    Migrate {
        /// Overwrite objects already at the destination
        #[arg(short, long)]
        force: bool,

        /// Copy from the migration target back into the primary backend
        #[arg(short, long)]
        reverse: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServiceConfig::load_from(cli.config.as_deref())?;
    telemetry::init(&config.telemetry)?;

    let service = Arc::new(AssetService::from_config(&config).await?);
    let mut console = AdminConsole::new(service.clone());
    if let Some(target) = &config.migration_target {
        console = console.with_migration_target(target.open()?);
    }

    match cli.command {
        Commands::Serve => serve(service, console).await?,
        Commands::Store {
            id,
            asset_type,
            name,
            description,
            file,
        } => {
            let data = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            let asset = Asset::new(id, AssetType::from(asset_type), data)
                .with_name(name)
                .with_description(description);
            let stored = service.store(asset).await?;
            if stored == ZERO_ID {
                anyhow::bail!("asset was not recorded");
            }
            if service.is_leader() {
                service.flush_spool().await;
            }
            println!("{stored}");
        }
        Commands::Get { id, output } => match service.get(&id).await? {
            Some(asset) => {
                println!("{}", serde_json::to_string_pretty(&asset)?);
                if let Some(path) = output {
                    tokio::fs::write(&path, &asset.data)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
            }
            None => println!("Asset not found"),
        },
        Commands::Exists { ids } => {
            let found = service.exists(&ids).await?;
            for (id, present) in ids.iter().zip(found) {
                println!("{id}: {present}");
            }
        }
        Commands::Delete { id } => println!("{}", console.delete_asset(&id).await?),
        Commands::ShowDigest { id } => println!("{}", console.show_digest(&id).await?),
        Commands::ShowStats => println!("{}", console.show_stats().await?),
        Commands::Flush => println!("{}", console.flush().await),
        Commands::Migrate { force, reverse } => {
            println!("{}", console.migrate(force, reverse).await?)
        }
    }

    Ok(())
}

/// Run until stdin closes or Ctrl-C, then stop the loops and flush once more.
async fn serve(service: Arc<AssetService>, console: AdminConsole) -> Result<()> {
    let cancel = CancellationToken::new();
    let handles = service.start_background(cancel.clone());
    info!("fsassets serving, type 'help' for admin commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            _ => match console.execute(line).await {
                Ok(out) => println!("{out}"),
                Err(e) => eprintln!("{e:#}"),
            },
        }
    }

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("background task ended abnormally: {e}");
        }
    }
    if service.is_leader() {
        let report = service.flush_spool().await;
        info!(written = report.written, failed = report.failed, "final spool flush");
    }
    Ok(())
}
