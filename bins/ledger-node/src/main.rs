//! Ledger block store node binary.
//!
//! Opens the RocksDB block store, optionally imports a file of blocks,
//! logs every reorganization, and runs until Ctrl+C.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ledger_core::error::ChainError;
use ledger_core::traits::Blockchain;
use ledger_core::types::Block;
use ledger_node_lib::{ChainService, NodeConfig, RocksStore};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ledger-node", version, about = "Block store node with RocksDB storage")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for chain storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    /// Store blocks from a JSON-lines file before serving
    #[arg(long)]
    import: Option<PathBuf>,

    /// Append imported blocks without linkage checks or fork choice
    #[arg(long, requires = "import")]
    trusted: bool,

    /// Rebuild all derived indexes from the canonical chain on startup
    #[arg(long)]
    reindex: bool,

    /// Compact the database on startup
    #[arg(long)]
    compact: bool,

    /// Exit after startup tasks instead of waiting for Ctrl+C
    #[arg(long)]
    oneshot: bool,
}

impl Args {
    /// Layer CLI flags over the file and environment configuration.
    fn config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("loading configuration")?;
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    init_logging(&config.log_level, &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "ledger node starting");
    info!(data_dir = ?config.data_dir, "configuration loaded");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data_dir {}", config.data_dir.display()))?;

    let service = ChainService::open(&config).context("opening chain store")?;
    if !service.start().await {
        anyhow::bail!("chain service failed to start");
    }

    if let Ok(height) = service.fetch_last_height().await {
        info!(height, "chain tip");
    }

    if args.reindex {
        let blocks = service.rebuild_indexes().await?;
        info!(blocks, "indexes rebuilt");
    }

    if let Some(path) = &args.import {
        import_file(&service, path, args.trusted).await?;
    }

    if args.compact {
        service.compact().await?;
        info!("database compacted");
    }

    if !args.oneshot {
        tokio::spawn(watch_reorganizations(service.clone()));
        info!("ledger node running (Ctrl+C to stop)");
        tokio::signal::ctrl_c().await.context("installing Ctrl+C handler")?;
        info!("shutdown signal received");
    }

    service.stop().await;
    info!("ledger node shutdown complete");
    Ok(())
}

/// Feed each line of `path` (one JSON block per line) to the service.
async fn import_file(service: &ChainService<RocksStore>, path: &Path, trusted: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut stored = 0u64;
    let mut skipped = 0u64;

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let block: Block =
            serde_json::from_str(&line).with_context(|| format!("{}:{}: invalid block", path.display(), number + 1))?;
        let hash = block.hash();

        let result = if trusted {
            service.import(block).await
        } else {
            service.store(block).await.map(|_| ())
        };
        match result {
            Ok(()) => stored += 1,
            Err(ChainError::DuplicateBlock(_)) | Err(ChainError::InvalidLinkage { .. }) => {
                warn!(%hash, line = number + 1, "block skipped");
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(stored, skipped, file = %path.display(), "import finished");
    Ok(())
}

/// Log every reorganization until the service stops.
async fn watch_reorganizations(service: ChainService<RocksStore>) {
    loop {
        match service.subscribe().await {
            Ok(Ok(event)) => info!(
                fork_height = event.fork_height,
                fork_hash = %event.fork_hash,
                added = event.added.len(),
                removed = event.removed.len(),
                "chain reorganized"
            ),
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` selects structured JSON output; anything else is
/// human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
