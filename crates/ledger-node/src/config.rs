//! Node configuration.
//!
//! [`NodeConfig`] has sensible defaults and can be layered from a TOML file
//! and `LEDGER_*` environment variables with [`NodeConfig::load`]. CLI flags
//! are applied on top by the binary.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Configuration for a block store node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "ledger_core=trace").
    pub log_level: String,
    /// Log output format, "text" or "json".
    pub log_format: String,
    /// Connect the default genesis block when the store is empty.
    pub seed_genesis: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ledger");

        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            seed_genesis: true,
        }
    }
}

impl NodeConfig {
    /// Defaults, then the optional file, then `LEDGER_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().into_owned())?
            .set_default("log_level", defaults.log_level)?
            .set_default("log_format", defaults.log_format)?
            .set_default("seed_genesis", defaults.seed_genesis)?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("LEDGER"))
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }
}
