//! Process configuration: a `config.toml` (plus an optional
//! `local_settings.toml` overlay) deserialized once into an immutable
//! snapshot, published through a global `OnceCell` for long-running
//! binaries and via [`load_config`] for short-lived CLI tools.

use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{IndexerError, Result};

static GLOBAL_CONFIG: OnceCell<Settings> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding this coin's RocksDB store.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    /// `host:port` of the node's REST/RPC server.
    pub server: String,
    #[serde(default)]
    pub rpcauth: Option<String>,
    pub symbol: String,
    #[serde(default)]
    pub genesis_hash: Option<String>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractLogConfig {
    pub file: String,
    #[serde(default = "default_true")]
    pub append: bool,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub snapshot_memory: bool,
    #[serde(default = "default_snapshot_timer")]
    pub snapshot_timer: u64,
}

fn default_true() -> bool {
    true
}
fn default_level() -> String {
    "INFO".to_string()
}
fn default_snapshot_timer() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SortConfig {
    /// Shell template with three substitutions: source file, line count, destination file.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_sort_memory_mb")]
    pub memory_budget_mb: u64,
}

fn default_sort_memory_mb() -> u64 {
    512
}

fn default_address_skip_cap() -> usize {
    1_000_000
}

fn default_address_tx_guardrail() -> usize {
    15_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coins: HashMap<String, CoinConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sort: SortConfig,
    pub new_block_notification: String,
    pub extract_log: ExtractLogConfig,
    #[serde(default)]
    pub debug: u8,
    #[serde(default = "default_address_skip_cap")]
    pub address_skip_cap: usize,
    #[serde(default = "default_address_tx_guardrail")]
    pub address_tx_guardrail: usize,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

fn default_working_dir() -> String {
    "blockchain_data".to_string()
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            command: None,
            memory_budget_mb: default_sort_memory_mb(),
        }
    }
}

impl Settings {
    pub fn supported_coins(&self) -> Vec<String> {
        self.coins.keys().cloned().collect()
    }

    pub fn coin(&self, name: &str) -> Result<&CoinConfig> {
        self.coins
            .get(name)
            .ok_or_else(|| IndexerError::InvalidArgument(format!("unrecognized coin type: {name}")))
    }

    pub fn db_path(&self, coin: &str) -> Result<String> {
        let cfg = self.coin(coin)?;
        let path = cfg
            .database
            .as_ref()
            .map(|d| d.path.clone())
            .unwrap_or_else(|| self.database.path.replace("{coin}", coin));
        Ok(shellexpand::tilde(&path).into_owned())
    }

    pub fn working_path(&self, coin: &str) -> String {
        format!("{}/{}/", self.working_dir, coin)
    }
}

fn build_settings() -> Result<Settings> {
    let mut builder = config::Config::builder().add_source(config::File::with_name("config.toml"));
    if std::path::Path::new("local_settings.toml").exists() {
        builder = builder.add_source(config::File::with_name("local_settings.toml"));
    }
    builder
        .build()
        .map_err(|e| IndexerError::InvalidData(format!("config error: {e}")))?
        .try_deserialize()
        .map_err(|e| IndexerError::InvalidData(format!("config shape error: {e}")))
}

/// Load config for standalone binaries/utilities that don't need the global cell.
pub fn load_config() -> Result<Settings> {
    build_settings()
}

pub fn init_global_config() -> Result<()> {
    let settings = build_settings()?;
    GLOBAL_CONFIG
        .set(settings)
        .map_err(|_| IndexerError::InvalidData("config already set".to_string()))
}

pub fn get_global_config() -> &'static Settings {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}
