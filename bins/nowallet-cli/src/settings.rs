//! Layered CLI settings: config file, then `NOWALLET_*` environment
//! variables. Command-line flags are applied on top by `main`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bitcoin::Network;
use serde::Deserialize;

const ENV_PREFIX: &str = "NOWALLET";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// "mainnet" or "testnet".
    pub network: String,
    /// Candidate servers as `host` or `host:port`.
    pub servers: Vec<String>,
    pub account: u32,
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: "testnet".to_string(),
            servers: Vec::new(),
            account: 0,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load from `path` (or the default location) and the process
    /// environment. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path(),
        };
        Self::load_from(&path, None)
    }

    /// Load from `path`, reading environment overrides from `env` instead of
    /// the process environment when given.
    pub fn load_from(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("servers")
            .source(env);

        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to read settings from {}", path.display()))?
            .try_deserialize()
            .context("Invalid settings")
    }

    pub fn network(&self) -> Result<Network> {
        match self.network.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            other => bail!("Invalid network '{other}' (must be 'mainnet' or 'testnet')"),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `<config_dir>/nowallet/nowallet.toml`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nowallet")
        .join("nowallet.toml")
}
