// Daemon configuration loading

use crate::rate::Rates;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ratelimitd/config.json";
const DEFAULT_SOCKET_PATH: &str = "/var/run/ratelimitd.sock";

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix socket the request interface listens on
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Named default rate profiles, by profile name
    #[serde(default)]
    pub defaults: BTreeMap<String, Rates>,
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            defaults: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from disk, falling back to defaults if the file
    /// does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;

        log::info!(
            "Loaded configuration from {:?} ({} default profile(s))",
            path,
            config.defaults.len()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some((name, _)) = self.defaults.iter().find(|(_, rates)| rates.is_empty()) {
            return Err(anyhow!("Default profile {:?} has no rate", name));
        }
        Ok(())
    }
}
