// src/config.rs

//! Manages manager configuration: loading, defaults, and the per-subsystem
//! sections.

use crate::core::backup::BackupConfig;
use crate::core::client::ClientConfig;
use crate::core::healthcheck::HealthcheckConfig;
use crate::core::repair::RepairConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            client: ClientConfig::default(),
            repair: RepairConfig::default(),
            backup: BackupConfig::default(),
            healthcheck: HealthcheckConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        Ok(config)
    }
}
