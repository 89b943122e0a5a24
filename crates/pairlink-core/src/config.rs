//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the device name reported to the web application, the HTTP
//! request timeout, and the keychain service name credentials are stored under.
//!
//! Configuration is stored at `~/.config/pairlink/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::DEFAULT_REQUEST_TIMEOUT_SECS;

/// Application name used for config directory paths
const APP_NAME: &str = "pairlink";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_DEVICE_NAME: &str = "PairLink Mobile App";
pub const DEFAULT_KEYRING_SERVICE: &str = "pairlink";

/// Environment variables that override file settings
pub const DEVICE_NAME_ENV: &str = "PAIRLINK_DEVICE_NAME";
pub const KEYRING_SERVICE_ENV: &str = "PAIRLINK_KEYRING_SERVICE";
pub const REQUEST_TIMEOUT_ENV: &str = "PAIRLINK_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    pub device_name: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub keyring_service: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from the process environment
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup. Empty values are ignored, as
    /// are timeouts that do not parse.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(name) = var(DEVICE_NAME_ENV) {
            self.device_name = Some(name);
        }
        if let Some(service) = var(KEYRING_SERVICE_ENV) {
            self.keyring_service = Some(service);
        }
        if let Some(secs) = var(REQUEST_TIMEOUT_ENV).and_then(|v| v.trim().parse().ok()) {
            self.request_timeout_secs = Some(secs);
        }
        self
    }

    pub fn device_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(DEFAULT_DEVICE_NAME)
    }

    pub fn keyring_service(&self) -> &str {
        self.keyring_service
            .as_deref()
            .unwrap_or(DEFAULT_KEYRING_SERVICE)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }
}
