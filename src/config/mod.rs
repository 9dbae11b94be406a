//! Configuration for plughost
//!
//! The configuration lives in `~/.plughost/config.json`. Every field has a
//! default, so a missing file or a partial file is valid. Environment
//! variables are applied on top of the file:
//!
//! | Variable                | Field                       |
//! |-------------------------|-----------------------------|
//! | `PLUGHOST_PLUGIN_DIRS`  | appended to `plugins.plugin_dirs` (comma-separated) |
//! | `PLUGHOST_TESTING`      | `plugins.testing`           |
//! | `PLUGHOST_TESTING_SETUP`| `plugins.testing_setup`     |
//! | `PLUGHOST_RETRY`        | `plugins.retry_attempts`    |
//! | `PLUGHOST_PLUGIN_FILE`  | `plugins.plugin_file`       |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

/// Default number of construction-failure retries per load cycle.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery and loading behaviour.
    pub plugins: PluginSettings,
    /// Host feature flags gating the schedule, app and urls activators.
    pub features: FeatureFlags,
}

/// Plugin discovery and loading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// User plugin roots, scanned in order after built-ins and samples.
    pub plugin_dirs: Vec<String>,
    /// Load the bundled sample plugins.
    pub samples: bool,
    /// Test mode: instantiate every candidate regardless of its record.
    pub testing: bool,
    /// In test mode, still consult installed packages during discovery.
    pub testing_setup: bool,
    /// Construction-failure retries per load cycle.
    pub retry_attempts: u32,
    /// Installed package index. Defaults to `~/.plughost/packages.json`.
    pub package_index: Option<String>,
    /// Plugin requirements file handed to the install command.
    /// Defaults to `~/.plughost/plugins.txt`.
    pub plugin_file: Option<String>,
    /// Installer command; the plugin file path is appended as last argument.
    /// Empty disables `install_plugin_file`.
    pub install_command: Vec<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            plugin_dirs: default_plugin_dirs(),
            samples: false,
            testing: false,
            testing_setup: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            package_index: None,
            plugin_file: None,
            install_command: Vec::new(),
        }
    }
}

impl PluginSettings {
    /// Whether installed packages are consulted during discovery.
    pub fn package_discovery_enabled(&self) -> bool {
        !self.testing || self.testing_setup
    }

    /// Resolved package index path.
    pub fn package_index_path(&self) -> PathBuf {
        self.package_index
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| Config::dir().join("packages.json"))
    }

    /// Resolved plugin requirements file path.
    pub fn plugin_file_path(&self) -> PathBuf {
        self.plugin_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| Config::dir().join("plugins.txt"))
    }
}

/// Host-wide switches for the optional activators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Register plugin-declared scheduled tasks.
    pub schedule: bool,
    /// Mount plugin app modules into the host.
    pub app: bool,
    /// Mount plugin routes under the `plugin` slot.
    pub urls: bool,
}

fn default_plugin_dirs() -> Vec<String> {
    vec!["~/.plughost/plugins".to_string()]
}

impl Config {
    /// Base directory for plughost state (`~/.plughost`).
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".plughost")
    }

    /// Default config file path.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load config from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from a file. A missing or empty file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HostError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&content).map_err(|e| {
            HostError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply overrides from an environment lookup function.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dirs) = lookup("PLUGHOST_PLUGIN_DIRS") {
            self.plugins.plugin_dirs.extend(
                dirs.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
            );
        }
        if let Some(v) = lookup("PLUGHOST_TESTING") {
            self.plugins.testing = parse_bool(&v);
        }
        if let Some(v) = lookup("PLUGHOST_TESTING_SETUP") {
            self.plugins.testing_setup = parse_bool(&v);
        }
        if let Some(v) = lookup("PLUGHOST_RETRY") {
            if let Ok(n) = v.trim().parse() {
                self.plugins.retry_attempts = n;
            }
        }
        if let Some(v) = lookup("PLUGHOST_PLUGIN_FILE") {
            self.plugins.plugin_file = Some(v);
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
