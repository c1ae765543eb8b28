use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::RuntimeResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound for a background enable/disable call, in milliseconds.
    pub transport_timeout_ms: u64,
    /// File holding the in-page runtime injected ahead of the scripts.
    pub bootstrap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub values_directory: String,
    pub resources_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transport_timeout_ms: 10_000,
            bootstrap: None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            directory: data_path("scripts"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            values_directory: data_path("values"),
            resources_directory: data_path("resources"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

fn data_path(leaf: &str) -> String {
    dirs::data_dir()
        .map(|d| d.join("userscript-runtime").join(leaf).display().to_string())
        .unwrap_or_else(|| format!("~/.userscript-runtime/{}", leaf))
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("userscript-runtime")
            .join("config.toml")
    }

    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Self {
        Self::load_or_default(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Using default config");
                Self::default()
            }
        }
    }

    /// Load and validate config from `path`.
    pub fn load_from(path: &Path) -> RuntimeResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate();
        Ok(config)
    }

    /// Clamp values to acceptable ranges
    fn validate(&mut self) {
        self.runtime.transport_timeout_ms = self.runtime.transport_timeout_ms.clamp(100, 120_000);
        if self.logging.filter.trim().is_empty() {
            self.logging.filter = LoggingConfig::default().filter;
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> RuntimeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.transport_timeout_ms)
    }

    pub fn catalog_dir(&self) -> PathBuf {
        expand_path(&self.catalog.directory)
    }

    pub fn values_dir(&self) -> PathBuf {
        expand_path(&self.storage.values_directory)
    }

    pub fn resources_dir(&self) -> PathBuf {
        expand_path(&self.storage.resources_directory)
    }

    /// Source of the in-page runtime; empty when none is configured.
    pub fn bootstrap_source(&self) -> RuntimeResult<String> {
        match &self.runtime.bootstrap {
            Some(path) => Ok(fs::read_to_string(expand_path(path))?),
            None => Ok(String::new()),
        }
    }
}
