use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_refresh_interval_min_secs")]
    pub refresh_interval_min_secs: u64,
    #[serde(default = "default_refresh_interval_max_secs")]
    pub refresh_interval_max_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            polling_interval_ms: default_polling_interval_ms(),
            refresh_interval_min_secs: default_refresh_interval_min_secs(),
            refresh_interval_max_secs: default_refresh_interval_max_secs(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

impl ProcessingConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

fn default_low_watermark() -> usize {
    5
}
fn default_high_watermark() -> usize {
    10
}
fn default_polling_interval_ms() -> u64 {
    1_000
}
fn default_refresh_interval_min_secs() -> u64 {
    100
}
fn default_refresh_interval_max_secs() -> u64 {
    150
}
fn default_cache_ttl() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub file: Vec<FileProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileProviderConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Seconds between rescans while `catalog run` is active; `0` scans once.
    #[serde(default)]
    pub rescan_interval_secs: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

impl Config {
    /// A config with only a database path and defaults everywhere else.
    pub fn minimal(db_path: PathBuf) -> Self {
        Self {
            db: DbConfig {
                path: db_path,
                max_connections: default_max_connections(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            processing: ProcessingConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be > 0");
        }

        let processing = &self.processing;
        if processing.high_watermark == 0 {
            anyhow::bail!("processing.high_watermark must be > 0");
        }
        if processing.low_watermark >= processing.high_watermark {
            anyhow::bail!(
                "processing.low_watermark ({}) must be lower than processing.high_watermark ({})",
                processing.low_watermark,
                processing.high_watermark
            );
        }
        if processing.refresh_interval_min_secs > processing.refresh_interval_max_secs {
            anyhow::bail!(
                "processing.refresh_interval_min_secs must be <= processing.refresh_interval_max_secs"
            );
        }

        let mut names = HashSet::new();
        for provider in &self.providers.file {
            if provider.name.trim().is_empty() {
                anyhow::bail!("providers.file entries must have a non-empty name");
            }
            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("Duplicate provider name: '{}'", provider.name);
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
