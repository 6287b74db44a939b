//! Sync configuration: epoch, provider tuning, and the tracked universes.
//!
//! Stored as a TOML file. Nothing in the engine reads globals; the CLI loads a
//! [`SyncConfig`] once and hands it to the orchestrator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const EPOCH_ENV: &str = "KABULEDGER_EPOCH";
pub const DATA_DIR_ENV: &str = "KABULEDGER_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("universe '{universe}' has no output path")]
    MissingPath { universe: String },

    #[error("duplicate universe {what}: {value}")]
    Duplicate { what: &'static str, value: String },
}

/// Top-level configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// First date collected when a dataset has no history.
    pub epoch: NaiveDate,

    /// Base directory for relative universe paths.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fetch through today. When false, windows end yesterday so a run during
    /// trading hours never stores an unfinished bar.
    #[serde(default = "default_include_today")]
    pub include_today: bool,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub constituents: ConstituentsConfig,

    #[serde(default, rename = "universe")]
    pub universes: Vec<UniverseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Pause between per-symbol requests within a batch.
    pub request_delay_ms: u64,
    /// Market suffix used to address the provider, stripped before storage.
    pub symbol_suffix: String,
    pub user_agent: String,
    pub breaker_cooldown_secs: u64,
    pub breaker_failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstituentsConfig {
    /// Pause between constituent page requests.
    pub request_pause_ms: u64,
    pub timeout_secs: u64,
}

/// Where a universe's identifier list comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UniverseSource {
    /// Tickers listed in the config file.
    Static { tickers: Vec<String> },
    /// Nikkei index component page.
    NikkeiPage { url: String },
    /// Minkabu index page with per-stock links.
    MinkabuPage { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub required: bool,
    pub source: UniverseSource,
}

fn default_include_today() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query2.finance.yahoo.com".into(),
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 500,
            request_delay_ms: 0,
            symbol_suffix: ".T".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .into(),
            breaker_cooldown_secs: 30 * 60,
            breaker_failure_threshold: 3,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

impl Default for ConstituentsConfig {
    fn default() -> Self {
        Self {
            request_pause_ms: 1_000,
            timeout_secs: 30,
        }
    }
}

impl ConstituentsConfig {
    pub fn request_pause(&self) -> Duration {
        Duration::from_millis(self.request_pause_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SyncConfig {
    /// Nikkei 225 and TSE Growth Core, collected from 2025-01-01.
    fn default() -> Self {
        Self {
            epoch: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
            data_dir: default_data_dir(),
            include_today: default_include_today(),
            provider: ProviderConfig::default(),
            constituents: ConstituentsConfig::default(),
            universes: vec![
                UniverseConfig {
                    name: "nikkei225".into(),
                    path: PathBuf::from("nikkei_225_data.csv"),
                    required: false,
                    source: UniverseSource::NikkeiPage {
                        url: "https://indexes.nikkei.co.jp/nkave/index/component?idx=nk225"
                            .into(),
                    },
                },
                UniverseConfig {
                    name: "growth_core".into(),
                    path: PathBuf::from("growth_core_data.csv"),
                    required: false,
                    source: UniverseSource::MinkabuPage {
                        url: "https://minkabu.jp/financial_item/tse_growth_core_index".into(),
                    },
                },
            ],
        }
    }
}

impl SyncConfig {
    /// Load a config from a TOML file, apply env overrides, and validate it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string (no env overrides, no validation).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// `KABULEDGER_EPOCH` and `KABULEDGER_DATA_DIR` win over the file.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw) = std::env::var(EPOCH_ENV) {
            self.epoch = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
                ConfigError::Invalid {
                    key: EPOCH_ENV.into(),
                    reason: format!("'{raw}': {e}"),
                }
            })?;
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    /// Reject configurations that would break the one-universe-one-path rule
    /// or leave the provider without a timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "provider.timeout_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for universe in &self.universes {
            if universe.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "universe.name".into(),
                    reason: "must not be empty".into(),
                });
            }
            if universe.path.as_os_str().is_empty() {
                return Err(ConfigError::MissingPath {
                    universe: universe.name.clone(),
                });
            }
            if !names.insert(universe.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "name",
                    value: universe.name.clone(),
                });
            }
            if !paths.insert(self.resolve_path(&universe.path)) {
                return Err(ConfigError::Duplicate {
                    what: "path",
                    value: universe.path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve a universe path against `data_dir` unless it is absolute.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn universe(&self, name: &str) -> Option<&UniverseConfig> {
        self.universes.iter().find(|u| u.name == name)
    }
}
