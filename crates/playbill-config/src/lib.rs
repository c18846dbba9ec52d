use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PLAYBILL_DIR_NAME: &str = ".playbill";
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub const DEFAULT_BASELINE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_BACKOFF_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_BACKOFF_INTERVAL_SECS: u64 = 90;
pub const DEFAULT_CALLBACK_LIMIT: usize = 8;
pub const DEFAULT_REFRESH_LIMIT: usize = 4;
pub const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 900;
pub const DEFAULT_SOURCE_ENDPOINT: &str = "https://clubz.cloudsation.com";
pub const DEFAULT_FETCH_PAGE_SIZE: u32 = 95;
pub const DEFAULT_DETAIL_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlaybillConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

/// Polling cadence and the callback fan-out bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_baseline_interval")]
    pub baseline_interval_secs: u64,
    #[serde(default = "default_backoff_interval")]
    pub backoff_interval_secs: u64,
    #[serde(default = "default_max_backoff_interval")]
    pub max_backoff_interval_secs: u64,
    #[serde(default = "default_callback_limit")]
    pub callback_limit: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            baseline_interval_secs: DEFAULT_BASELINE_INTERVAL_SECS,
            backoff_interval_secs: DEFAULT_BACKOFF_INTERVAL_SECS,
            max_backoff_interval_secs: DEFAULT_MAX_BACKOFF_INTERVAL_SECS,
            callback_limit: DEFAULT_CALLBACK_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_snapshot_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_refresh_limit")]
    pub refresh_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_SNAPSHOT_TTL_SECS,
            refresh_limit: DEFAULT_REFRESH_LIMIT,
        }
    }
}

/// Upstream ticketing endpoint the reference fetcher talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_fetch_page_size")]
    pub page_size: u32,
    #[serde(default = "default_detail_limit")]
    pub detail_limit: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_source_endpoint(),
            page_size: DEFAULT_FETCH_PAGE_SIZE,
            detail_limit: DEFAULT_DETAIL_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

pub fn playbill_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(PLAYBILL_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    playbill_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PlaybillConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(PlaybillConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PlaybillConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<PlaybillConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(playbill_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = PlaybillConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &PlaybillConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.poll.baseline_interval_secs == 0 {
        warnings.push(ConfigWarning {
            code: "poll.baseline_interval",
            message: "baseline interval of 0s polls continuously".to_owned(),
        });
    }
    if config.poll.backoff_interval_secs < config.poll.baseline_interval_secs {
        warnings.push(ConfigWarning {
            code: "poll.backoff_interval",
            message: format!(
                "backoff interval {}s is shorter than the baseline {}s",
                config.poll.backoff_interval_secs, config.poll.baseline_interval_secs
            ),
        });
    }
    if config.poll.max_backoff_interval_secs < config.poll.backoff_interval_secs {
        warnings.push(ConfigWarning {
            code: "poll.max_backoff_interval",
            message: format!(
                "max backoff {}s is shorter than the first backoff tier {}s",
                config.poll.max_backoff_interval_secs, config.poll.backoff_interval_secs
            ),
        });
    }
    if config.poll.callback_limit == 0 {
        warnings.push(ConfigWarning {
            code: "poll.callback_limit",
            message: "callback limit of 0 disables change delivery; treated as 1".to_owned(),
        });
    }
    if config.cache.refresh_limit == 0 {
        warnings.push(ConfigWarning {
            code: "cache.refresh_limit",
            message: "refresh limit of 0 disables background refresh; treated as 1".to_owned(),
        });
    }
    if config.cache.default_ttl_secs == 0 {
        warnings.push(ConfigWarning {
            code: "cache.default_ttl",
            message: "TTL of 0s marks every snapshot stale on read".to_owned(),
        });
    }
    if config.source.page_size == 0 {
        warnings.push(ConfigWarning {
            code: "source.page_size",
            message: "page size of 0 fetches no events".to_owned(),
        });
    }

    warnings
}

fn default_baseline_interval() -> u64 {
    DEFAULT_BASELINE_INTERVAL_SECS
}

fn default_backoff_interval() -> u64 {
    DEFAULT_BACKOFF_INTERVAL_SECS
}

fn default_max_backoff_interval() -> u64 {
    DEFAULT_MAX_BACKOFF_INTERVAL_SECS
}

fn default_callback_limit() -> usize {
    DEFAULT_CALLBACK_LIMIT
}

fn default_refresh_limit() -> usize {
    DEFAULT_REFRESH_LIMIT
}

fn default_snapshot_ttl() -> u64 {
    DEFAULT_SNAPSHOT_TTL_SECS
}

fn default_source_endpoint() -> String {
    DEFAULT_SOURCE_ENDPOINT.to_owned()
}

fn default_fetch_page_size() -> u32 {
    DEFAULT_FETCH_PAGE_SIZE
}

fn default_detail_limit() -> usize {
    DEFAULT_DETAIL_LIMIT
}

fn normalize_config(mut config: PlaybillConfig) -> PlaybillConfig {
    let endpoint = config.source.endpoint.trim().trim_end_matches('/');
    config.source.endpoint = if endpoint.is_empty() {
        default_source_endpoint()
    } else {
        endpoint.to_owned()
    };
    config
}
