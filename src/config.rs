use crate::model::Strictness;
use crate::search::engine::ScanLimits;
use crate::search::fetch::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub scan: ScanConfig,
    pub autoscan: AutoScanSettings,
    pub stats: StatsConfig,
    pub badwords: BadWordsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub page_size: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub max_rate_limit_waits: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 8000,
            jitter_ms: 100,
            max_rate_limit_waits: 5,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            max_rate_limit_waits: self.max_rate_limit_waits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_concurrency: Option<usize>,
    pub channel_cap: usize,
    pub deep_factor: usize,
    pub result_cap: usize,
    pub context_radius: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            channel_cap: 50,
            deep_factor: 10,
            result_cap: 5000,
            context_radius: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScanSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub depth_limit: usize,
    pub strictness: Strictness,
    pub findings_capacity: usize,
    /// Also check member names and display names on each run.
    pub scan_members: bool,
}

impl Default for AutoScanSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
            depth_limit: 100,
            strictness: Strictness::Substring,
            findings_capacity: 10_000,
            scan_members: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub path: PathBuf,
    /// Longest time cache hit/miss counters stay unwritten.
    pub flush_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .map(|d| d.join("msgscan"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("search_stats.json");
        Self {
            path,
            flush_interval_secs: 5,
        }
    }
}

impl StatsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BadWordsConfig {
    pub path: Option<PathBuf>,
    pub words: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Some(xdg_config) = dirs::config_dir() {
            let xdg_path = xdg_config.join("msgscan/config.toml");
            if xdg_path.exists() {
                return Some(xdg_path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            let home_path = home.join(".msgscan.toml");
            if home_path.exists() {
                return Some(home_path);
            }
        }

        let current_path = Path::new(".msgscan.toml");
        if current_path.exists() {
            return Some(current_path.to_path_buf());
        }

        None
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn scan_limits(&self) -> ScanLimits {
        ScanLimits {
            page_size: self.fetch.page_size.max(1),
            max_concurrency: self
                .scan
                .max_concurrency
                .unwrap_or_else(|| num_cpus::get().clamp(1, 4))
                .max(1),
            channel_cap: self.scan.channel_cap,
            deep_factor: self.scan.deep_factor.max(1),
            result_cap: self.scan.result_cap,
            context_radius: self.scan.context_radius,
        }
    }
}
