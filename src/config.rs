use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::upstream::rate_limit::RateLimitConfig;
use crate::upstream::retry::RetryConfig;

pub const DEFAULT_ENDPOINT: &str = "https://api.linear.app/graphql";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub upstream: UpstreamConfig,
  #[serde(default)]
  pub rate_limit: RateLimitSettings,
  #[serde(default)]
  pub retry: RetrySettings,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub database: DatabaseConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

/// When to issue the follow-up request that recovers rate-limit headers.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
  /// After every primary call
  Always,
  /// Only when the primary response carried no rate-limit headers
  #[default]
  WhenMissing,
  Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  pub url: String,
  /// Team whose issues are mirrored
  pub team_id: Option<String>,
  pub page_size: u32,
  pub timeout_secs: u64,
  pub refresh_rate_limits: RefreshMode,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      url: DEFAULT_ENDPOINT.to_string(),
      team_id: None,
      page_size: 100,
      timeout_secs: 30,
      refresh_rate_limits: RefreshMode::default(),
    }
  }
}

impl UpstreamConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
  pub max_retries: u32,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub multiplier: f64,
  /// Fraction of a bucket kept in reserve before pre-flight throttling kicks in
  pub safety_threshold: f64,
  pub window_secs: u64,
}

impl Default for RateLimitSettings {
  fn default() -> Self {
    let defaults = RateLimitConfig::default();
    Self {
      max_retries: defaults.max_retries,
      initial_delay_ms: defaults.initial_delay.as_millis() as u64,
      max_delay_ms: defaults.max_delay.as_millis() as u64,
      multiplier: defaults.multiplier,
      safety_threshold: defaults.safety_threshold,
      window_secs: defaults.window.as_secs(),
    }
  }
}

impl From<&RateLimitSettings> for RateLimitConfig {
  fn from(s: &RateLimitSettings) -> Self {
    RateLimitConfig {
      max_retries: s.max_retries,
      initial_delay: Duration::from_millis(s.initial_delay_ms),
      max_delay: Duration::from_millis(s.max_delay_ms),
      multiplier: s.multiplier,
      safety_threshold: s.safety_threshold.clamp(0.0, 1.0),
      window: Duration::from_secs(s.window_secs.max(1)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_retries: u32,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub multiplier: f64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    let defaults = RetryConfig::default();
    Self {
      max_retries: defaults.max_retries,
      initial_delay_ms: defaults.initial_delay.as_millis() as u64,
      max_delay_ms: defaults.max_delay.as_millis() as u64,
      multiplier: defaults.multiplier,
    }
  }
}

impl From<&RetrySettings> for RetryConfig {
  fn from(s: &RetrySettings) -> Self {
    RetryConfig {
      max_retries: s.max_retries,
      initial_delay: Duration::from_millis(s.initial_delay_ms),
      max_delay: Duration::from_millis(s.max_delay_ms),
      multiplier: s.multiplier,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Cron-style schedule, e.g. "*/15 * * * *"
  pub schedule: Option<String>,
  pub run_on_startup: bool,
  /// Shared secret required by the trigger endpoint when set
  pub trigger_secret: Option<String>,
  /// How many transform failures to keep for operators
  pub failure_history: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      schedule: None,
      run_on_startup: true,
      trigger_secret: None,
      failure_history: 50,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub detail_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { detail_ttl_secs: 30 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub bind: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: "127.0.0.1:8080".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  /// Run-log database (default: $XDG_DATA_HOME/issuesync/runs.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Directory for daily-rolling log files; stdout only when unset
  pub directory: Option<PathBuf>,
  /// Filter directive used when RUST_LOG is not set
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./issuesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/issuesync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/issuesync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("issuesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("issuesync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let url = url::Url::parse(&self.upstream.url)
      .map_err(|e| eyre!("Invalid upstream url '{}': {}", self.upstream.url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("Upstream url must be http(s), got {}", url.scheme()));
    }
    if self.upstream.page_size == 0 {
      return Err(eyre!("upstream.page_size must be greater than zero"));
    }
    Ok(())
  }

  /// Get the upstream API key from environment variables.
  ///
  /// Checks ISSUESYNC_API_KEY first, then LINEAR_API_KEY as fallback.
  pub fn get_api_key() -> Option<String> {
    std::env::var("ISSUESYNC_API_KEY")
      .or_else(|_| std::env::var("LINEAR_API_KEY"))
      .ok()
      .filter(|key| !key.trim().is_empty())
  }

  pub fn detail_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.detail_ttl_secs)
  }
}
