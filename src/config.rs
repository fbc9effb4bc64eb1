use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;
use log::error;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_CAPACITY: usize = 10;
const DEFAULT_LIVE_POLL_SECS: u64 = 1;
const DEFAULT_METRICS_POLL_SECS: u64 = 3;
const DEFAULT_PLAYBACK_TICK_MS: u64 = 100;
const DEFAULT_STATUS_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_STATUS_RETRY_BACKOFF_SECS: u64 = 5;
const DEFAULT_BOUNDARY_ID: &str = "city_limits";

/// Engine configuration, merged from environment (`TRACKVIEW_*`), the user's
/// config file and built-in defaults, in that precedence order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
  pub config_path: Option<PathBuf>,
  pub base_url: Option<String>,
  pub request_timeout_secs: Option<u64>,
  pub cache_capacity: Option<usize>,
  pub live_poll_secs: Option<u64>,
  pub metrics_poll_secs: Option<u64>,
  pub playback_tick_ms: Option<u64>,
  pub status_retry_attempts: Option<u32>,
  pub status_retry_backoff_secs: Option<u64>,
  pub boundary_id: Option<String>,
}

impl Config {
  #[must_use]
  pub fn new() -> Self {
    let from_env = Self::from_env();
    let from_file = Self::from_file();
    let default = Self::default();

    let mut merged = from_env;
    if let Some(from_file) = &from_file {
      merged = merged.merge(from_file);
    }
    merged = merged.merge(&default);

    if merged.config_path.is_some() && from_file.is_none() {
      merged.init_cfg_file();
    }

    merged
  }

  fn from_env() -> Self {
    fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
      std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    Self {
      config_path: std::env::var("TRACKVIEW_CONFIG").ok().map(PathBuf::from),
      base_url: std::env::var("TRACKVIEW_BASE_URL").ok(),
      request_timeout_secs: parsed("TRACKVIEW_TIMEOUT_SECS"),
      cache_capacity: parsed("TRACKVIEW_CACHE_CAPACITY"),
      live_poll_secs: parsed("TRACKVIEW_LIVE_POLL_SECS"),
      metrics_poll_secs: parsed("TRACKVIEW_METRICS_POLL_SECS"),
      playback_tick_ms: parsed("TRACKVIEW_PLAYBACK_TICK_MS"),
      status_retry_attempts: parsed("TRACKVIEW_STATUS_RETRY_ATTEMPTS"),
      status_retry_backoff_secs: parsed("TRACKVIEW_STATUS_RETRY_BACKOFF_SECS"),
      boundary_id: std::env::var("TRACKVIEW_BOUNDARY_ID").ok(),
    }
  }

  fn merge(mut self, other: &Self) -> Self {
    self.config_path = self.config_path.or(other.config_path.clone());
    self.base_url = self.base_url.or(other.base_url.clone());
    self.request_timeout_secs = self.request_timeout_secs.or(other.request_timeout_secs);
    self.cache_capacity = self.cache_capacity.or(other.cache_capacity);
    self.live_poll_secs = self.live_poll_secs.or(other.live_poll_secs);
    self.metrics_poll_secs = self.metrics_poll_secs.or(other.metrics_poll_secs);
    self.playback_tick_ms = self.playback_tick_ms.or(other.playback_tick_ms);
    self.status_retry_attempts = self.status_retry_attempts.or(other.status_retry_attempts);
    self.status_retry_backoff_secs = self
      .status_retry_backoff_secs
      .or(other.status_retry_backoff_secs);
    self.boundary_id = self.boundary_id.or(other.boundary_id.clone());
    self
  }

  fn from_file() -> Option<Self> {
    let config_path = std::env::var("TRACKVIEW_CONFIG")
      .ok()
      .map(PathBuf::from)
      .or_else(|| home_dir().map(|p| p.join(".config").join("trackview")))?;
    let config_path = config_path.join("config.json");

    serde_json::from_str(&std::fs::read_to_string(&config_path).ok()?)
      .inspect_err(|e| error!("Failed to read config file: {e}"))
      .ok()?
  }

  fn init_cfg_file(&self) {
    let Some(path) = &self.config_path else {
      return;
    };
    if !path.exists() {
      let _ = std::fs::create_dir_all(path).inspect_err(|e| {
        error!("Failed to create config directory: {e}");
      });
    }

    let path = path.join("config.json");
    if !path.exists() {
      match serde_json::to_string_pretty(self) {
        Ok(config) => {
          let _ = std::fs::write(path, config).inspect_err(|e| {
            error!("Failed to write config file: {e}");
          });
        }
        Err(e) => error!("Failed to serialize config: {e}"),
      }
    }
  }

  #[must_use]
  pub fn resolved_base_url(&self) -> &str {
    self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
  }

  #[must_use]
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
  }

  #[must_use]
  pub fn resolved_cache_capacity(&self) -> usize {
    self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY)
  }

  #[must_use]
  pub fn live_poll_interval(&self) -> Duration {
    Duration::from_secs(self.live_poll_secs.unwrap_or(DEFAULT_LIVE_POLL_SECS))
  }

  #[must_use]
  pub fn metrics_poll_interval(&self) -> Duration {
    Duration::from_secs(self.metrics_poll_secs.unwrap_or(DEFAULT_METRICS_POLL_SECS))
  }

  #[must_use]
  pub fn playback_tick(&self) -> Duration {
    Duration::from_millis(self.playback_tick_ms.unwrap_or(DEFAULT_PLAYBACK_TICK_MS))
  }

  #[must_use]
  pub fn resolved_status_retry_attempts(&self) -> u32 {
    self
      .status_retry_attempts
      .unwrap_or(DEFAULT_STATUS_RETRY_ATTEMPTS)
  }

  #[must_use]
  pub fn status_retry_backoff(&self) -> Duration {
    Duration::from_secs(
      self
        .status_retry_backoff_secs
        .unwrap_or(DEFAULT_STATUS_RETRY_BACKOFF_SECS),
    )
  }

  #[must_use]
  pub fn resolved_boundary_id(&self) -> &str {
    self.boundary_id.as_deref().unwrap_or(DEFAULT_BOUNDARY_ID)
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      config_path: home_dir().map(|p| p.join(".config").join("trackview")),
      base_url: Some(DEFAULT_BASE_URL.to_string()),
      request_timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
      cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
      live_poll_secs: Some(DEFAULT_LIVE_POLL_SECS),
      metrics_poll_secs: Some(DEFAULT_METRICS_POLL_SECS),
      playback_tick_ms: Some(DEFAULT_PLAYBACK_TICK_MS),
      status_retry_attempts: Some(DEFAULT_STATUS_RETRY_ATTEMPTS),
      status_retry_backoff_secs: Some(DEFAULT_STATUS_RETRY_BACKOFF_SECS),
      boundary_id: Some(DEFAULT_BOUNDARY_ID.to_string()),
    }
  }
}
