//! Configuration loader and validator for the scheduling daemon.
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: Scheduler,
    pub platform: Platform,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub tick_interval_secs: u64,
    pub worker_concurrency: usize,
    pub publish_timeout_secs: u64,
}

/// Slot allocation and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub collision_window_minutes: i64,
    pub lookahead_days: u32,
    pub max_retries: i32,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    /// Fallback posting times for pages without configured slots, "HH:MM".
    pub default_slot_times: Vec<String>,
}

/// External publishing platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub base_url: String,
    pub access_token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Parsed default slot times, in ascending order.
    pub fn default_slot_times(&self) -> Vec<NaiveTime> {
        let mut times: Vec<NaiveTime> = self
            .scheduler
            .default_slot_times
            .iter()
            .filter_map(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
            .collect();
        times.sort();
        times
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_secs must be > 0"));
    }
    if cfg.app.worker_concurrency == 0 {
        return Err(ConfigError::Invalid("app.worker_concurrency must be > 0"));
    }
    if cfg.app.publish_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.publish_timeout_secs must be > 0"));
    }

    if cfg.scheduler.collision_window_minutes <= 0 {
        return Err(ConfigError::Invalid(
            "scheduler.collision_window_minutes must be > 0",
        ));
    }
    if cfg.scheduler.lookahead_days == 0 {
        return Err(ConfigError::Invalid("scheduler.lookahead_days must be > 0"));
    }
    if cfg.scheduler.max_retries < 0 {
        return Err(ConfigError::Invalid("scheduler.max_retries must be >= 0"));
    }
    if cfg.scheduler.backoff_base_secs <= 0 {
        return Err(ConfigError::Invalid("scheduler.backoff_base_secs must be > 0"));
    }
    if cfg.scheduler.backoff_cap_secs < cfg.scheduler.backoff_base_secs {
        return Err(ConfigError::Invalid(
            "scheduler.backoff_cap_secs must be >= backoff_base_secs",
        ));
    }
    if cfg.scheduler.default_slot_times.is_empty() {
        return Err(ConfigError::Invalid(
            "scheduler.default_slot_times must be non-empty",
        ));
    }
    for t in &cfg.scheduler.default_slot_times {
        if NaiveTime::parse_from_str(t, "%H:%M").is_err() {
            return Err(ConfigError::Invalid(
                "scheduler.default_slot_times entries must be HH:MM",
            ));
        }
    }

    if cfg.platform.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("platform.base_url must be non-empty"));
    }
    if cfg.platform.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("platform.access_token must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, also used as a fixture in tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_secs: 30
  worker_concurrency: 5
  publish_timeout_secs: 30

scheduler:
  collision_window_minutes: 30
  lookahead_days: 14
  max_retries: 3
  backoff_base_secs: 60
  backoff_cap_secs: 3600
  default_slot_times:
    - "09:00"
    - "13:00"
    - "19:00"

platform:
  base_url: "https://graph.facebook.com/v18.0/"
  access_token: "YOUR_PLATFORM_ACCESS_TOKEN"
"#
}
