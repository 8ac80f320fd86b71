use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheTtl, RetryPolicy, TtlTable};

pub const APP_NAME: &str = "bizcache";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub service: ServiceConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Background refresh period for long-lived resources
  #[serde(default = "default_refresh_interval_secs")]
  pub refresh_interval_secs: u64,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Base URL of the data service REST endpoint
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Keep cache entries in SQLite so they survive restarts
  #[serde(default = "default_true")]
  pub persistent: bool,
  /// Database location (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Per-resource TTL overrides in milliseconds
  #[serde(default)]
  pub ttl: HashMap<CacheTtl, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persistent: true,
      path: None,
      ttl: HashMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_retry_attempts")]
  pub attempts: u32,
  #[serde(default = "default_retry_delay_ms")]
  pub delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      attempts: default_retry_attempts(),
      delay_ms: default_retry_delay_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Log file directory (defaults to <data dir>/logs)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_refresh_interval_secs() -> u64 {
  300
}

fn default_retry_attempts() -> u32 {
  2
}

fn default_retry_delay_ms() -> u64 {
  1000
}

fn default_log_level() -> String {
  "info".to_string()
}

/// Directory for the database and log files.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join(APP_NAME))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bizcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bizcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/bizcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(format!("{}.yaml", APP_NAME));
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.service.url.trim().is_empty() {
      return Err(eyre!("service.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the data service API key from the environment.
  ///
  /// Returns `None` when BIZCACHE_API_KEY is unset, for services that do not
  /// require one.
  pub fn get_api_key() -> Option<String> {
    std::env::var("BIZCACHE_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log.dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(default_data_dir()?.join("logs")),
    }
  }

  pub fn service_timeout(&self) -> Duration {
    Duration::from_secs(self.service.timeout_secs)
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      attempts: self.retry.attempts,
      delay: Duration::from_millis(self.retry.delay_ms),
    }
  }

  pub fn ttl_table(&self) -> TtlTable {
    TtlTable::new(&self.cache.ttl)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("service:\n  url: https://db.example.com/rest/v1\n").unwrap();

    assert_eq!(config.service.timeout_secs, 10);
    assert!(config.cache.persistent);
    assert_eq!(config.refresh_interval(), Duration::from_secs(300));
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.log.level, "info");
    assert_eq!(
      config.ttl_table().get(CacheTtl::Catalog),
      CacheTtl::Catalog.duration()
    );
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
service:
  url: http://localhost:3000
  timeout_secs: 3
cache:
  persistent: false
  path: /tmp/bizcache-test.db
  ttl:
    company_data: 1000
    reports: 5000
retry:
  attempts: 4
  delay_ms: 250
refresh_interval_secs: 60
log:
  level: debug
  dir: /tmp/bizcache-logs
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.service_timeout(), Duration::from_secs(3));
    assert!(!config.cache.persistent);
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/bizcache-test.db")
    );
    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/tmp/bizcache-logs"));
    assert_eq!(
      config.retry_policy(),
      RetryPolicy {
        attempts: 4,
        delay: Duration::from_millis(250),
      }
    );

    let ttl = config.ttl_table();
    assert_eq!(ttl.get(CacheTtl::CompanyData), Duration::from_millis(1000));
    assert_eq!(ttl.get(CacheTtl::Reports), Duration::from_millis(5000));
    assert_eq!(ttl.get(CacheTtl::Dashboard), CacheTtl::Dashboard.duration());
  }

  #[test]
  fn test_rejects_unknown_ttl_resource_and_empty_url() {
    let unknown = "service:\n  url: http://x\ncache:\n  ttl:\n    invoices: 10\n";
    assert!(Config::parse(unknown).is_err());
    assert!(Config::parse("service:\n  url: ''\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/bizcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
