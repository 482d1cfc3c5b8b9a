use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the unification core.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub review_source: ReviewSourceConfig,
  pub tracker_source: TrackerSourceConfig,
  #[serde(default)]
  pub team: TeamConfig,
  #[serde(default)]
  pub thresholds: Thresholds,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

/// Connection settings for the code-review source (merge requests).
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSourceConfig {
  pub url: String,
  /// Group or project path whose merge requests are fetched.
  /// Missing means "not configured" and fetches degrade to empty.
  #[serde(default)]
  pub group: Option<String>,
}

/// Connection settings for the work-item tracker source.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSourceConfig {
  pub url: String,
  pub email: Option<String>,
  /// Project keys to search. Empty means "not configured".
  #[serde(default)]
  pub projects: Vec<String>,
}

/// Team membership used for relevance filtering and reference extraction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamConfig {
  /// Identities (usernames/account ids) considered "ours" (case-insensitive).
  /// A record is relevant when it touches one of these as author, assignee
  /// or reviewer. Empty means relevance filtering yields no records.
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub identities: BTreeSet<String>,

  /// Uppercase project prefixes recognized as reference keys (e.g. "ABC").
  /// Empty accepts any well-formed key.
  #[serde(default)]
  pub project_prefixes: BTreeSet<String>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

/// Age thresholds for derived counts. Read at aggregation time, so a change
/// takes effect on the next pass without any cache invalidation.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
  /// Days since creation before a merge request counts as overdue.
  #[serde(default = "default_overdue_days")]
  pub overdue_days: i64,
  /// Days since last update before a merge request counts as stalled.
  #[serde(default = "default_stalled_days")]
  pub stalled_days: i64,
}

fn default_overdue_days() -> i64 {
  28
}

fn default_stalled_days() -> i64 {
  14
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      overdue_days: default_overdue_days(),
      stalled_days: default_stalled_days(),
    }
  }
}

/// Per-tier TTLs, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_raw_ttl_secs")]
  pub raw_ttl_secs: u64,
  #[serde(default = "default_derived_ttl_secs")]
  pub derived_ttl_secs: u64,
  #[serde(default = "default_client_ttl_secs")]
  pub client_ttl_secs: u64,
}

fn default_raw_ttl_secs() -> u64 {
  15 * 60
}

fn default_derived_ttl_secs() -> u64 {
  60 * 60
}

fn default_client_ttl_secs() -> u64 {
  60 * 60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      raw_ttl_secs: default_raw_ttl_secs(),
      derived_ttl_secs: default_derived_ttl_secs(),
      client_ttl_secs: default_client_ttl_secs(),
    }
  }
}

/// Retry behavior for transient page-fetch failures.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
  /// Retries per page beyond the first attempt.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Base backoff delay in milliseconds; attempt n waits `base * 2^n`.
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
  3
}

fn default_backoff_base_ms() -> u64 {
  500
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      backoff_base_ms: default_backoff_base_ms(),
    }
  }
}

impl RetryConfig {
  /// Backoff delay before retrying, for a zero-based attempt number.
  pub fn backoff_delay(&self, attempt: u32) -> Duration {
    Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
  }
}

/// Background sync scheduler settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncConfig {
  /// Scheduler tick cadence in seconds.
  #[serde(default = "default_tick_secs")]
  pub tick_secs: u64,
  /// Jobs admitted per tick, bounding external request concurrency.
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent_per_tick: usize,
  /// Floor on the retry delay of a failing job, in seconds.
  #[serde(default = "default_min_backoff_secs")]
  pub min_backoff_secs: u64,
  /// Normal refresh interval per job, in seconds.
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
}

fn default_tick_secs() -> u64 {
  30
}

fn default_max_concurrent() -> usize {
  2
}

fn default_min_backoff_secs() -> u64 {
  60
}

fn default_interval_secs() -> u64 {
  5 * 60
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tick_secs: default_tick_secs(),
      max_concurrent_per_tick: default_max_concurrent(),
      min_backoff_secs: default_min_backoff_secs(),
      interval_secs: default_interval_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mergelink.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mergelink/config.yaml
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
        "No configuration file found. Create one at ~/.config/mergelink/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("mergelink.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mergelink").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the review-source API token from environment variables.
  ///
  /// Checks MERGELINK_REVIEW_TOKEN first, then GITLAB_TOKEN as fallback.
  pub fn review_token() -> Result<String> {
    std::env::var("MERGELINK_REVIEW_TOKEN")
      .or_else(|_| std::env::var("GITLAB_TOKEN"))
      .map_err(|_| {
        eyre!("Review API token not found. Set MERGELINK_REVIEW_TOKEN or GITLAB_TOKEN.")
      })
  }

  /// Get the tracker-source API token from environment variables.
  ///
  /// Checks MERGELINK_TRACKER_TOKEN first, then JIRA_API_TOKEN as fallback.
  pub fn tracker_token() -> Result<String> {
    std::env::var("MERGELINK_TRACKER_TOKEN")
      .or_else(|_| std::env::var("JIRA_API_TOKEN"))
      .map_err(|_| {
        eyre!("Tracker API token not found. Set MERGELINK_TRACKER_TOKEN or JIRA_API_TOKEN.")
      })
  }
}
