//! Engine configuration loaded from `config.yaml`.
//!
//! Every field carries a serde default so a minimal file only needs the
//! `sources` list. Durations are stored in milliseconds to keep the YAML flat.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "PODCAST_KB_CONFIG";
pub const TOKEN_ENV_VAR: &str = "TRANSCRIPT_SERVICE_TOKEN";
pub const USER_ID_ENV_VAR: &str = "TRANSCRIPT_SERVICE_USER_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_check_delay_ms")]
    pub check_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_check_retries")]
    pub max_check_retries: u32,
    #[serde(default)]
    pub max_items_per_run: Option<usize>,
    #[serde(default)]
    pub source_filter: Option<Vec<String>>,
    #[serde(default = "default_status_cooldown_ms")]
    pub status_cooldown_ms: u64,
    #[serde(default = "default_max_episodes_per_feed")]
    pub max_episodes_per_feed: usize,
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Local hour (0-23) at which daemon mode runs the daily sync.
    #[serde(default = "default_daily_sync_hour")]
    pub daily_sync_hour: u32,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub exclusion_rules: Vec<ExclusionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// One tracked podcast feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub feed_url: String,
    /// Identifier of the show in the transcript service's catalog.
    #[serde(default)]
    pub catalog_id: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Title pattern that marks an episode as editorially excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub pattern: String,
    pub tag: String,
}

fn default_concurrency() -> usize {
    5
}
fn default_stagger_ms() -> u64 {
    500
}
fn default_check_delay_ms() -> u64 {
    4 * 60 * 1000
}
fn default_retry_delay_ms() -> u64 {
    2 * 60 * 1000
}
fn default_max_check_retries() -> u32 {
    15
}
fn default_status_cooldown_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_max_episodes_per_feed() -> usize {
    300
}
fn default_fallback_delay_ms() -> u64 {
    1500
}
fn default_lock_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_daily_sync_hour() -> u32 {
    1
}
fn default_base_url() -> String {
    "https://api.transcripts.example.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            stagger_ms: default_stagger_ms(),
            check_delay_ms: default_check_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_check_retries: default_max_check_retries(),
            max_items_per_run: None,
            source_filter: None,
            status_cooldown_ms: default_status_cooldown_ms(),
            max_episodes_per_feed: default_max_episodes_per_feed(),
            fallback_delay_ms: default_fallback_delay_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            daily_sync_hour: default_daily_sync_hour(),
            database_path: None,
            service: ServiceConfig::default(),
            sources: Vec::new(),
            exclusion_rules: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from an explicit path.
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> AppResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".into()));
        }
        if self.daily_sync_hour > 23 {
            return Err(AppError::Config(format!(
                "daily_sync_hour must be 0-23, got {}",
                self.daily_sync_hour
            )));
        }
        for rule in &self.exclusion_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                AppError::Config(format!("Invalid exclusion pattern '{}': {}", rule.pattern, e))
            })?;
        }
        Ok(())
    }

    /// Resolve the config path: `$PODCAST_KB_CONFIG`, else `<data dir>/podcast-kb/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
            if !p.trim().is_empty() {
                return Some(PathBuf::from(p));
            }
        }
        dirs::data_dir().map(|d| d.join("podcast-kb").join("config.yaml"))
    }

    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("podcast-kb").join("podcast_kb.db")))
    }

    /// Sources that are enabled and pass `source_filter`.
    pub fn active_sources(&self) -> Vec<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match &self.source_filter {
                Some(ids) => ids.iter().any(|id| id == &s.id),
                None => true,
            })
            .collect()
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
    pub fn check_delay(&self) -> Duration {
        Duration::from_millis(self.check_delay_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn status_cooldown(&self) -> Duration {
        Duration::from_millis(self.status_cooldown_ms)
    }
    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
