/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Connected.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default TOML file with an optional override
- Helpers to initialize an SQLite database pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/connected.db")
    pub path: String,
}

/// Outbound HTTP (feed fetching) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 {
    20
}

fn default_user_agent() -> String {
    "ConnectedNewsBot/0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// News pipeline configuration: entry caps, cluster staleness, card cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    #[serde(default = "default_max_entries_per_source")]
    pub max_entries_per_source: usize,
    #[serde(default = "default_max_entries_per_category")]
    pub max_entries_per_category: usize,
    /// Total-run entry cap. Defaults to max_entries_per_category x category count.
    pub max_total_entries: Option<usize>,
    #[serde(default = "default_cluster_stale_hours")]
    pub cluster_stale_hours: i64,
    #[serde(default = "default_card_cooldown_minutes")]
    pub card_cooldown_minutes: i64,
    /// When set, the first sentence of the entry summary is appended to the
    /// title before deriving the clustering key.
    #[serde(default)]
    pub key_include_summary: bool,
}

fn default_max_entries_per_source() -> usize {
    50
}

fn default_max_entries_per_category() -> usize {
    100
}

fn default_cluster_stale_hours() -> i64 {
    48
}

fn default_card_cooldown_minutes() -> i64 {
    90
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            max_entries_per_source: default_max_entries_per_source(),
            max_entries_per_category: default_max_entries_per_category(),
            max_total_entries: None,
            cluster_stale_hours: default_cluster_stale_hours(),
            card_cooldown_minutes: default_card_cooldown_minutes(),
            key_include_summary: false,
        }
    }
}

/// Daily brief configuration: topic list, lookback and per-topic limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefConfig {
    #[serde(default = "default_brief_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_brief_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_brief_items_per_topic")]
    pub items_per_topic: usize,
    /// Bound on how many topics are processed per run; defaults to all.
    pub max_topics: Option<usize>,
    #[serde(default = "default_brief_max_tokens")]
    pub max_tokens: u32,
}

fn default_brief_topics() -> Vec<String> {
    [
        "culture",
        "economics",
        "finance",
        "fitness/health",
        "science",
        "tech",
        "society",
        "sports",
        "global issues/world affairs",
        "pop culture/media",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_brief_lookback_hours() -> i64 {
    24
}

fn default_brief_items_per_topic() -> usize {
    10
}

fn default_brief_max_tokens() -> u32 {
    450
}

impl Default for BriefConfig {
    fn default() -> Self {
        Self {
            topics: default_brief_topics(),
            lookback_hours: default_brief_lookback_hours(),
            items_per_topic: default_brief_items_per_topic(),
            max_topics: None,
            max_tokens: default_brief_max_tokens(),
        }
    }
}

/// A single completion provider endpoint ("openai" or "anthropic")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<u32>,
}

/// LLM top-level config: the provider ladder is `primary` then `fallback`
/// (when distinct), each name resolving to a provider table below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub primary: Option<String>,
    pub fallback: Option<String>,
    pub openai: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
}

impl LlmConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "openai" => self.openai.as_ref(),
            "anthropic" => self.anthropic.as_ref(),
            _ => None,
        }
    }

    /// Ordered ladder of configured provider names: primary, then fallback
    /// when present and distinct.
    pub fn ladder(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(p) = self.primary.as_deref() {
            out.push(p);
        }
        if let Some(f) = self.fallback.as_deref() {
            if Some(f) != self.primary.as_deref() {
                out.push(f);
            }
        }
        out
    }
}

/// Admin / trigger-surface config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Name of the env var holding the static admin credential.
    pub api_key_env: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub news: NewsConfig,
    #[serde(default)]
    pub brief: BriefConfig,
    pub llm: Option<LlmConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary, ensures the DB file exists
/// (attempting to create it if missing), and returns a configured
/// `SqlitePool` with WAL journaling and a modest pool size.
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Try to create the DB file if it does not already exist. This surfaces
    // filesystem permission or path issues earlier than the SQLite connect.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
