//! Configuration loader and validator for the jGrants sync daemon.
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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub source: Source,
    pub sync: Sync,
    pub ai: Ai,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Remote subsidy API settings (public endpoint, no key required).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub base_url: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_seconds: u64,
}

/// Sync pipeline defaults; callers may override per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    pub keyword: String,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(default = "default_acceptance")]
    pub acceptance: String,
    pub max_import_count: usize,
    pub batch_size: usize,
    pub batch_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub update_existing: bool,
    #[serde(default)]
    pub auto_publish: bool,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: i64,
}

/// Generative-text settings, including the per-step prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ai {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_body_max_tokens")]
    pub body_max_tokens: u32,
    pub rate_limit: RateLimit,
    #[serde(default = "default_ai_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ai_batch_delay")]
    pub batch_delay_seconds: u64,
    #[serde(default = "default_regenerate_after_hours")]
    pub regenerate_after_hours: i64,
    #[serde(default)]
    pub steps: Steps,
    #[serde(default)]
    pub prompts: Prompts,
}

/// Per-step enable flags; a disabled step is simply not attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Steps {
    #[serde(default = "default_true")]
    pub title: bool,
    #[serde(default = "default_true")]
    pub excerpt: bool,
    #[serde(default = "default_true")]
    pub body: bool,
    #[serde(default = "default_true")]
    pub category: bool,
    #[serde(default = "default_true")]
    pub region: bool,
}

impl Default for Steps {
    fn default() -> Self {
        Self {
            title: true,
            excerpt: true,
            body: true,
            category: true,
            region: true,
        }
    }
}

/// Sliding-window quota for backend calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window_minutes: u64,
}

/// Prompt templates with named placeholders. Empty strings fall back to the
/// compiled-in defaults at generation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompts {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub body: String,
}

fn default_source_timeout() -> u64 {
    30
}

fn default_sort() -> String {
    "created_date".to_string()
}

fn default_order() -> String {
    "DESC".to_string()
}

fn default_acceptance() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval_hours() -> u64 {
    24
}

fn default_cleanup_days() -> i64 {
    90
}

fn default_model() -> String {
    "gpt-4-turbo-preview".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1/".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_body_max_tokens() -> u32 {
    2000
}

fn default_ai_batch_size() -> usize {
    5
}

fn default_ai_batch_delay() -> u64 {
    3
}

fn default_regenerate_after_hours() -> i64 {
    24
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.source.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("source.base_url must be non-empty"));
    }
    if cfg.source.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("source.timeout_seconds must be > 0"));
    }

    if cfg.sync.keyword.chars().count() < 2 {
        return Err(ConfigError::Invalid(
            "sync.keyword must be at least 2 characters",
        ));
    }
    if cfg.sync.max_import_count == 0 {
        return Err(ConfigError::Invalid("sync.max_import_count must be > 0"));
    }
    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be > 0"));
    }
    if !matches!(cfg.sync.interval_hours, 6 | 12 | 24 | 48) {
        return Err(ConfigError::Invalid(
            "sync.interval_hours must be one of 6, 12, 24, 48",
        ));
    }
    if cfg.sync.cleanup_days <= 0 {
        return Err(ConfigError::Invalid("sync.cleanup_days must be > 0"));
    }

    if cfg.ai.enabled {
        if cfg.ai.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "ai.rate_limit.max_requests must be > 0",
            ));
        }
        if cfg.ai.rate_limit.window_minutes == 0 {
            return Err(ConfigError::Invalid(
                "ai.rate_limit.window_minutes must be > 0",
            ));
        }
        if cfg.ai.batch_size == 0 {
            return Err(ConfigError::Invalid("ai.batch_size must be > 0"));
        }
        if cfg.ai.regenerate_after_hours <= 0 {
            return Err(ConfigError::Invalid(
                "ai.regenerate_after_hours must be > 0",
            ));
        }
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

source:
  base_url: "https://api.jgrants-portal.go.jp/exp/v1/public/"
  timeout_seconds: 30

sync:
  keyword: "補助金"
  sort: "created_date"
  order: "DESC"
  acceptance: "1"
  max_import_count: 50
  batch_size: 10
  batch_delay_seconds: 5
  update_existing: true
  auto_publish: false
  interval_hours: 24
  cleanup_days: 90

ai:
  enabled: true
  api_key: "YOUR_OPENAI_API_KEY"
  model: "gpt-4-turbo-preview"
  rate_limit:
    max_requests: 10
    window_minutes: 10
  batch_size: 5
  batch_delay_seconds: 3
  regenerate_after_hours: 24
  prompts:
    title: ""
    excerpt: ""
    body: ""
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync.max_import_count, 50);
        assert_eq!(cfg.ai.rate_limit.max_requests, 10);
    }

    #[test]
    fn invalid_short_keyword() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.keyword = "補".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("sync.keyword")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_batch_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.interval_hours = 7;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rate_limit_ignored_when_ai_disabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.ai.enabled = false;
        cfg.ai.rate_limit.max_requests = 0;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sync.keyword, "補助金");
        assert_eq!(cfg.sync.interval_hours, 24);
    }
}
