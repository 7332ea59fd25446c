//! Configuration loader and validator for the viral-thread pipeline.
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
    pub scanner: Scanner,
    pub dedup: Dedup,
    pub replier: Replier,
    pub twitter: Twitter,
    pub model: Model,
    pub queue: Queue,
    pub secrets: Secrets,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_attempts: u32,
}

/// Search filter and qualification threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scanner {
    pub keywords: Vec<String>,
    pub language: String,
    pub page_size: u32,
    pub score_threshold: f64,
    /// 0 disables scheduled scans.
    #[serde(default)]
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dedup {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replier {
    pub daily_max: u32,
    pub header: String,
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Twitter {
    pub api_base: String,
}

/// Reasoning model settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Model {
    pub name: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Local SQLite outbox drained by an in-process worker.
    Outbox,
    /// Google Pub/Sub topic with a push subscription to `/pubsub/push`.
    Pubsub,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub mode: QueueMode,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_pubsub_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secrets {
    /// When set, secrets come from Secret Manager in this project; otherwise
    /// from environment variables.
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_secret_manager_api_base")]
    pub api_base: String,
    pub cache_ttl_seconds: u64,
    pub env_fallback: bool,
}

fn default_pubsub_api_base() -> String {
    "https://pubsub.googleapis.com/".to_string()
}

fn default_secret_manager_api_base() -> String {
    "https://secretmanager.googleapis.com/".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the data-dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/threadripper.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
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
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be a socket address"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    if cfg.scanner.keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(ConfigError::Invalid("scanner.keywords must contain a keyword"));
    }
    if cfg.scanner.language.trim().is_empty() {
        return Err(ConfigError::Invalid("scanner.language must be non-empty"));
    }
    // The recent-search endpoint accepts 10..=100; smaller values are raised.
    if cfg.scanner.page_size == 0 || cfg.scanner.page_size > 100 {
        return Err(ConfigError::Invalid("scanner.page_size must be in 1..=100"));
    }
    if !cfg.scanner.score_threshold.is_finite() || cfg.scanner.score_threshold < 0.0 {
        return Err(ConfigError::Invalid("scanner.score_threshold must be >= 0"));
    }

    if cfg.dedup.retention_days == 0 {
        return Err(ConfigError::Invalid("dedup.retention_days must be > 0"));
    }

    if cfg.replier.daily_max == 0 {
        return Err(ConfigError::Invalid("replier.daily_max must be > 0"));
    }

    if cfg.twitter.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("twitter.api_base must be non-empty"));
    }
    if cfg.model.name.trim().is_empty() {
        return Err(ConfigError::Invalid("model.name must be non-empty"));
    }
    if cfg.model.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("model.api_base must be non-empty"));
    }

    if cfg.queue.mode == QueueMode::Pubsub {
        if cfg.queue.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.project_id is required for pubsub"));
        }
        if cfg.queue.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.topic is required for pubsub"));
        }
    }

    if let Some(project) = &cfg.secrets.project_id {
        if project.trim().is_empty() {
            return Err(ConfigError::Invalid("secrets.project_id must be non-empty when set"));
        }
    }

    Ok(())
}

/// Sample configuration document.
pub fn example() -> &'static str {
    r##"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  max_attempts: 5

scanner:
  keywords:
    - "startup"
    - "founder"
    - "launch"
  language: "en"
  page_size: 20
  score_threshold: 20.0
  interval_minutes: 15

dedup:
  retention_days: 30

replier:
  daily_max: 20
  header: "🧠 Thread Psychology Analysis:"
  hashtags:
    - "#ThreadAnalysis"
    - "#SubtextExposed"

twitter:
  api_base: "https://api.twitter.com/"

model:
  name: "gemini-1.5-flash-latest"
  api_base: "https://generativelanguage.googleapis.com/"

queue:
  mode: "outbox"
  project_id: ""
  topic: "twitter-analyzer-new-thread"

secrets:
  cache_ttl_seconds: 3600
  env_fallback: true
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = sample();
        validate(&cfg).unwrap();
        assert_eq!(cfg.queue.mode, QueueMode::Outbox);
        assert_eq!(cfg.replier.daily_max, 20);
        assert_eq!(cfg.queue.api_base, "https://pubsub.googleapis.com/");
        assert!(cfg.secrets.project_id.is_none());
    }

    #[test]
    fn example_hashtags_survive_parsing() {
        let cfg = sample();
        assert_eq!(cfg.replier.hashtags, vec!["#ThreadAnalysis", "#SubtextExposed"]);
        assert_eq!(cfg.queue.topic, "twitter-analyzer-new-thread");
    }

    #[test]
    fn invalid_bind_addr() {
        let mut cfg = sample();
        cfg.app.bind_addr = "not-an-addr".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.bind_addr")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn blank_keywords_rejected() {
        let mut cfg = sample();
        cfg.scanner.keywords = vec!["  ".into()];
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("scanner.keywords")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn page_size_bounds() {
        let mut cfg = sample();
        cfg.scanner.page_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.scanner.page_size = 101;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.scanner.page_size = 100;
        validate(&cfg).unwrap();
    }

    #[test]
    fn zero_budget_and_retention_rejected() {
        let mut cfg = sample();
        cfg.replier.daily_max = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = sample();
        cfg.dedup.retention_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn pubsub_requires_project_and_topic() {
        let mut cfg = sample();
        cfg.queue.mode = QueueMode::Pubsub;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("queue.project_id")),
            _ => panic!("wrong error"),
        }
        cfg.queue.project_id = "proj".into();
        validate(&cfg).unwrap();
        cfg.queue.topic = "".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("queue.topic")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = sample();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.scanner.keywords.len(), 3);
        assert_eq!(cfg.model.name, "gemini-1.5-flash-latest");
    }
}
