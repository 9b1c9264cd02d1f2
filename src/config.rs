//! Configuration loader and validator for the zsxq → Telegram relay.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::FeedKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Duplicate group id in configuration: {0}")]
    DuplicateGroup(String),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub zsxq: Zsxq,
    pub telegram: Telegram,
    pub groups: Vec<GroupConfig>,
}

/// Crawl pacing, limits and state location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,
    pub crawl_interval_minutes: u64,
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Upper bound on pages per walk once a checkpoint exists.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Bounds for a walk with no checkpoint (first deployment or reset).
    #[serde(default = "default_first_run_max_pages")]
    pub first_run_max_pages: usize,
    #[serde(default = "default_first_run_max_items")]
    pub first_run_max_items: usize,
}

/// zsxq API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Zsxq {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    #[serde(default)]
    pub bot_token: String,
    pub chat_id: i64,
    /// Forum thread receiving crawl failure reports.
    #[serde(default)]
    pub error_thread_id: Option<i32>,
}

/// One group to crawl and where each of its feeds is routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub group_id: String,
    #[serde(default)]
    pub crawl_home: bool,
    #[serde(default)]
    pub thread_ids: BTreeMap<FeedKind, i32>,
}

impl GroupConfig {
    pub fn thread_id(&self, kind: FeedKind) -> Option<i32> {
        self.thread_ids.get(&kind).copied()
    }

    pub fn is_enabled(&self, kind: FeedKind) -> bool {
        match kind {
            FeedKind::Home => self.crawl_home,
            FeedKind::Digest => true,
        }
    }

    /// Feed kinds to crawl for this group, in processing order.
    pub fn enabled_kinds(&self) -> Vec<FeedKind> {
        FeedKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

fn default_checkpoint_file() -> String {
    "checkpoints.json".into()
}
fn default_send_delay_ms() -> u64 {
    2000
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_max_pages() -> usize {
    50
}
fn default_first_run_max_pages() -> usize {
    1
}
fn default_first_run_max_items() -> usize {
    20
}
fn default_base_url() -> String {
    "https://api.zsxq.com/v2/".into()
}
fn default_page_size() -> u32 {
    20
}
fn default_timeout_secs() -> u64 {
    30
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        Path::new(&self.app.resolved_data_dir()).join(&self.app.checkpoint_file)
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `ZSXQ_COOKIE` and `TELEGRAM_BOT_TOKEN` override the file when set.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Secrets usually live in the environment (or `.env`), not in the file.
fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(cookie) = present("ZSXQ_COOKIE") {
        cfg.zsxq.cookie = cookie;
    }
    if let Some(token) = present("TELEGRAM_BOT_TOKEN") {
        cfg.telegram.bot_token = token;
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.checkpoint_file.trim().is_empty() {
        return Err(ConfigError::Invalid("app.checkpoint_file must be non-empty"));
    }
    if cfg.app.crawl_interval_minutes == 0 {
        return Err(ConfigError::Invalid("app.crawl_interval_minutes must be > 0"));
    }
    if cfg.app.max_pages == 0 {
        return Err(ConfigError::Invalid("app.max_pages must be > 0"));
    }
    if cfg.app.first_run_max_pages == 0 || cfg.app.first_run_max_items == 0 {
        return Err(ConfigError::Invalid(
            "app.first_run_max_pages and app.first_run_max_items must be > 0",
        ));
    }

    if cfg.zsxq.cookie.trim().is_empty() {
        return Err(ConfigError::Invalid("zsxq.cookie must be non-empty (or set ZSXQ_COOKIE)"));
    }
    if cfg.zsxq.page_size == 0 {
        return Err(ConfigError::Invalid("zsxq.page_size must be > 0"));
    }
    if cfg.zsxq.timeout_secs == 0 {
        return Err(ConfigError::Invalid("zsxq.timeout_secs must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "telegram.bot_token must be non-empty (or set TELEGRAM_BOT_TOKEN)",
        ));
    }
    if cfg.telegram.chat_id == 0 {
        return Err(ConfigError::Invalid("telegram.chat_id must be set"));
    }

    if cfg.groups.is_empty() {
        return Err(ConfigError::Invalid("groups must list at least one group"));
    }
    let mut seen = HashSet::new();
    for group in &cfg.groups {
        if group.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("groups[].group_id must be non-empty"));
        }
        if !seen.insert(group.group_id.as_str()) {
            return Err(ConfigError::DuplicateGroup(group.group_id.clone()));
        }
    }

    Ok(())
}

/// Example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  checkpoint_file: "checkpoints.json"
  crawl_interval_minutes: 30
  send_delay_ms: 2000
  page_delay_ms: 1000
  max_pages: 50
  first_run_max_pages: 1
  first_run_max_items: 20

zsxq:
  base_url: "https://api.zsxq.com/v2/"
  cookie: "YOUR_ZSXQ_ACCESS_TOKEN"
  page_size: 20
  timeout_secs: 30

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  chat_id: -1001234567890
  error_thread_id: 3

groups:
  - group_id: "48415154841458"
    crawl_home: true
    thread_ids:
      home: 11
      digest: 12
  - group_id: "51111818455824"
    thread_ids:
      digest: 21
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.groups.len(), 2);
        assert_eq!(cfg.groups[0].thread_id(FeedKind::Home), Some(11));
        assert_eq!(cfg.groups[1].thread_id(FeedKind::Home), None);
        assert_eq!(cfg.telegram.error_thread_id, Some(3));
    }

    #[test]
    fn enabled_kinds_follow_crawl_home() {
        let cfg = example_cfg();
        assert_eq!(
            cfg.groups[0].enabled_kinds(),
            vec![FeedKind::Home, FeedKind::Digest]
        );
        assert_eq!(cfg.groups[1].enabled_kinds(), vec![FeedKind::Digest]);
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let yaml = r#"
app:
  data_dir: "./d"
  crawl_interval_minutes: 5
zsxq:
  cookie: "c"
telegram:
  bot_token: "t"
  chat_id: 42
groups:
  - group_id: "1"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.checkpoint_file, "checkpoints.json");
        assert_eq!(cfg.app.first_run_max_items, 20);
        assert_eq!(cfg.zsxq.base_url, "https://api.zsxq.com/v2/");
        assert_eq!(cfg.zsxq.page_size, 20);
        assert!(cfg.telegram.error_thread_id.is_none());
        assert!(!cfg.groups[0].crawl_home);
    }

    #[test]
    fn invalid_secrets() {
        let mut cfg = example_cfg();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.zsxq.cookie = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("zsxq.cookie")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_limits_and_groups() {
        let mut cfg = example_cfg();
        cfg.app.first_run_max_items = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.app.crawl_interval_minutes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.groups.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        let dup = cfg.groups[0].clone();
        cfg.groups.push(dup);
        match validate(&cfg).unwrap_err() {
            ConfigError::DuplicateGroup(id) => assert_eq!(id, "48415154841458"),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn environment_overrides_secrets() {
        let mut cfg = example_cfg();
        apply_overrides(&mut cfg, |key| match key {
            "ZSXQ_COOKIE" => Some("from-env".into()),
            "TELEGRAM_BOT_TOKEN" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.zsxq.cookie, "from-env");
        assert_eq!(cfg.telegram.bot_token, "YOUR_TELEGRAM_BOT_TOKEN");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert_eq!(cfg.checkpoint_path(), data_path.join("checkpoints.json"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.telegram.chat_id, -1001234567890);
        assert!(cfg.group("51111818455824").is_some());
    }
}
