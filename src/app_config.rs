use anyhow::{Context, Result, anyhow};
use isolang::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::queue::QueueConfig;

/// Application configuration module
/// This module handles loading, validating and saving the pipeline settings.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Language of the ingested posts (ISO 639-1)
    #[serde(default = "default_source_language")]
    pub source_language: String,

    /// Language posts are translated into (ISO 639-1)
    #[serde(default = "default_target_language")]
    pub target_language: String,

    /// Accounts the pipeline monitors and publishes for
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub analyze: ScheduleConfig,

    #[serde(default)]
    pub translation: TranslationConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    /// SQLite file; the platform data directory is used when absent
    #[serde(default)]
    pub database_path: Option<String>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// One monitored account
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccountConfig {
    /// Unique name; also the key of the account's stage services
    pub name: String,

    /// Platform user id whose threads belong to this account
    pub target_user_id: String,

    /// Platform access token (may be empty for local feeds)
    #[serde(default = "String::new")]
    pub token: String,
}

impl AccountConfig {
    pub fn new(name: impl Into<String>, target_user_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_user_id: target_user_id.into(),
            token: String::new(),
        }
    }
}

/// Ingestion settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IngestConfig {
    /// Seconds between two feed polls
    #[serde(default = "default_ingest_interval_secs")]
    pub interval_secs: u64,

    /// Maximum number of posts fetched per poll
    #[serde(default = "default_max_posts_per_request")]
    pub max_posts_per_request: usize,

    /// Directory holding `<account>.json` feed files
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ingest_interval_secs(),
            max_posts_per_request: default_max_posts_per_request(),
            spool_dir: default_spool_dir(),
        }
    }
}

/// Fallback timer of a stage without other settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
        }
    }
}

/// Translation provider type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON-over-HTTP translation endpoint
    #[default]
    Http,
    /// In-process provider echoing tagged text
    Mock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "mock" => Ok(Self::Mock),
            _ => Err(anyhow!("Invalid provider type: {}", s)),
        }
    }
}

/// Settings of one task queue
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    /// Maximum number of tasks processed at the same time
    pub concurrency: usize,

    /// Re-attempts after the first failure
    pub max_retries: u32,

    /// Base backoff delay, doubled on each retry
    pub retry_delay_ms: u64,
}

impl QueueSettings {
    /// Runtime queue configuration named `name`
    pub fn to_queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig::new(
            name,
            self.concurrency,
            self.max_retries,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

/// Translation stage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranslationConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    /// Service URL (HTTP provider)
    #[serde(default = "default_translation_endpoint")]
    pub endpoint: String,

    /// Request timeout in seconds
    #[serde(default = "default_translation_timeout_secs")]
    pub timeout_secs: u64,

    /// Seconds between two fallback scans for analyzed threads
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_translation_queue")]
    pub queue: QueueSettings,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            endpoint: default_translation_endpoint(),
            timeout_secs: default_translation_timeout_secs(),
            scan_interval_secs: default_scan_interval_secs(),
            queue: default_translation_queue(),
        }
    }
}

/// Publication stage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PublishConfig {
    /// Log posts instead of sending them
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Seconds between two fallback scans for translated threads
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Longest platform rate-limit reset the publisher waits out in place
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,

    #[serde(default = "default_publish_queue")]
    pub queue: QueueSettings,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            scan_interval_secs: default_scan_interval_secs(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
            queue: default_publish_queue(),
        }
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_source_language() -> String {
    "en".to_string()
}

fn default_target_language() -> String {
    "zh".to_string()
}

fn default_ingest_interval_secs() -> u64 {
    900 // 15 minutes keeps well inside typical read quotas
}

fn default_max_posts_per_request() -> usize {
    5
}

fn default_spool_dir() -> String {
    "spool".to_string()
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_translation_endpoint() -> String {
    "http://localhost:8080/translate".to_string()
}

fn default_translation_timeout_secs() -> u64 {
    5
}

fn default_translation_queue() -> QueueSettings {
    QueueSettings {
        concurrency: 2,
        max_retries: 3,
        retry_delay_ms: 1000,
    }
}

fn default_publish_queue() -> QueueSettings {
    // One post at a time per account, no blind retries
    QueueSettings {
        concurrency: 1,
        max_retries: 0,
        retry_delay_ms: 5000,
    }
}

fn default_max_rate_limit_wait_secs() -> u64 {
    900
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config to JSON")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config to file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        validate_language(&self.source_language)?;
        validate_language(&self.target_language)?;

        if self.accounts.is_empty() {
            return Err(anyhow!("At least one account must be configured"));
        }

        let mut names = HashSet::new();
        let mut user_ids = HashSet::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                return Err(anyhow!("Account name must not be empty"));
            }
            if account.target_user_id.trim().is_empty() {
                return Err(anyhow!(
                    "Account '{}' has an empty target_user_id",
                    account.name
                ));
            }
            if !names.insert(account.name.as_str()) {
                return Err(anyhow!("Duplicate account name: {}", account.name));
            }
            if !user_ids.insert(account.target_user_id.as_str()) {
                return Err(anyhow!(
                    "Duplicate target_user_id: {}",
                    account.target_user_id
                ));
            }
        }

        if self.translation.provider == ProviderKind::Http {
            let endpoint = url::Url::parse(&self.translation.endpoint).with_context(|| {
                format!(
                    "Invalid translation endpoint: {}",
                    self.translation.endpoint
                )
            })?;
            if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
                return Err(anyhow!(
                    "Translation endpoint must use http or https: {}",
                    self.translation.endpoint
                ));
            }
        }

        for (name, queue) in [
            ("translation", &self.translation.queue),
            ("publish", &self.publish.queue),
        ] {
            if queue.concurrency == 0 {
                return Err(anyhow!("The {} queue concurrency must be at least 1", name));
            }
        }

        for (name, secs) in [
            ("ingest.interval_secs", self.ingest.interval_secs),
            ("analyze.interval_secs", self.analyze.interval_secs),
            (
                "translation.scan_interval_secs",
                self.translation.scan_interval_secs,
            ),
            ("publish.scan_interval_secs", self.publish.scan_interval_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{} must be at least 1 second", name));
            }
        }

        if self.ingest.max_posts_per_request == 0 {
            return Err(anyhow!("ingest.max_posts_per_request must be at least 1"));
        }

        Ok(())
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

fn validate_language(code: &str) -> Result<()> {
    let normalized = code.trim().to_lowercase();
    if normalized.len() == 2 && Language::from_639_1(&normalized).is_some() {
        Ok(())
    } else {
        Err(anyhow!("Invalid language code: {}", code))
    }
}

/// Default implementation for Config
impl Default for Config {
    fn default() -> Self {
        Config {
            source_language: default_source_language(),
            target_language: default_target_language(),
            accounts: vec![AccountConfig::new("default", "0")],
            ingest: IngestConfig::default(),
            analyze: ScheduleConfig::default(),
            translation: TranslationConfig::default(),
            publish: PublishConfig::default(),
            database_path: None,
            log_level: LogLevel::default(),
        }
    }
}
