/*!
 * Common test utilities for the threadrelay test suite
 */

use anyhow::Result;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use threadrelay::app_config::{AccountConfig, Config, QueueSettings};
use threadrelay::database::Repository;
use threadrelay::platform::FetchedPost;



/// Route library logs to the test output; safe to call from every test
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates a temporary directory for test files
pub fn create_temp_dir() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

/// Fresh in-memory store
pub fn memory_store() -> Repository {
    Repository::new_in_memory().expect("in-memory database should open")
}

/// A feed post; `minute` orders posts in time
pub fn fetched_post(id: &str, author: &str, conversation: Option<&str>, minute: i64) -> FetchedPost {
    let base = Utc
        .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    FetchedPost {
        id: id.to_string(),
        author_id: author.to_string(),
        text: format!("post {}", id),
        conversation_id: conversation.map(str::to_string),
        created_at: base + ChronoDuration::minutes(minute),
    }
}

/// Write the spool file of one account
pub fn write_spool(dir: &Path, account: &str, posts: &[FetchedPost]) -> Result<PathBuf> {
    let path = dir.join(format!("{}.json", account));
    fs::write(&path, serde_json::to_string_pretty(posts)?)?;
    Ok(path)
}

/// Valid configuration for one account, with fast queues and the mock provider
pub fn test_config(accounts: &[(&str, &str)]) -> Config {
    let mut config = Config::default();
    config.accounts = accounts
        .iter()
        .map(|(name, uid)| AccountConfig::new(*name, *uid))
        .collect();
    config.translation.provider = threadrelay::app_config::ProviderKind::Mock;
    config.translation.queue = QueueSettings {
        concurrency: 2,
        max_retries: 2,
        retry_delay_ms: 10,
    };
    config.publish.queue = QueueSettings {
        concurrency: 1,
        max_retries: 0,
        retry_delay_ms: 10,
    };
    config
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async variant of [`eventually`], for checks that query the store
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
