/*!
 * Mock translation provider.
 *
 * - `MockProvider::working()` - Always succeeds
 * - `MockProvider::failing()` - Always fails with an API error
 * - `MockProvider::fail_first(n)` - Fails the first `n` requests, then succeeds
 * - `MockProvider::intermittent(n)` - Fails every `n`-th request
 * - `MockProvider::slow(ms)` - Succeeds after a delay
 */

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::TranslationProvider;
use crate::errors::ProviderError;

/// Behavior mode for the mock provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    Working,
    Failing,
    FailFirst { failures: usize },
    Intermittent { fail_every: usize },
    Slow { delay_ms: u64 },
}

/// Mock provider. Clones share the request counter.
#[derive(Debug, Clone)]
pub struct MockProvider {
    behavior: MockBehavior,
    request_count: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn working() -> Self {
        Self::new(MockBehavior::Working)
    }

    pub fn failing() -> Self {
        Self::new(MockBehavior::Failing)
    }

    pub fn fail_first(failures: usize) -> Self {
        Self::new(MockBehavior::FailFirst { failures })
    }

    pub fn intermittent(fail_every: usize) -> Self {
        Self::new(MockBehavior::Intermittent {
            fail_every: fail_every.max(1),
        })
    }

    pub fn slow(delay_ms: u64) -> Self {
        Self::new(MockBehavior::Slow { delay_ms })
    }

    /// Number of translate calls received so far
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Text produced for a successful translation
    pub fn translated(text: &str, target_language: &str) -> String {
        format!("[{}] {}", target_language, text)
    }

    fn simulated_failure() -> ProviderError {
        ProviderError::ApiError {
            status_code: 503,
            message: "Simulated provider failure".to_string(),
        }
    }
}

#[async_trait]
impl TranslationProvider for MockProvider {
    async fn translate(
        &self,
        text: &str,
        _source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            MockBehavior::Working => Ok(Self::translated(text, target_language)),
            MockBehavior::Failing => Err(Self::simulated_failure()),
            MockBehavior::FailFirst { failures } => {
                if count < failures {
                    Err(Self::simulated_failure())
                } else {
                    Ok(Self::translated(text, target_language))
                }
            }
            MockBehavior::Intermittent { fail_every } => {
                if count % fail_every == fail_every - 1 {
                    Err(Self::simulated_failure())
                } else {
                    Ok(Self::translated(text, target_language))
                }
            }
            MockBehavior::Slow { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(Self::translated(text, target_language))
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
