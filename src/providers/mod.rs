/*!
 * Translation providers.
 *
 * - `http`: JSON-over-HTTP translation endpoint
 * - `mock`: in-process provider with scripted behaviour, used by tests and
 *   local runs
 */

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::app_config::{ProviderKind, TranslationConfig};
use crate::errors::ProviderError;

pub mod http;
pub mod mock;

pub use http::HttpTranslator;
pub use mock::{MockBehavior, MockProvider};

/// Common trait for all translation providers
///
/// Implementations are shared between the per-account translation
/// processors, so they must be usable concurrently.
#[async_trait]
pub trait TranslationProvider: Send + Sync + Debug {
    /// Translate one text
    ///
    /// # Arguments
    /// * `text` - The text to translate
    /// * `source_language` - ISO 639-1 code of `text`
    /// * `target_language` - ISO 639-1 code to translate into
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// Build the provider selected by the configuration
pub fn build_provider(config: &TranslationConfig) -> Result<Arc<dyn TranslationProvider>> {
    match config.provider {
        ProviderKind::Http => Ok(Arc::new(HttpTranslator::new(
            &config.endpoint,
            Duration::from_secs(config.timeout_secs),
        )?)),
        ProviderKind::Mock => Ok(Arc::new(MockProvider::working())),
    }
}
