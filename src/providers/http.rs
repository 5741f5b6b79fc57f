/*!
 * Client for a JSON translation endpoint.
 *
 * Request: `POST <endpoint>` with `{"text", "source_lang", "target_lang"}`.
 * Response: `{"translated_text": "..."}`. A 429 answer becomes
 * `ProviderError::RateLimitExceeded`, carrying the `Retry-After` seconds
 * when the server sends them.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::TranslationProvider;
use crate::errors::ProviderError;

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    source_lang: &'a str,
    target_lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translated_text: Option<String>,
}

/// HTTP translation client
#[derive(Debug, Clone)]
pub struct HttpTranslator {
    endpoint: Url,
    client: Client,
}

impl HttpTranslator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid translation endpoint: {}", endpoint))?;
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Seconds from a `Retry-After` header given in delta-seconds form
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[async_trait]
impl TranslationProvider for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError> {
        let request = TranslateRequest {
            text,
            source_lang: source_language,
            target_lang: target_language,
        };

        debug!(
            "Translating {} chars {} -> {} via {}",
            text.chars().count(),
            source_language,
            target_language,
            self.endpoint
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::ConnectionError(e.to_string())
                } else {
                    ProviderError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_secs(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimitExceeded {
                message,
                retry_after_secs: retry_after,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::AuthenticationError(message));
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to get error response text".to_string());
            error!("Translation API error ({}): {}", status, message);
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        body.translated_text
            .ok_or_else(|| ProviderError::ParseError("missing translated_text".to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}
