/*!
 * Tests for translation provider implementations
 */

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use threadrelay::app_config::{ProviderKind, TranslationConfig};
use threadrelay::errors::ProviderError;
use threadrelay::providers::{HttpTranslator, MockProvider, TranslationProvider, build_provider};

/// Serve one canned HTTP response on a local port; returns the endpoint URL
/// and a handle yielding the raw request
async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = socket.read(&mut buffer).await.unwrap();
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buffer[..read]);
            if request_complete(&request) {
                break;
            }
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).to_string()
    });

    (format!("http://{}/translate", address), handle)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}

fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status,
        body.len(),
        extra_headers,
        body
    )
}

fn translator(endpoint: &str) -> HttpTranslator {
    HttpTranslator::new(endpoint, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_httpTranslator_success_shouldReturnTranslatedText() {
    let (endpoint, server) =
        serve_once(http_response("200 OK", "", r#"{"translated_text":"你好"}"#)).await;

    let result = translator(&endpoint).translate("hello", "en", "zh").await;
    assert_eq!(result.unwrap(), "你好");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /translate"));
    assert!(request.contains(r#""text":"hello""#));
    assert!(request.contains(r#""source_lang":"en""#));
    assert!(request.contains(r#""target_lang":"zh""#));
}

#[tokio::test]
async fn test_httpTranslator_rateLimited_shouldCarryRetryAfter() {
    let (endpoint, _server) = serve_once(http_response(
        "429 Too Many Requests",
        "Retry-After: 12\r\n",
        r#"{"error":"slow down"}"#,
    ))
    .await;

    let error = translator(&endpoint)
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();
    match error {
        ProviderError::RateLimitExceeded {
            retry_after_secs, ..
        } => assert_eq!(retry_after_secs, Some(12)),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_httpTranslator_unauthorized_shouldBeAuthenticationError() {
    let (endpoint, _server) =
        serve_once(http_response("401 Unauthorized", "", r#"{"error":"bad key"}"#)).await;

    let error = translator(&endpoint)
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();
    assert!(matches!(error, ProviderError::AuthenticationError(_)));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_httpTranslator_serverError_shouldBeRetryableApiError() {
    let (endpoint, _server) =
        serve_once(http_response("503 Service Unavailable", "", r#"{"error":"busy"}"#)).await;

    let error = translator(&endpoint)
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ProviderError::ApiError {
            status_code: 503,
            ..
        }
    ));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_httpTranslator_missingField_shouldBeParseError() {
    let (endpoint, _server) = serve_once(http_response("200 OK", "", r#"{"text":"?"}"#)).await;

    let error = translator(&endpoint)
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();
    assert!(matches!(error, ProviderError::ParseError(_)));
}

#[tokio::test]
async fn test_httpTranslator_unreachable_shouldBeConnectionError() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let error = translator(&format!("http://{}/translate", address))
        .translate("hello", "en", "zh")
        .await
        .unwrap_err();
    assert!(matches!(error, ProviderError::ConnectionError(_)));
}

#[tokio::test]
async fn test_mockProvider_working_shouldTagTargetLanguage() {
    let provider = MockProvider::working();
    let result = provider.translate("hello", "en", "fr").await.unwrap();
    assert_eq!(result, MockProvider::translated("hello", "fr"));
    assert_eq!(result, "[fr] hello");
    assert_eq!(provider.request_count(), 1);
    assert_eq!(provider.name(), "mock");
}

#[tokio::test]
async fn test_mockProvider_failFirst_shouldRecoverAfterFailures() {
    let provider = MockProvider::fail_first(2);
    assert!(provider.translate("a", "en", "fr").await.is_err());
    assert!(provider.translate("a", "en", "fr").await.is_err());
    assert!(provider.translate("a", "en", "fr").await.is_ok());
    assert_eq!(provider.request_count(), 3);
}

#[tokio::test]
async fn test_mockProvider_intermittent_shouldFailEveryNth() {
    let provider = MockProvider::intermittent(3);
    let mut outcomes = Vec::new();
    for _ in 0..6 {
        outcomes.push(provider.translate("a", "en", "fr").await.is_ok());
    }
    assert_eq!(outcomes, vec![true, true, false, true, true, false]);
}

#[tokio::test]
async fn test_mockProvider_clones_shouldShareRequestCount() {
    let provider = MockProvider::failing();
    let clone = provider.clone();
    let _ = clone.translate("a", "en", "fr").await;
    assert_eq!(provider.request_count(), 1);
}

#[test]
fn test_buildProvider_shouldFollowConfiguredKind() {
    let mut config = TranslationConfig::default();
    assert_eq!(build_provider(&config).unwrap().name(), "http");

    config.provider = ProviderKind::Mock;
    assert_eq!(build_provider(&config).unwrap().name(), "mock");

    config.provider = ProviderKind::Http;
    config.endpoint = "::nonsense::".to_string();
    assert!(build_provider(&config).is_err());
}
