//! Outbound contract to the chat platform.

use async_trait::async_trait;
use herald_common::{AppError, AppResult, TransportConfig};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{ErrorCode, TransportError};

/// Delivers one payload to one target.
///
/// Failures must describe themselves through [`TransportError`] so the rate
/// limiter and retry handler can classify them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `target`, returning the platform's response.
    async fn send(&self, target: &str, payload: &Value) -> Result<Value, TransportError>;
}

/// Headers copied onto [`TransportError`] for rate limit handling.
const RATE_LIMIT_HEADERS: &[&str] = &["retry-after", "x-ratelimit-reset-after"];

/// Transport posting JSON payloads to `{base_url}/channels/{target}/messages`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpTransport {
    /// Create an HTTP transport from configuration.
    pub fn new(config: &TransportConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    /// `target` is encoded as a single path segment.
    fn endpoint(&self, target: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                TransportError::new(format!("Base URL {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["channels", target, "messages"]);
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, target: &str, payload: &Value) -> Result<Value, TransportError> {
        let url = self.endpoint(target)?;
        debug!(url = %url, channel = %target, "Sending message");

        let mut request = self.client.post(url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.map_err(network_error)?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| TransportError::new(format!("Invalid response body: {e}")));
        }

        let mut error = TransportError::new(format!("HTTP {status}")).with_status(status.as_u16());
        for name in RATE_LIMIT_HEADERS {
            if let Some(value) = response
                .headers()
                .get(*name)
                .and_then(|value| value.to_str().ok())
            {
                error = error.with_header(name, value);
            }
        }

        // Platform error bodies look like {"code": 50013, "message": "...", "retry_after": 1.5}.
        let body = response.text().await.unwrap_or_default();
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(&body) {
            if let Some(message) = fields.get("message").and_then(Value::as_str) {
                error.message = format!("HTTP {status}: {message}");
            }
            match fields.get("code") {
                Some(Value::Number(code)) => error.code = code.as_i64().map(ErrorCode::Numeric),
                Some(Value::String(code)) => error.code = Some(ErrorCode::Named(code.clone())),
                _ => {}
            }
            if let Some(seconds) = fields.get("retry_after").and_then(Value::as_f64) {
                error.body_retry_after = Some(seconds);
            }
        }

        Err(error)
    }
}

/// Map a request failure onto the network codes the retry handler knows.
fn network_error(err: reqwest::Error) -> TransportError {
    let code = if err.is_timeout() {
        "ETIMEDOUT"
    } else if err.is_connect() {
        "ECONNREFUSED"
    } else {
        "ECONNRESET"
    };
    TransportError::new(format!("Network error: {err}")).with_code(code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> TransportConfig {
        TransportConfig {
            base_url: base_url.to_string(),
            token: Some("secret".to_string()),
            request_timeout_ms: 1000,
            user_agent: "herald-test".to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_target() {
        let transport = HttpTransport::new(&config("https://chat.example.com/api/v10")).unwrap();
        assert_eq!(
            transport.endpoint("123").unwrap().as_str(),
            "https://chat.example.com/api/v10/channels/123/messages"
        );

        let transport = HttpTransport::new(&config("https://chat.example.com/api/")).unwrap();
        assert_eq!(
            transport.endpoint("abc").unwrap().as_str(),
            "https://chat.example.com/api/channels/abc/messages"
        );
    }

    #[test]
    fn test_endpoint_encodes_target() {
        let transport = HttpTransport::new(&config("https://chat.example.com/api")).unwrap();

        let url = transport.endpoint("../../x").unwrap();
        assert_eq!(url.path(), "/api/channels/..%2F..%2Fx/messages");

        let url = transport.endpoint("a?b#c").unwrap();
        assert_eq!(url.path(), "/api/channels/a%3Fb%23c/messages");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpTransport::new(&config("not a url")).is_err());
    }

    #[tokio::test]
    #[ignore = "requires nothing listening on 127.0.0.1:9"]
    async fn test_unreachable_host_is_retryable_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let transport = HttpTransport::new(&config("http://127.0.0.1:9/api")).unwrap();
        let err = transport
            .send("123", &serde_json::json!({"content": "hi"}))
            .await
            .unwrap_err();

        assert!(err.code.is_some());
        assert!(err.message.starts_with("Network error"));
    }
}
