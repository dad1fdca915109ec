//! HTTP client with rate limiting awareness.
//!
//! Wraps `reqwest` with:
//! - Rate limit tracking from `X-RateLimit-*` response headers
//! - Throttling when approaching the limit
//! - A total request timeout and optional HTTP proxy from settings
//! - Status mapping into [`FalconError`] so callers never see `reqwest` errors

use crate::config::{AppConfig, NetworkConfig, NetworkSettings};
use crate::error::{FalconError, Result};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Rate limit state extracted from response headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    /// Unix timestamp when the window resets.
    pub reset: Option<u64>,
}

impl RateLimitState {
    /// Throttle when fewer than 10% of the window's requests remain.
    pub fn should_throttle(&self) -> bool {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                let threshold = (limit as f64 * 0.1) as u64;
                remaining < threshold.max(1)
            }
            _ => false,
        }
    }
}

/// Construction options for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: NetworkConfig::REQUEST_TIMEOUT,
            connect_timeout: NetworkConfig::CONNECT_TIMEOUT,
            proxy: None,
            user_agent: AppConfig::USER_AGENT.to_string(),
        }
    }
}

impl From<&NetworkSettings> for HttpClientOptions {
    fn from(settings: &NetworkSettings) -> Self {
        let timeout = settings.timeout();
        Self {
            timeout,
            connect_timeout: timeout.min(NetworkConfig::CONNECT_TIMEOUT),
            proxy: settings.proxy.url(),
            ..Self::default()
        }
    }
}

/// HTTP client with rate limiting awareness.
pub struct HttpClient {
    client: Client,
    rate_limit_remaining: AtomicI64,
    rate_limit_limit: AtomicU64,
    rate_limit_reset: AtomicU64,
    default_timeout: Duration,
    throttle_delay: Duration,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("timeout", &self.default_timeout)
            .field("rate_limit", &self.rate_limit_state())
            .finish()
    }
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_options(HttpClientOptions::default())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Self::with_options(HttpClientOptions {
            timeout,
            connect_timeout: timeout.min(NetworkConfig::CONNECT_TIMEOUT),
            ..HttpClientOptions::default()
        })
    }

    pub fn with_options(options: HttpClientOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent);

        if let Some(proxy_url) = options.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| FalconError::Config {
                message: format!("Invalid proxy {}: {}", proxy_url, e),
            })?;
            debug!("Routing HTTP traffic through proxy {}", proxy_url);
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| FalconError::Network {
            message: "Failed to create HTTP client".to_string(),
            cause: Some(e.to_string()),
        })?;

        Ok(Self {
            client,
            rate_limit_remaining: AtomicI64::new(-1),
            rate_limit_limit: AtomicU64::new(0),
            rate_limit_reset: AtomicU64::new(0),
            default_timeout: options.timeout,
            throttle_delay: NetworkConfig::THROTTLE_DELAY,
        })
    }

    /// Underlying `reqwest` client, used to build requests for [`send`](Self::send).
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        let remaining = self.rate_limit_remaining.load(Ordering::SeqCst);
        let limit = self.rate_limit_limit.load(Ordering::SeqCst);
        let reset = self.rate_limit_reset.load(Ordering::SeqCst);
        RateLimitState {
            remaining: (remaining >= 0).then_some(remaining as u64),
            limit: (limit > 0).then_some(limit),
            reset: (reset > 0).then_some(reset),
        }
    }

    /// Make a GET request.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send(self.client.get(url), url).await
    }

    /// Send a prepared request. `url` is used for error context only.
    ///
    /// Non-success statuses become [`FalconError::RateLimited`] (429) or
    /// [`FalconError::Http`].
    pub async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        self.maybe_throttle().await;

        let response = request.send().await.map_err(|e| self.map_send_error(e, url))?;

        self.update_rate_limits(&response);
        self.check_response_status(response, url)
    }

    /// Map a transport error raised while sending or reading a body.
    pub fn map_send_error(&self, err: reqwest::Error, url: &str) -> FalconError {
        if err.is_timeout() {
            FalconError::Timeout(self.default_timeout)
        } else {
            FalconError::Network {
                message: format!("Request to {} failed", url),
                cause: Some(
                    std::error::Error::source(&err)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| err.to_string()),
                ),
            }
        }
    }

    async fn maybe_throttle(&self) {
        let state = self.rate_limit_state();
        if state.should_throttle() {
            warn!(
                "Rate limit approaching (remaining: {:?}/{:?}), throttling for {:?}",
                state.remaining, state.limit, self.throttle_delay
            );
            tokio::time::sleep(self.throttle_delay).await;
        }
    }

    fn update_rate_limits(&self, response: &Response) {
        let headers = response.headers();
        let parse = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);

        if let Some(num) = parse("X-RateLimit-Remaining").and_then(|v| v.parse::<i64>().ok()) {
            self.rate_limit_remaining.store(num, Ordering::SeqCst);
        }
        if let Some(num) = parse("X-RateLimit-Limit").and_then(|v| v.parse::<u64>().ok()) {
            self.rate_limit_limit.store(num, Ordering::SeqCst);
        }
        if let Some(num) = parse("X-RateLimit-Reset").and_then(|v| v.parse::<u64>().ok()) {
            self.rate_limit_reset.store(num, Ordering::SeqCst);
        }
    }

    fn check_response_status(&self, response: Response, url: &str) -> Result<Response> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());

            return Err(FalconError::RateLimited {
                service: extract_domain(url),
                retry_after_secs: retry_after,
            });
        }

        debug!("HTTP {} from {}", status.as_u16(), url);
        Err(FalconError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Extract the host from a URL.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySettings;

    #[test]
    fn test_rate_limit_state_throttle() {
        let low = RateLimitState {
            remaining: Some(5),
            limit: Some(100),
            reset: None,
        };
        assert!(low.should_throttle());

        let plenty = RateLimitState {
            remaining: Some(50),
            limit: Some(100),
            reset: None,
        };
        assert!(!plenty.should_throttle());
        assert!(!RateLimitState::default().should_throttle());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://yande.re/post.json?tags=x"), "yande.re");
        assert_eq!(extract_domain("invalid-url"), "unknown");
    }

    #[tokio::test]
    async fn test_options_from_settings() {
        let settings = NetworkSettings {
            timeout_secs: 5,
            proxy: ProxySettings {
                enabled: true,
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            ..NetworkSettings::default()
        };
        let options = HttpClientOptions::from(&settings);
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.proxy.as_deref(), Some("http://127.0.0.1:8080"));

        let client = HttpClient::with_options(options).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(5));
        assert_eq!(client.rate_limit_state().remaining, None);
    }

    #[tokio::test]
    async fn test_closed_port_is_network_error() {
        let client = HttpClient::with_timeout(Duration::from_secs(2)).unwrap();
        let err = client.get("http://127.0.0.1:1/nothing").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
