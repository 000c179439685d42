use crate::config::NetworkConfig;
use crate::error::ValidationError;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds (for exponential backoff cap)
    pub max_retry_delay_ms: u64,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            user_agent: format!("xml-conformance/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&NetworkConfig> for HttpClientConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            timeout_seconds: network.timeout_seconds,
            retry_attempts: network.retry_attempts,
            retry_delay_ms: network.retry_delay_ms,
            ..Self::default()
        }
    }
}

/// Source of remote artifact bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ValidationError>;
}

/// Timeouts, connection failures and 5xx answers are worth another try; 4xx are not
fn is_transient(error: &ValidationError) -> bool {
    match error {
        ValidationError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        ValidationError::Timeout { .. } => true,
        ValidationError::HttpStatus { status, .. } => (500..600).contains(status),
        _ => false,
    }
}

/// Async HTTP client for downloading remote schemas and rule sets
pub struct AsyncHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl AsyncHttpClient {
    /// Create a new async HTTP client with the given configuration
    pub fn new(config: HttpClientConfig) -> Result<Self, ValidationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ValidationError::from)?;

        Ok(Self { client, config })
    }

    /// Download an artifact, retrying transient failures with exponential backoff
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, ValidationError> {
        let mut attempt = 0;
        let response = loop {
            match self.attempt(url).await {
                Ok(response) => break response,
                Err(error) if attempt < self.config.retry_attempts && is_transient(&error) => {
                    warn!(
                        "Fetching {} failed ({}), attempt {} of {}",
                        url,
                        error,
                        attempt + 1,
                        self.config.retry_attempts + 1
                    );
                    sleep(self.retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        };
        let bytes = response.bytes().await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    /// One GET bounded by the configured timeout; non-2xx statuses are errors
    async fn attempt(&self, url: &str) -> Result<Response, ValidationError> {
        let response = timeout(
            Duration::from_secs(self.config.timeout_seconds),
            self.client.get(url).send(),
        )
        .await
        .map_err(|_| ValidationError::Timeout {
            url: url.to_string(),
            timeout_seconds: self.config.timeout_seconds,
        })??;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(ValidationError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("Unknown").to_string(),
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.config.max_retry_delay_ms))
    }

    /// Get the client configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

#[async_trait]
impl RemoteFetcher for AsyncHttpClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ValidationError> {
        self.download(url).await
    }
}
