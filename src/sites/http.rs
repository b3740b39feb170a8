//! HTTP plumbing shared by site adapters and the downloader

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Error types for HTTP fetches
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Response exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for HTTP fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// Retry settings for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay_ms: 1000 }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at one minute
    pub fn backoff(&self, attempt: usize) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let delay = (1u64 << exponent).saturating_mul(self.base_delay_ms);
        delay.min(60_000)
    }
}

/// Build the shared client with a bounded per-request timeout
pub fn build_client(user_agent: &str, timeout: Duration) -> FetchResult<Client> {
    let client = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// GET with retries on network errors, 429 and 5xx responses.
///
/// Other non-success statuses are returned immediately as `FetchError::Status`.
pub async fn get_with_retry(client: &Client, url: &str, policy: RetryPolicy) -> FetchResult<Response> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        if attempts > 1 {
            info!("Retry attempt {}/{} for {}", attempts, policy.attempts, url);
        }

        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request error: {}", e);
                if attempts >= policy.attempts {
                    return Err(FetchError::Request(e));
                }
                let backoff = policy.backoff(attempts);
                debug!("Backing off for {}ms before retry", backoff);
                sleep(Duration::from_millis(backoff)).await;
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
        if !retryable || attempts >= policy.attempts {
            return Err(FetchError::Status { status: status.as_u16(), url: url.to_string() });
        }

        let backoff = if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            match retry_after {
                Some(secs) => secs.saturating_mul(1000).min(60_000),
                None => policy.backoff(attempts),
            }
        } else {
            policy.backoff(attempts)
        };
        warn!("HTTP {} from {}, backing off for {}ms", status, url, backoff);
        sleep(Duration::from_millis(backoff)).await;
    }
}

/// Downloads media bytes
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResult<Vec<u8>>;
}

/// `MediaFetcher` over HTTP with a size cap
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
    max_bytes: u64,
}

impl HttpFetcher {
    /// Create a new fetcher; `max_bytes` of 0 disables the cap
    pub fn new(client: Client, policy: RetryPolicy, max_bytes: u64) -> Self {
        Self { client, policy, max_bytes }
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchResult<Vec<u8>> {
        let response = get_with_retry(&self.client, url, self.policy).await?;

        if self.max_bytes > 0 {
            if let Some(len) = response.content_length() {
                if len > self.max_bytes {
                    return Err(FetchError::TooLarge { limit: self.max_bytes });
                }
            }
        }

        let mut bytes = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes.extend_from_slice(&chunk);
            if self.max_bytes > 0 && bytes.len() as u64 > self.max_bytes {
                return Err(FetchError::TooLarge { limit: self.max_bytes });
            }
        }

        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy { attempts: 5, base_delay_ms: 500 };
        assert_eq!(policy.backoff(1), 500);
        assert_eq!(policy.backoff(2), 1000);
        assert_eq!(policy.backoff(3), 2000);
        assert_eq!(policy.backoff(40), 60_000);
    }

    #[test]
    fn test_status_accessor() {
        let err = FetchError::Status { status: 404, url: "https://x".to_string() };
        assert_eq!(err.status(), Some(404));
        assert_eq!(FetchError::TooLarge { limit: 1 }.status(), None);
    }
}
