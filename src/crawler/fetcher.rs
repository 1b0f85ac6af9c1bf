//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests made by the orchestrator and the
//! analyzer, including:
//! - Building HTTP clients with a proper user agent string
//! - The [`Fetcher`] seam, so tests and other transports can stand in for HTTP
//! - Bounded retries for transient failures
//!
//! Non-2xx responses are not errors here. Every response, whatever its status,
//! is handed back so the rate limit detector can look at it.

use crate::config::UserAgentConfig;
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A fetched response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final URL after redirects
    pub url: String,
    /// HTTP status code
    pub status: u16,
    /// Response headers, keyed by lowercased name
    pub headers: HashMap<String, String>,
    /// Response body decoded as text
    pub body: String,
}

impl FetchResponse {
    /// Looks up a header by name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Errors raised when no response could be obtained at all
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Returns true for failures worth retrying after a short pause
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_) | Self::Body(_))
    }
}

/// Fetches pages
///
/// Implementations must return every HTTP response (including 4xx/5xx) as
/// `Ok`, and only fail when there is no response.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use multicrawl::config::UserAgentConfig;
/// use multicrawl::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "Multicrawl".to_string(),
///     crawler_version: "0.3".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// [`Fetcher`] backed by `reqwest`
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchResponse, FetchError> {
        // The timeout covers the body read as well as the request
        let request = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| classify_reqwest_error(e, timeout))?;

            let status = response.status().as_u16();
            let final_url = response.url().to_string();

            let mut headers: HashMap<String, String> = HashMap::new();
            for (name, value) in response.headers() {
                let Ok(value) = value.to_str() else {
                    continue;
                };
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .and_modify(|existing| {
                        existing.push_str(", ");
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.to_string());
            }

            let body = response
                .text()
                .await
                .map_err(|e| FetchError::Body(e.to_string()))?;

            Ok::<_, FetchError>(FetchResponse {
                url: final_url,
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else if e.is_connect() {
        FetchError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        FetchError::Body(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

/// Fetches `url`, retrying transient failures
///
/// # Arguments
///
/// * `fetcher` - The fetcher to use
/// * `url` - The URL to fetch
/// * `timeout` - Per-attempt timeout
/// * `retries` - Extra attempts after the first one
/// * `retry_delay` - Pause between attempts
///
/// # Returns
///
/// The first response obtained, or the last error once retries are exhausted
pub async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
) -> Result<FetchResponse, FetchError> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(url, timeout).await {
            Ok(response) => {
                debug!(url = %url, status = response.status, "Fetched");
                return Ok(response);
            }
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(url = %url, attempt, error = %e, "Transient fetch failure, retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
