//! The fetch module issues single GET requests against the portal and turns the
//! legacy-encoded response into a parsed XML fragment.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::COOKIE;
use thiserror::Error;
use url::Url;

use crate::config::PortalConfig;
use crate::xml::{XmlFragment, decode, parse_fragment};

/// Why a single fetch failed. Kinds are kept apart so callers can retry
/// timeouts and transient network failures without retrying bad data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Portal answered with HTTP {0}")]
    HttpStatus(u16),
    #[error("Unable to decode response: {0}")]
    Decode(String),
    #[error("Malformed XML: {0}")]
    Parse(String),
    #[error("Invalid request URL: {0}")]
    Url(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }

    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Network(_) => true,
            FetchError::HttpStatus(status) => *status >= 500,
            FetchError::Decode(_) | FetchError::Parse(_) | FetchError::Url(_) => false,
        }
    }
}

/// Query parameters of one request. `None` values are left out of the URL.
pub type QueryParams = Vec<(String, Option<String>)>;

/// Something that answers endpoint requests with XML fragments.
///
/// The orchestrator only talks to this trait, so tests can substitute a stub
/// portal for the HTTP client.
#[async_trait]
pub trait XmlSource: Send + Sync {
    /// Fetches one endpoint and parses the answer.
    ///
    /// # Errors
    ///
    /// Returns a `FetchError` describing which stage failed.
    async fn fetch_xml(
        &self,
        endpoint: &str,
        params: &[(String, Option<String>)],
        timeout: Duration,
    ) -> Result<XmlFragment, FetchError>;
}

/// HTTP implementation of `XmlSource` for the live portal.
pub struct PortalClient {
    client: reqwest::Client,
    base_url: String,
    base_path: String,
    encoding: String,
    cookie: Option<String>,
}

impl PortalClient {
    /// Creates a client for the portal described by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Portal descriptor with base URL, path and encoding
    /// * `cookie` - Session cookie of an already authenticated browser, forwarded verbatim
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &PortalConfig, cookie: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("RosterHarvest")
            .build()
            .context("Unable to build HTTP client")?;
        Self::with_http_client(config, cookie, client)
    }

    /// Same as `new`, over a caller-built `reqwest::Client` (proxy or TLS setup).
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn with_http_client(
        config: &PortalConfig,
        cookie: Option<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        Url::parse(&config.base_url)
            .with_context(|| format!("Invalid portal base URL: {}", config.base_url))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            base_path: config.base_path.clone(),
            encoding: config.encoding.clone(),
            cookie,
        })
    }

    async fn fetch_bytes(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        let bytes = response.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl XmlSource for PortalClient {
    async fn fetch_xml(
        &self,
        endpoint: &str,
        params: &[(String, Option<String>)],
        timeout: Duration,
    ) -> Result<XmlFragment, FetchError> {
        let url = build_url(&self.base_url, &self.base_path, endpoint, params)?;
        debug!("GET {url}");

        let bytes = tokio::time::timeout(timeout, self.fetch_bytes(url))
            .await
            .map_err(|_| FetchError::Timeout(millis(timeout)))??;

        let text = decode(&bytes, &self.encoding)?;
        parse_fragment(&text)
    }
}

/// Joins base URL, base path and endpoint, then appends the present parameters.
///
/// # Errors
///
/// Returns `FetchError::Url` if the joined string is not a valid URL.
pub fn build_url(
    base_url: &str,
    base_path: &str,
    endpoint: &str,
    params: &[(String, Option<String>)],
) -> Result<Url, FetchError> {
    let path = [base_path, endpoint]
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let joined = format!("{}/{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&joined).map_err(|e| FetchError::Url(format!("{joined}: {e}")))?;

    let present: Vec<(&str, &str)> = params
        .iter()
        .filter_map(|(name, value)| value.as_deref().map(|value| (name.as_str(), value)))
        .collect();
    if !present.is_empty() {
        url.query_pairs_mut().extend_pairs(present);
    }

    Ok(url)
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(0)
    } else if let Some(status) = error.status() {
        FetchError::HttpStatus(status.as_u16())
    } else {
        FetchError::Network(error.to_string())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
