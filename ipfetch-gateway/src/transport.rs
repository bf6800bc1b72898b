//! Gateway endpoints and the transport that talks to them.

use std::time::Duration;

use async_trait::async_trait;
use ipfetch_core::{ConfigError, FailureReason, RawPayload};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;

/// One configured gateway. Lower `priority` is tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayEndpoint {
    pub base_url: String,
    pub priority: usize,
}

impl GatewayEndpoint {
    pub fn new(base_url: impl Into<String>, priority: usize) -> Self {
        Self {
            base_url: base_url.into(),
            priority,
        }
    }

    /// Endpoints from an ordered list of base URLs; list position is priority.
    pub fn from_urls<I, S>(urls: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(priority, url)| Self::new(url, priority))
            .collect()
    }

    /// `{base_url}/{cid}` with exactly one separating slash.
    pub fn url_for(&self, cid: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), cid)
    }
}

/// Issues a single GET against one gateway.
///
/// Implementations report any non-success outcome as a [`FailureReason`];
/// the resolver decides whether to fall back. Per-attempt timeouts are
/// applied by the resolver, not the transport.
#[async_trait]
pub trait GatewayTransport: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, endpoint: &GatewayEndpoint, cid: &str)
        -> Result<RawPayload, FailureReason>;
}

/// reqwest-backed transport for real gateways.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client whose own timeout backs up the resolver's.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ipfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "http_client".to_string(),
                value: format!("timeout={}ms", timeout.as_millis()),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn fetch(
        &self,
        endpoint: &GatewayEndpoint,
        cid: &str,
    ) -> Result<RawPayload, FailureReason> {
        let url = endpoint.url_for(cid);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FailureReason::Transport {
                message: format!("HTTP request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FailureReason::HttpStatus {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FailureReason::Transport {
                message: format!("Failed to read body: {}", e),
            })?;

        let mut payload = RawPayload::new(bytes.to_vec()).with_source(endpoint.base_url.clone());
        payload.content_type = content_type;
        Ok(payload)
    }
}
