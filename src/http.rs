//! Outbound JSON-over-HTTP for providers
//!
//! Every request runs under an explicit timeout; when it elapses the
//! in-flight future is dropped and the call fails with [`Error::Timeout`].

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::trace;

use crate::config::{HttpConfig, ProviderSettings};
use crate::{Error, Result};

/// Build the shared reqwest client
pub fn build_client(config: &HttpConfig) -> Result<Client> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(config.timeout)
        .build()
        .map_err(Error::Http)
}

/// JSON fetcher bound to one provider's name, base URL and timeout
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    provider: String,
    base_url: String,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher for a provider
    #[must_use]
    pub fn new(client: Client, settings: &ProviderSettings) -> Self {
        Self {
            client,
            provider: settings.name.clone(),
            base_url: settings.base_url.clone(),
            timeout: settings.timeout,
        }
    }

    /// Provider base URL (no trailing slash)
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path under the base URL
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Start a GET request for a path under the base URL
    #[must_use]
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    /// Start a POST request to an absolute URL
    #[must_use]
    pub fn post_to(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Send a request and parse the body as JSON.
    ///
    /// Fails on timeout, transport error, non-2xx status or malformed JSON.
    pub async fn send_json(&self, request: RequestBuilder) -> Result<Value> {
        let call = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::UpstreamStatus {
                    provider: self.provider.clone(),
                    status: status.as_u16(),
                });
            }

            let body = response.bytes().await?;
            trace!(provider = %self.provider, bytes = body.len(), "Upstream response received");
            serde_json::from_slice::<Value>(&body).map_err(|e| {
                Error::schema(&self.provider, format!("malformed JSON body: {e}"))
            })
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout {
                provider: self.provider.clone(),
                after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }
}
