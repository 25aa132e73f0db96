//! HTTP client wrapper

use std::time::Duration;

use crate::error::HttpError;
use crate::response::{RawResponse, Response};

/// HTTP client wrapper
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Create a new HTTP client with default settings
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Create a new HTTP client builder
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Create an HttpClient from a reqwest::Client
    pub fn from_reqwest(client: reqwest::Client) -> Self {
        Self { inner: client }
    }

    /// GET request returning the raw response, whatever its status
    pub async fn get_raw(&self, url: &str) -> Response<RawResponse> {
        tracing::trace!("GET {}", url);
        let response = self
            .inner
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        Ok(RawResponse::new(response))
    }
}

/// HTTP client builder for timeout, transport and proxy settings
#[derive(Debug, Default)]
pub struct HttpClientBuilder {
    timeout: Option<Duration>,
    https_only: bool,
    accept_invalid_certs: bool,
    proxy: Option<url::Url>,
}

impl HttpClientBuilder {
    /// Total deadline for a request, from connect until the body is read
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Refuse any request that is not made over HTTPS
    pub fn https_only(mut self, enabled: bool) -> Self {
        self.https_only = enabled;
        self
    }

    /// Accept invalid TLS certificates
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Route every request through a proxy
    pub fn proxy(mut self, url: url::Url) -> Self {
        self.proxy = Some(url);
        self
    }

    /// Build the HTTP client
    pub fn build(self) -> Response<HttpClient> {
        let mut builder = reqwest::Client::builder()
            .https_only(self.https_only)
            .danger_accept_invalid_certs(self.accept_invalid_certs);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(proxy_url) = self.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| HttpError::Proxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(HttpError::from)?;
        Ok(HttpClient { inner: client })
    }
}
