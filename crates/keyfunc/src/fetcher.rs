//! Key set retrieval

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyfunc_http::{HttpClient, HttpError};
use tracing::instrument;
use url::Url;

use crate::error::{ConfigError, FetchError};
use crate::keyset::KeySet;

/// Location of a remote JWK Set.
///
/// Only `https` is accepted unless plaintext was explicitly allowed at setup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    url: Url,
}

impl Source {
    /// Validate a source locator
    pub fn parse(locator: &str, allow_http: bool) -> Result<Self, ConfigError> {
        let url = Url::parse(locator).map_err(|e| ConfigError::InvalidSource {
            url: locator.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "https" => {}
            "http" if allow_http => {
                tracing::warn!("Key set source {} is not authenticated (plain http)", url);
            }
            "http" => return Err(ConfigError::InsecureSource(locator.to_string())),
            scheme => {
                return Err(ConfigError::InvalidSource {
                    url: locator.to_string(),
                    reason: format!("unsupported scheme `{scheme}`"),
                })
            }
        }

        Ok(Self { url })
    }

    /// Source URL
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.url, f)
    }
}

/// Retrieves and parses one source into a [`KeySet`]
#[async_trait]
pub trait Fetcher: Debug + Send + Sync {
    /// Fetch the key set published at `source`
    async fn fetch(&self, source: &Source) -> Result<KeySet, FetchError>;
}

/// [`Fetcher`] over HTTPS
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: HttpClient,
    strict: bool,
}

impl HttpFetcher {
    /// Create a fetcher with a per-request timeout
    pub fn new(timeout: Duration, strict: bool, allow_http: bool) -> Result<Self, ConfigError> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .https_only(!allow_http)
            .build()?;

        Ok(Self { client, strict })
    }

    /// Create a fetcher around an already configured client
    pub fn with_client(client: HttpClient, strict: bool) -> Self {
        Self { client, strict }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(source = %source))]
    async fn fetch(&self, source: &Source) -> Result<KeySet, FetchError> {
        tracing::debug!("Fetching key set");

        let transport = |error: HttpError| FetchError::Transport {
            url: source.to_string(),
            error,
        };

        let body = self
            .client
            .get_raw(source.url().as_str())
            .await
            .map_err(transport)?
            .error_for_status()
            .await
            .map_err(transport)?
            .bytes()
            .await
            .map_err(transport)?;

        let set = KeySet::parse(&body, self.strict).map_err(|message| FetchError::Parse {
            url: source.to_string(),
            message,
        })?;

        tracing::debug!(
            "Fetched {} keys ({} skipped)",
            set.len(),
            set.skipped()
        );

        Ok(set)
    }
}

/// Fetch every source concurrently, each bounded by `timeout`.
///
/// The result is index aligned with `sources`.
pub(crate) async fn fetch_all(
    fetcher: &Arc<dyn Fetcher>,
    sources: &[Source],
    timeout: Duration,
) -> Vec<Result<KeySet, FetchError>> {
    futures::future::join_all(sources.iter().map(|source| async move {
        match tokio::time::timeout(timeout, fetcher.fetch(source)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transport {
                url: source.to_string(),
                error: HttpError::Timeout,
            }),
        }
    }))
    .await
}
