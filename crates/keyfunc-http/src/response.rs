//! HTTP response types

use crate::error::HttpError;

/// Result type returned by every HTTP operation
pub type Response<R, E = HttpError> = Result<R, E>;

/// Raw HTTP response with status code and body access
#[derive(Debug)]
pub struct RawResponse {
    status: u16,
    inner: reqwest::Response,
}

impl RawResponse {
    /// Create a new RawResponse from a reqwest::Response
    pub(crate) fn new(response: reqwest::Response) -> Self {
        Self {
            status: response.status().as_u16(),
            inner: response,
        }
    }

    /// Get the HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Check if the response status is a success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into [`HttpError::Status`] carrying the body text
    pub async fn error_for_status(self) -> Response<Self> {
        if self.is_success() {
            return Ok(self);
        }

        let status = self.status;
        let message = self.inner.text().await.unwrap_or_default();
        Err(HttpError::Status { status, message })
    }

    /// Get the response body as bytes
    pub async fn bytes(self) -> Response<Vec<u8>> {
        self.inner
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(HttpError::from)
    }
}
