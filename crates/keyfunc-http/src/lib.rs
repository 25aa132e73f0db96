//! HTTP client abstraction for keyfunc
//!
//! This crate wraps the underlying HTTP library (reqwest with rustls) so the key set
//! fetcher only deals with a small surface: a configured client, raw responses and a
//! single error type that separates status failures, timeouts and connection errors.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use keyfunc_http::{HttpClient, HttpError};
//!
//! async fn example() -> Result<Vec<u8>, HttpError> {
//!     let client = HttpClient::builder()
//!         .timeout(Duration::from_secs(10))
//!         .https_only(true)
//!         .build()?;
//!     let response = client.get_raw("https://example.com/.well-known/jwks.json").await?;
//!     response.error_for_status().await?.bytes().await
//! }
//! ```

mod client;
mod error;
mod response;

pub use client::{HttpClient, HttpClientBuilder};
pub use error::HttpError;
pub use response::{RawResponse, Response};
