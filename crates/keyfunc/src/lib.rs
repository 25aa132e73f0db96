//! Keyfunc
//!
//! Resolves the key a JWT must be verified with from one or more remote JWK Sets.
//! Key sets are fetched at startup, refreshed in the background and on unknown key
//! ids, and served from an immutable in-memory snapshot.
//!
//! Signature verification itself is left to the caller, typically
//! [`jsonwebtoken::decode`] with the [`jsonwebtoken::DecodingKey`] returned by
//! [`KeyResolver::decoding_key_for`].
//!
//! ```no_run
//! # async fn run(token: &str) -> Result<(), keyfunc::Error> {
//! use keyfunc::{CancellationToken, Config, KeyResolver};
//!
//! let config = Config::new(["https://idp.example.com/.well-known/jwks.json"]);
//! let resolver = KeyResolver::start(&config, CancellationToken::new()).await?;
//! let key = resolver.decoding_key_for(token).await?;
//! # let _ = key;
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/keyfunc")]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod config;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod keyset;
pub mod resolver;
pub mod scheduler;
pub mod store;

#[doc(hidden)]
pub use jsonwebtoken;
#[doc(hidden)]
pub use tokio_util::sync::CancellationToken;

#[doc(inline)]
pub use self::config::{Config, ResolverOptions};
#[doc(inline)]
pub use self::error::{ConfigError, Error, FetchError, RefreshError, ResolveError};
#[doc(inline)]
pub use self::fetcher::{Fetcher, HttpFetcher, Source};
#[doc(inline)]
pub use self::key::{Key, KeyType};
#[doc(inline)]
pub use self::keyset::{KeySet, Snapshot};
#[doc(inline)]
pub use self::resolver::{KeyRequest, KeyResolver};
#[doc(inline)]
pub use self::store::{RefreshState, SourceState, Store};
