//! Errors

use std::sync::Arc;

use jsonwebtoken::Algorithm;
use keyfunc_http::HttpError;
use thiserror::Error;

fn kid_label(kid: &Option<String>) -> &str {
    kid.as_deref().unwrap_or("<none>")
}

/// Setup errors. Raised before any background work is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No key set source configured
    #[error("No key set sources configured")]
    EmptySourceList,
    /// Source does not use an authenticated transport
    #[error("Key set source `{0}` is not served over https")]
    InsecureSource(String),
    /// Source is not a usable URL
    #[error("Invalid key set source `{url}`: {reason}")]
    InvalidSource {
        /// Source as configured
        url: String,
        /// Why it was rejected
        reason: String,
    },
    /// A duration option is out of range
    #[error("Invalid `{0}`: must be greater than zero")]
    InvalidInterval(&'static str),
    /// HTTP client could not be built
    #[error(transparent)]
    HttpClient(#[from] HttpError),
    /// Config file could not be read
    #[error(transparent)]
    File(#[from] config::ConfigError),
}

/// Failure to turn one source into a [`crate::KeySet`]
#[derive(Debug, Error)]
pub enum FetchError {
    /// The document could not be retrieved
    #[error("Failed to retrieve key set from `{url}`: {error}")]
    Transport {
        /// Source URL
        url: String,
        /// Underlying transport error
        #[source]
        error: HttpError,
    },
    /// The document was retrieved but is not a valid key set
    #[error("Failed to parse key set from `{url}`: {message}")]
    Parse {
        /// Source URL
        url: String,
        /// Parse failure description
        message: String,
    },
}

impl FetchError {
    /// URL of the source that failed
    pub fn url(&self) -> &str {
        match self {
            FetchError::Transport { url, .. } | FetchError::Parse { url, .. } => url,
        }
    }

    /// Whether retrying later may help. A malformed document is not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { error, .. } => error.is_transient(),
            FetchError::Parse { .. } => false,
        }
    }
}

/// Outcome of a refresh that did not produce a fully fresh snapshot.
///
/// Cloned to every caller that joined the same in-flight refresh.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    /// At least one source failed; the first failure is kept
    #[error(transparent)]
    Fetch(Arc<FetchError>),
    /// The scheduler was stopped before the refresh completed
    #[error("Key set refresh cancelled")]
    Cancelled,
    /// A refresh for an unknown key id was requested too soon after the previous one
    #[error("Refresh on unknown key id is rate limited")]
    RateLimited,
}

/// Key resolution errors.
///
/// Variants carry the key id and declared algorithm from the token header but never
/// key material.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No key with this id, even after an optional refresh
    #[error("Unknown key id `{}` for {alg:?}", kid_label(.kid))]
    UnknownKey {
        /// Key id from the token header
        kid: Option<String>,
        /// Algorithm declared by the token header
        alg: Algorithm,
        /// Why the refresh attempted on the miss did not help, if one was attempted
        #[source]
        refresh: Option<RefreshError>,
    },
    /// Key exists but is restricted to another algorithm or key family
    #[error("Key `{}` permits {permitted}, token declares {declared:?}", kid_label(.kid))]
    AlgorithmMismatch {
        /// Key id from the token header
        kid: Option<String>,
        /// Algorithm declared by the token header
        declared: Algorithm,
        /// What the key permits
        permitted: String,
    },
    /// No key id in the header and the key set does not hold exactly one key
    #[error("Token has no key id and the key set holds {candidates} keys")]
    Ambiguous {
        /// Algorithm declared by the token header
        alg: Algorithm,
        /// Number of keys in the current snapshot
        candidates: usize,
    },
    /// Key is published for a use other than signature verification
    #[error("Key `{}` is published for `{key_use}`, not signature verification", kid_label(.kid))]
    UnusableKey {
        /// Key id from the token header
        kid: Option<String>,
        /// Published `use` value
        key_use: String,
    },
}

/// Keyfunc Error
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Fetch error
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Refresh error
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    /// Resolution error
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The first fetch required at startup failed
    #[error("Initial key set fetch failed: {0}")]
    InitialFetch(#[source] RefreshError),
    /// Token header could not be decoded
    #[error(transparent)]
    Header(#[from] jsonwebtoken::errors::Error),
}
