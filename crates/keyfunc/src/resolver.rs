//! Key resolution for token verification

use std::fmt::Debug;
use std::sync::Arc;

use jsonwebtoken::{decode_header, Algorithm, DecodingKey, Header};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{Config, ResolverOptions};
use crate::error::{Error, ResolveError};
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::key::Key;
use crate::keyset::Snapshot;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::store::{RefreshState, Store};

/// Lookup parameters taken from an unverified token header.
///
/// Everything here is attacker controlled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    kid: Option<String>,
    alg: Algorithm,
}

impl KeyRequest {
    /// Request without a key id
    pub fn new(alg: Algorithm) -> Self {
        Self { kid: None, alg }
    }

    /// Set the key id. An empty id counts as absent.
    pub fn with_kid<S>(mut self, kid: S) -> Self
    where
        S: Into<String>,
    {
        let kid = kid.into();
        self.kid = (!kid.is_empty()).then_some(kid);
        self
    }

    /// Read `kid` and `alg` from the header of an encoded token without verifying it
    pub fn from_token(token: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self::from(&decode_header(token)?))
    }

    /// Key id, if the header carried a non-empty one
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Declared algorithm
    pub fn alg(&self) -> Algorithm {
        self.alg
    }
}

impl From<&Header> for KeyRequest {
    fn from(header: &Header) -> Self {
        let request = Self::new(header.alg);
        match &header.kid {
            Some(kid) => request.with_kid(kid.as_str()),
            None => request,
        }
    }
}

/// Refuse keys that are published for another use or another algorithm
fn check_key(key: &Arc<Key>, request: &KeyRequest) -> Result<Arc<Key>, ResolveError> {
    if !key.permits(request.alg) {
        tracing::warn!(
            "Token declares {:?} but key {:?} permits {}",
            request.alg,
            key.kid(),
            key.permitted_label()
        );
        return Err(ResolveError::AlgorithmMismatch {
            kid: request.kid.clone(),
            declared: request.alg,
            permitted: key.permitted_label(),
        });
    }

    if !key.is_signing_key() {
        return Err(ResolveError::UnusableKey {
            kid: request.kid.clone(),
            key_use: key.key_use_label(),
        });
    }

    Ok(key.clone())
}

struct ResolverInner {
    store: Store,
    scheduler: Scheduler,
    options: ResolverOptions,
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        tracing::debug!("Dropping key resolver");
        self.scheduler.stop();
    }
}

/// Resolves verification keys from a cached, periodically refreshed JWK Set.
///
/// Cheap to clone. The background refresh stops when [`KeyResolver::stop`] is called,
/// when the cancellation token given at start fires, or when the last clone is dropped.
#[derive(Clone)]
pub struct KeyResolver {
    inner: Arc<ResolverInner>,
}

impl Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResolver")
            .field("store", &self.inner.store)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl KeyResolver {
    /// Validate `config`, fetch every source once and start the background refresh.
    ///
    /// Fails without leaving anything running when the configuration is invalid, or
    /// when `require_initial_fetch` is set and no source could be fetched.
    pub async fn start(config: &Config, cancel: CancellationToken) -> Result<Self, Error> {
        let options = config.validate()?;
        let fetcher = HttpFetcher::new(options.fetch_timeout, options.strict, options.allow_http)?;

        Self::start_with_options(options, Arc::new(fetcher), cancel).await
    }

    /// Like [`KeyResolver::start`] with a custom [`Fetcher`]
    pub async fn start_with_fetcher(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let options = config.validate()?;

        Self::start_with_options(options, fetcher, cancel).await
    }

    async fn start_with_options(
        options: ResolverOptions,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let store = Store::new(&options.sources);
        let scheduler = Scheduler::new(
            options.sources.clone(),
            fetcher,
            store.clone(),
            SchedulerOptions::from(&options),
            cancel.child_token(),
        );

        tracing::info!(
            "Starting key resolver for {} source(s), refresh every {:?}",
            options.sources.len(),
            options.refresh_interval
        );

        if let Err(err) = scheduler.refresh_now().await {
            if options.require_initial_fetch && !store.current().is_initialized() {
                scheduler.stop();
                return Err(Error::InitialFetch(err));
            }
            tracing::warn!("Initial key set fetch incomplete: {}", err);
        }

        scheduler.spawn();

        Ok(Self {
            inner: Arc::new(ResolverInner {
                store,
                scheduler,
                options,
            }),
        })
    }

    /// Resolve the key a token must be verified with.
    ///
    /// A known key id is answered from the current snapshot. An unknown one triggers
    /// at most one refresh (when enabled) before failing with
    /// [`ResolveError::UnknownKey`]. Without a key id the snapshot must hold exactly
    /// one key.
    #[instrument(skip_all, fields(kid = ?request.kid(), alg = ?request.alg()))]
    pub async fn resolve(&self, request: &KeyRequest) -> Result<Arc<Key>, ResolveError> {
        let snapshot = self.inner.store.current();

        let Some(kid) = request.kid() else {
            return Self::resolve_single(&snapshot, request);
        };

        if let Some(key) = snapshot.get(kid) {
            return check_key(key, request);
        }

        if !self.inner.options.refresh_on_unknown_kid {
            return Err(ResolveError::UnknownKey {
                kid: request.kid.clone(),
                alg: request.alg,
                refresh: None,
            });
        }

        tracing::debug!("Key id not in snapshot {}, refreshing", snapshot.version());

        let (snapshot, refresh) = match self.inner.scheduler.refresh_on_miss().await {
            Ok(snapshot) => (snapshot, None),
            Err(err) => (self.inner.store.current(), Some(err)),
        };

        match snapshot.get(kid) {
            Some(key) => check_key(key, request),
            None => Err(ResolveError::UnknownKey {
                kid: request.kid.clone(),
                alg: request.alg,
                refresh,
            }),
        }
    }

    fn resolve_single(snapshot: &Snapshot, request: &KeyRequest) -> Result<Arc<Key>, ResolveError> {
        let mut keys = snapshot.keys();
        match (keys.next(), keys.next()) {
            (Some(key), None) => check_key(key, request),
            _ => Err(ResolveError::Ambiguous {
                alg: request.alg,
                candidates: snapshot.len(),
            }),
        }
    }

    /// Every key in the current snapshot that could verify `request`.
    ///
    /// Keys restricted to another algorithm or use are left out. With a key id only
    /// that key is considered. Never triggers a refresh.
    pub fn candidates(&self, request: &KeyRequest) -> Vec<Arc<Key>> {
        let snapshot = self.inner.store.current();

        snapshot
            .keys()
            .filter(|key| request.kid().is_none() || key.kid() == request.kid())
            .filter(|key| key.is_signing_key() && key.permits(request.alg))
            .cloned()
            .collect()
    }

    /// Decode the header of `token` and resolve its verification key
    pub async fn decoding_key_for(&self, token: &str) -> Result<DecodingKey, Error> {
        let request = KeyRequest::from_token(token)?;
        let key = self.resolve(&request).await?;

        Ok(key.decoding_key().clone())
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.store.current()
    }

    /// Refresh every source now, or join the refresh already in flight
    pub async fn refresh_now(&self) -> Result<Arc<Snapshot>, Error> {
        Ok(self.inner.scheduler.refresh_now().await?)
    }

    /// Per-source refresh bookkeeping
    pub fn refresh_state(&self) -> RefreshState {
        self.inner.store.refresh_state()
    }

    /// Number of refresh rounds started, including the initial one
    pub fn refresh_count(&self) -> u64 {
        self.inner.scheduler.rounds()
    }

    /// Current keys as a JWK Set document
    pub fn jwks_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.current().to_jwk_set())
    }

    /// Current keys as a JWK Set document without symmetric keys
    pub fn public_jwks_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.current().to_public_jwk_set())
    }

    /// Stop background refreshing. Idempotent.
    ///
    /// Resolution keeps working against the last installed snapshot, but no longer
    /// refreshes on unknown key ids.
    pub fn stop(&self) {
        self.inner.scheduler.stop();
    }

    /// Wait until the background refresh task has exited
    pub async fn stopped(&self) {
        self.inner.scheduler.stopped().await;
    }
}
