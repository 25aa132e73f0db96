//! Key sets and snapshots
//!
//! A [`KeySet`] is the result of parsing one JWK Set document. A [`Snapshot`] is the
//! immutable, point-in-time view served to resolvers: the last good [`KeySet`] of
//! every configured source plus a merged lookup by key id.
//!
//! # Duplicate key ids
//!
//! The last entry in document order wins. Across sources, the source listed later in
//! the configuration wins. The earlier entry is dropped as a whole; metadata from the
//! two entries is never merged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use serde::Deserialize;

use crate::key::Key;

#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

/// Keys from one parse of one document, deduplicated by key id
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    /// Surviving keys in document order
    keys: Vec<Arc<Key>>,
    by_kid: HashMap<String, Arc<Key>>,
    skipped: usize,
}

impl KeySet {
    /// Empty key set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a key set from keys in document order, applying last-wins on key id
    pub fn from_keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = Arc<Key>>,
    {
        let mut set = Self::default();
        for key in keys {
            set.push(key);
        }
        set
    }

    fn push(&mut self, key: Arc<Key>) {
        if let Some(kid) = key.kid() {
            if let Some(previous) = self.by_kid.insert(kid.to_owned(), key.clone()) {
                tracing::warn!("Duplicate key id `{}`, keeping the later entry", kid);
                self.keys.retain(|existing| !Arc::ptr_eq(existing, &previous));
            }
        }
        self.keys.push(key);
    }

    /// Parse a JWK Set document.
    ///
    /// The document must be a JSON object with a `keys` array whose entries are
    /// objects carrying a string `kty`; anything else fails the whole document.
    /// Unknown fields are ignored. An entry whose type-specific fields are invalid
    /// (unsupported `kty`, bad base64, unknown `alg`) is skipped with a warning, or
    /// fails the document when `strict` is set.
    pub fn parse(document: &[u8], strict: bool) -> Result<Self, String> {
        let raw: RawKeySet = serde_json::from_slice(document).map_err(|e| e.to_string())?;

        let mut set = Self::default();
        for (index, entry) in raw.keys.into_iter().enumerate() {
            let kty = entry
                .as_object()
                .ok_or_else(|| format!("key {index} is not a JSON object"))?
                .get("kty")
                .and_then(|kty| kty.as_str())
                .ok_or_else(|| format!("key {index} has no `kty`"))?
                .to_owned();

            let key = serde_json::from_value::<Jwk>(entry)
                .map_err(|e| e.to_string())
                .and_then(|jwk| Key::from_jwk(jwk).map_err(|e| e.to_string()));

            match key {
                Ok(key) => set.push(Arc::new(key)),
                Err(reason) if strict => {
                    return Err(format!("key {index} (kty `{kty}`) is invalid: {reason}"));
                }
                Err(reason) => {
                    tracing::warn!("Skipping key {} (kty `{}`): {}", index, kty, reason);
                    set.skipped += 1;
                }
            }
        }

        Ok(set)
    }

    /// Look up a key by id
    pub fn get(&self, kid: &str) -> Option<&Arc<Key>> {
        self.by_kid.get(kid)
    }

    /// Keys in document order
    pub fn keys(&self) -> impl Iterator<Item = &Arc<Key>> {
        self.keys.iter()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of entries skipped while parsing
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Immutable view of every source's key set at one point in time.
///
/// Snapshots are never edited; a refresh builds a new one and the store swaps it in.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    updated_at: Option<SystemTime>,
    sources: Vec<Option<Arc<KeySet>>>,
    merged: KeySet,
}

impl Snapshot {
    /// Snapshot served before the first successful fetch
    pub fn uninitialized(source_count: usize) -> Self {
        Self {
            version: 0,
            updated_at: None,
            sources: vec![None; source_count],
            merged: KeySet::empty(),
        }
    }

    /// Build a snapshot from per-source key sets (index aligned with the configured sources)
    pub(crate) fn from_sources(version: u64, sources: Vec<Option<Arc<KeySet>>>) -> Self {
        let merged = KeySet::from_keys(
            sources
                .iter()
                .flatten()
                .flat_map(|set| set.keys().cloned())
                .collect::<Vec<_>>(),
        );

        Self {
            version,
            updated_at: Some(SystemTime::now()),
            sources,
            merged,
        }
    }

    /// Install counter; 0 until the first successful fetch
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether any fetch has succeeded yet
    pub fn is_initialized(&self) -> bool {
        self.version > 0
    }

    /// When this snapshot was built
    pub fn updated_at(&self) -> Option<SystemTime> {
        self.updated_at
    }

    /// Look up a key by id across all sources
    pub fn get(&self, kid: &str) -> Option<&Arc<Key>> {
        self.merged.get(kid)
    }

    /// Every key across all sources
    pub fn keys(&self) -> impl Iterator<Item = &Arc<Key>> {
        self.merged.keys()
    }

    /// Number of keys across all sources
    pub fn len(&self) -> usize {
        self.merged.len()
    }

    /// Whether the snapshot holds no keys
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Last good key set of the source at `index`
    pub fn source(&self, index: usize) -> Option<&Arc<KeySet>> {
        self.sources.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn sources(&self) -> &[Option<Arc<KeySet>>] {
        &self.sources
    }

    /// All keys as a JWK Set
    pub fn to_jwk_set(&self) -> JwkSet {
        JwkSet {
            keys: self.keys().map(|key| key.jwk().clone()).collect(),
        }
    }

    /// Keys as a JWK Set with symmetric secrets left out
    pub fn to_public_jwk_set(&self) -> JwkSet {
        JwkSet {
            keys: self
                .keys()
                .filter(|key| !matches!(key.jwk().algorithm, AlgorithmParameters::OctetKey(_)))
                .map(|key| key.jwk().clone())
                .collect(),
        }
    }
}
