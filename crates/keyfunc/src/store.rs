//! Snapshot store
//!
//! Holds the current [`Snapshot`] behind an [`ArcSwap`] so reads are lock-free and a
//! refresh publishes a whole new snapshot in one store. Installs are serialized by a
//! writer lock; readers never wait on it.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::error::FetchError;
use crate::fetcher::Source;
use crate::keyset::{KeySet, Snapshot};

/// Outcome of the most recent fetch attempts for one source
#[derive(Debug, Clone)]
pub struct SourceState {
    /// Source URL
    pub url: String,
    /// When the last attempt finished
    pub last_attempt: Option<SystemTime>,
    /// When the last successful fetch finished
    pub last_success: Option<SystemTime>,
    /// Error of the last attempt, if it failed
    pub last_error: Option<String>,
    /// Keys returned by the last successful fetch
    pub key_count: usize,
}

/// Refresh bookkeeping for every source
#[derive(Debug, Clone)]
pub struct RefreshState {
    /// Per-source outcomes, in configuration order
    pub sources: Vec<SourceState>,
    /// Refreshes in a row in which at least one source failed
    pub consecutive_failures: u32,
}

impl RefreshState {
    fn new(sources: &[Source]) -> Self {
        Self {
            sources: sources
                .iter()
                .map(|source| SourceState {
                    url: source.to_string(),
                    last_attempt: None,
                    last_success: None,
                    last_error: None,
                    key_count: 0,
                })
                .collect(),
            consecutive_failures: 0,
        }
    }
}

/// Concurrency-safe holder of the current snapshot.
///
/// Cheap to clone; clones share the same snapshot.
#[derive(Clone)]
pub struct Store {
    snapshot: Arc<ArcSwap<Snapshot>>,
    state: Arc<RwLock<RefreshState>>,
    /// Serializes installs so version numbers stay monotonic
    write_lock: Arc<Mutex<()>>,
}

impl Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("Store")
            .field("version", &snapshot.version())
            .field("key_count", &snapshot.len())
            .finish()
    }
}

impl Store {
    /// Create a store for the given sources, serving an uninitialized snapshot
    pub fn new(sources: &[Source]) -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::uninitialized(sources.len()))),
            state: Arc::new(RwLock::new(RefreshState::new(sources))),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Most recently installed snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Publish a snapshot built from per-source key sets.
    ///
    /// The version is assigned here, one above the current snapshot.
    pub fn replace(&self, sources: Vec<Option<Arc<KeySet>>>) -> Arc<Snapshot> {
        let _guard = self.write_lock.lock();
        self.publish(sources)
    }

    fn publish(&self, sources: Vec<Option<Arc<KeySet>>>) -> Arc<Snapshot> {
        let version = self.snapshot.load().version() + 1;
        let snapshot = Arc::new(Snapshot::from_sources(version, sources));
        self.snapshot.store(snapshot.clone());
        snapshot
    }

    /// Refresh bookkeeping
    pub fn refresh_state(&self) -> RefreshState {
        self.state.read().clone()
    }

    /// Install the results of one refresh round.
    ///
    /// `outcomes` is index aligned with the configured sources. A failed source keeps
    /// its previous key set. Nothing is published when every source failed, so a good
    /// snapshot is never replaced by an emptier one. Returns the snapshot now current
    /// and the errors of the round.
    pub(crate) fn apply(
        &self,
        outcomes: Vec<Result<KeySet, FetchError>>,
    ) -> (Arc<Snapshot>, Vec<FetchError>) {
        let _guard = self.write_lock.lock();
        let now = SystemTime::now();
        let current = self.snapshot.load_full();

        let mut errors = Vec::new();
        let mut sources = Vec::with_capacity(outcomes.len());
        let mut any_success = false;

        {
            let mut state = self.state.write();

            for (index, outcome) in outcomes.into_iter().enumerate() {
                let previous = current.sources().get(index).cloned().flatten();
                let source_state = state.sources.get_mut(index);

                match outcome {
                    Ok(set) => {
                        if let Some(source_state) = source_state {
                            source_state.last_attempt = Some(now);
                            source_state.last_success = Some(now);
                            source_state.last_error = None;
                            source_state.key_count = set.len();
                        }
                        any_success = true;
                        sources.push(Some(Arc::new(set)));
                    }
                    Err(err) => {
                        if let Some(source_state) = source_state {
                            source_state.last_attempt = Some(now);
                            source_state.last_error = Some(err.to_string());
                        }
                        errors.push(err);
                        sources.push(previous);
                    }
                }
            }

            if errors.is_empty() {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        }

        if !any_success {
            tracing::debug!(
                "No source refreshed, keeping snapshot version {}",
                current.version()
            );
            return (current, errors);
        }

        let snapshot = self.publish(sources);

        tracing::info!(
            "Installed key set snapshot version {} with {} keys",
            snapshot.version(),
            snapshot.len()
        );

        (snapshot, errors)
    }
}
