//! Refresh scheduling with single-flight deduplication
//!
//! # Architecture
//!
//! - **One refresh at a time**: timer ticks and on-demand requests share a single
//!   in-flight refresh. Later callers join it and receive the same outcome.
//! - **Background loop**: one task per scheduler, bound to a [`CancellationToken`],
//!   refreshes every interval and backs off exponentially after failures.
//! - **Cancellation**: cancelling stops the loop, aborts a running fetch and wakes
//!   every waiter with [`RefreshError::Cancelled`].
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = Scheduler::new(sources, fetcher, store, options, cancel);
//! scheduler.spawn();
//! let snapshot = scheduler.refresh_now().await?;
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod worker;

use crate::config::ResolverOptions;
use crate::error::RefreshError;
use crate::fetcher::{fetch_all, Fetcher, Source};
use crate::keyset::Snapshot;
use crate::store::Store;

type RefreshResult = Result<Arc<Snapshot>, RefreshError>;

/// A refresh every caller can await
type InflightRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Timing knobs of the scheduler
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Time between successful refreshes
    pub refresh_interval: Duration,
    /// Deadline for one fetch of one source
    pub fetch_timeout: Duration,
    /// First retry delay after a failure
    pub retry_backoff_min: Duration,
    /// Largest retry delay
    pub retry_backoff_max: Duration,
    /// Spacing between refreshes triggered by unknown key ids
    pub unknown_kid_cooldown: Duration,
}

impl From<&ResolverOptions> for SchedulerOptions {
    fn from(options: &ResolverOptions) -> Self {
        Self {
            refresh_interval: options.refresh_interval,
            fetch_timeout: options.fetch_timeout,
            retry_backoff_min: options.retry_backoff_min,
            retry_backoff_max: options.retry_backoff_max,
            unknown_kid_cooldown: options.unknown_kid_cooldown,
        }
    }
}

/// Delay before the next refresh given the number of consecutive failed refreshes.
///
/// No failures means the regular interval. Otherwise `min * 2^(failures - 1)`,
/// capped at `max`.
pub(crate) fn next_delay(failures: u32, options: &SchedulerOptions) -> Duration {
    if failures == 0 {
        return options.refresh_interval;
    }

    let exponent = (failures - 1).min(16);
    options
        .retry_backoff_min
        .saturating_mul(1u32 << exponent)
        .min(options.retry_backoff_max)
}

struct SchedulerInner {
    sources: Vec<Source>,
    fetcher: Arc<dyn Fetcher>,
    store: Store,
    options: SchedulerOptions,
    cancel: CancellationToken,
    inflight: Mutex<Option<InflightRefresh>>,
    /// When the last refresh finished, successful or not
    last_refresh: Mutex<Option<Instant>>,
    /// When the last refresh caused by an unknown key id started
    last_miss_refresh: Mutex<Option<Instant>>,
    /// Refresh rounds started, each fetching every source once
    rounds: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Drives refreshes of the [`Store`].
///
/// Cheap to clone; clones share the same in-flight refresh and background task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sources", &self.inner.sources)
            .field("options", &self.inner.options)
            .field("rounds", &self.rounds())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler. No task is started until [`Scheduler::spawn`].
    pub fn new(
        sources: Vec<Source>,
        fetcher: Arc<dyn Fetcher>,
        store: Store,
        options: SchedulerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                sources,
                fetcher,
                store,
                options,
                cancel,
                inflight: Mutex::new(None),
                last_refresh: Mutex::new(None),
                last_miss_refresh: Mutex::new(None),
                rounds: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the background refresh loop. Calling it again is a no-op.
    pub fn spawn(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }

        *task = Some(tokio::spawn(worker::refresh_loop(self.clone())));
    }

    /// Stop the background loop and wake every waiter. Idempotent.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::debug!("Stopping key set refresh scheduler");
        }
        self.inner.cancel.cancel();
    }

    /// Whether the scheduler has been stopped
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until the background loop has exited
    pub async fn stopped(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await
                .inspect_err(|e| tracing::error!("Refresh task ended abnormally: {}", e))
                .ok();
        }
    }

    /// Number of refresh rounds started so far
    pub fn rounds(&self) -> u64 {
        self.inner.rounds.load(Ordering::SeqCst)
    }

    /// Refresh now, or join the refresh already in flight
    pub async fn refresh_now(&self) -> RefreshResult {
        if self.is_stopped() {
            return Err(RefreshError::Cancelled);
        }

        let inflight = {
            let mut slot = self.inner.inflight.lock();
            self.join_or_start(&mut slot)
        };

        self.await_refresh(inflight).await
    }

    /// Refresh on behalf of a lookup that missed.
    ///
    /// Joins a refresh already in flight. Otherwise starts one, unless the previous
    /// miss-triggered refresh started less than the cooldown ago.
    pub async fn refresh_on_miss(&self) -> RefreshResult {
        if self.is_stopped() {
            return Err(RefreshError::Cancelled);
        }

        let inflight = {
            let mut slot = self.inner.inflight.lock();
            if let Some(inflight) = slot.as_ref() {
                inflight.clone()
            } else {
                let cooldown = self.inner.options.unknown_kid_cooldown;
                let mut last_miss = self.inner.last_miss_refresh.lock();
                if let Some(started) = *last_miss {
                    if !cooldown.is_zero() && started.elapsed() < cooldown {
                        tracing::debug!("Unknown key id refresh suppressed by cooldown");
                        return Err(RefreshError::RateLimited);
                    }
                }
                *last_miss = Some(Instant::now());
                self.join_or_start(&mut slot)
            }
        };

        self.await_refresh(inflight).await
    }

    fn join_or_start(&self, slot: &mut Option<InflightRefresh>) -> InflightRefresh {
        if let Some(inflight) = slot.as_ref() {
            tracing::trace!("Joining in-flight key set refresh");
            return inflight.clone();
        }

        let this = self.clone();
        let task = tokio::spawn(async move { this.run_refresh().await });
        let inflight = async move { task.await.unwrap_or(Err(RefreshError::Cancelled)) }
            .boxed()
            .shared();

        *slot = Some(inflight.clone());
        inflight
    }

    async fn await_refresh(&self, inflight: InflightRefresh) -> RefreshResult {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(RefreshError::Cancelled),
            result = inflight => result,
        }
    }

    async fn run_refresh(&self) -> RefreshResult {
        let round = self.inner.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Starting key set refresh round {}", round);

        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(RefreshError::Cancelled),
            result = self.fetch_and_install() => result,
        };

        *self.inner.last_refresh.lock() = Some(Instant::now());
        self.inner.inflight.lock().take();

        result
    }

    async fn fetch_and_install(&self) -> RefreshResult {
        let outcomes = fetch_all(
            &self.inner.fetcher,
            &self.inner.sources,
            self.inner.options.fetch_timeout,
        )
        .await;

        let (snapshot, errors) = self.inner.store.apply(outcomes);

        for err in &errors {
            if err.is_transient() {
                tracing::warn!("Key set refresh failed for {}: {}", err.url(), err);
            } else {
                tracing::error!("Key set from {} rejected: {}", err.url(), err);
            }
        }

        match errors.into_iter().next() {
            Some(first) => Err(RefreshError::Fetch(Arc::new(first))),
            None => Ok(snapshot),
        }
    }

    /// When the background loop should refresh next
    pub(crate) fn next_refresh_at(&self) -> Instant {
        match *self.inner.last_refresh.lock() {
            Some(last) => {
                let failures = self.inner.store.refresh_state().consecutive_failures;
                last + next_delay(failures, &self.inner.options)
            }
            None => Instant::now(),
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}
