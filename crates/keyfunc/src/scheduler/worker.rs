//! Background refresh loop

use tokio::time::{sleep_until, Instant};

use super::Scheduler;
use crate::error::RefreshError;

/// Refresh on schedule until the scheduler is cancelled.
///
/// The deadline is recomputed after every wake, so a refresh that happened on demand
/// in the meantime pushes the next scheduled one back.
pub(super) async fn refresh_loop(scheduler: Scheduler) {
    tracing::debug!("Starting key set refresh loop");

    loop {
        let deadline = scheduler.next_refresh_at();

        if Instant::now() < deadline {
            tokio::select! {
                _ = scheduler.cancel_token().cancelled() => break,
                _ = sleep_until(deadline) => continue,
            }
        }

        match scheduler.refresh_now().await {
            Ok(snapshot) => {
                tracing::debug!(
                    "Scheduled refresh done, snapshot version {}",
                    snapshot.version()
                );
            }
            Err(RefreshError::Cancelled) => break,
            Err(e) => {
                let retry_in = scheduler
                    .next_refresh_at()
                    .saturating_duration_since(Instant::now());
                tracing::warn!(
                    "Scheduled key set refresh failed: {}. Retrying in {:?}",
                    e,
                    retry_in
                );
            }
        }
    }

    tracing::debug!("Key set refresh loop ended");
}
