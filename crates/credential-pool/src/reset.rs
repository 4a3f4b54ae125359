//! Scheduled daily quota reset
//!
//! Quota-exhausted credentials only come back through
//! `reset_daily_exhaustion`. This task runs it once per quota period; the
//! admin API can also trigger it by hand.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::pool::CredentialPool;

/// Spawn a task that clears daily exhaustion every `interval`.
///
/// The first reset happens one full interval after startup.
pub fn spawn_daily_reset_task(
    pool: Arc<CredentialPool>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the pool is fresh
        ticker.tick().await;

        loop {
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "scheduled daily reset");
            pool.reset_daily_exhaustion();
        }
    })
}
