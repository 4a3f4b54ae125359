//! Batched fan-out with pacing
//!
//! Stages that call the backend once per item run the items in small
//! concurrent batches with a pause in between, so the pool and the sources
//! feeding it are not hit all at once.

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

/// Batch size and inter-batch delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Items in flight at once; zero is treated as one.
    pub size: usize,
    /// Pause between the end of one batch and the start of the next.
    pub delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            size: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `f` over `items` batch by batch. Results keep input order.
pub async fn run_batched<I, F, Fut>(items: I, policy: BatchPolicy, mut f: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    let size = policy.size.max(1);
    let mut items = items.into_iter().peekable();
    let mut results = Vec::new();
    let mut batch = 0usize;

    while items.peek().is_some() {
        if batch > 0 && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
        let futures: Vec<Fut> = items.by_ref().take(size).map(&mut f).collect();
        debug!(batch, items = futures.len(), "running batch");
        results.extend(join_all(futures).await);
        batch += 1;
    }
    results
}
