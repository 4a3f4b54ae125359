//! Per-credential call spacing
//!
//! Independently of cooldown, calls on the same key are spaced by a minimum
//! interval. The interval shrinks as more keys are alive, since total
//! throughput grows with the pool while each key's own limit stays fixed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cooldown::{MAX_COOLDOWN, deadline};
use crate::error::{Error, Result};
use crate::pool::CredentialPool;

/// One step of the interval table: from `min_credentials` alive keys upward,
/// calls on a key are at least `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTier {
    pub min_credentials: usize,
    pub interval: Duration,
}

/// Step function from alive-credential count to minimum interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    tiers: Vec<GateTier>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                GateTier {
                    min_credentials: 1,
                    interval: Duration::from_millis(4500),
                },
                GateTier {
                    min_credentials: 2,
                    interval: Duration::from_secs(2),
                },
                GateTier {
                    min_credentials: 4,
                    interval: Duration::from_secs(1),
                },
                GateTier {
                    min_credentials: 7,
                    interval: Duration::from_millis(500),
                },
            ],
        }
    }
}

impl GatePolicy {
    /// Build a policy from tiers in any order.
    ///
    /// Once sorted by threshold, thresholds must be distinct and intervals must
    /// strictly decrease; more live keys never means longer spacing.
    pub fn new(mut tiers: Vec<GateTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::InvalidPolicy("rate gate needs at least one tier".into()));
        }
        if let Some(tier) = tiers.iter().find(|t| t.interval > MAX_COOLDOWN) {
            return Err(Error::InvalidPolicy(format!(
                "rate gate interval {:?} must not exceed {}s",
                tier.interval,
                MAX_COOLDOWN.as_secs()
            )));
        }
        tiers.sort_by_key(|t| t.min_credentials);
        for pair in tiers.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if lower.min_credentials == upper.min_credentials {
                return Err(Error::InvalidPolicy(format!(
                    "duplicate rate gate tier for {} credentials",
                    lower.min_credentials
                )));
            }
            if upper.interval >= lower.interval {
                return Err(Error::InvalidPolicy(format!(
                    "rate gate interval must shrink as credentials grow: {} credentials → {:?}, {} credentials → {:?}",
                    lower.min_credentials, lower.interval, upper.min_credentials, upper.interval
                )));
            }
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[GateTier] {
        &self.tiers
    }

    /// Minimum spacing for a pool with `alive` live credentials.
    ///
    /// Counts below the first threshold (including zero) get the first,
    /// longest interval.
    pub fn min_interval_for(&self, alive: usize) -> Duration {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.min_credentials <= alive)
            .or_else(|| self.tiers.first())
            .map(|t| t.interval)
            .unwrap_or_default()
    }
}

/// Spacing enforcer over a shared pool.
///
/// Reads and stamps each slot's `last_call_at` and `call_count` under the
/// pool's lock.
pub struct RateGate {
    pool: Arc<CredentialPool>,
    policy: GatePolicy,
}

impl RateGate {
    pub fn new(pool: Arc<CredentialPool>, policy: GatePolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Current minimum interval given how many credentials are alive.
    pub fn min_interval(&self) -> Duration {
        self.policy.min_interval_for(self.pool.alive_count())
    }

    /// `max(0, min_interval − (now − last_call_at))`; zero for a key never used.
    pub fn wait_time(&self, index: usize, now: Instant) -> Duration {
        let state = self.pool.lock();
        let interval = self.policy.min_interval_for(state.alive_count());
        match state.slots.get(index).and_then(|s| s.last_call_at) {
            Some(last) => deadline(last, interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record a network call on `index` at `now`.
    pub fn mark_used(&self, index: usize, now: Instant) {
        let mut state = self.pool.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.last_call_at = Some(now);
            slot.call_count += 1;
        }
    }

    /// Book the next call slot on `index` no earlier than `not_before`.
    ///
    /// Computes the gate wait and books the key in one critical section,
    /// stamping the scheduled instant rather than the current one. Two
    /// concurrent callers on the same key therefore get successive slots
    /// instead of both seeing a zero wait.
    ///
    /// The call is only counted once the reservation is committed. Dropping
    /// an uncommitted reservation hands the slot back.
    pub fn reserve(&self, index: usize, not_before: Instant) -> Reservation<'_> {
        let now = Instant::now();
        let mut state = self.pool.lock();
        let interval = self.policy.min_interval_for(state.alive_count());
        let Some(slot) = state.slots.get_mut(index) else {
            return Reservation {
                gate: self,
                index,
                at: not_before.max(now),
                previous: None,
                booked: false,
            };
        };

        let previous = slot.last_call_at;
        let gate_ready = previous.map_or(now, |last| deadline(last, interval));
        let at = not_before.max(gate_ready).max(now);
        slot.last_call_at = Some(at);
        debug!(
            credential = slot.label(),
            index,
            delay_ms = at.saturating_duration_since(now).as_millis() as u64,
            "call slot reserved"
        );
        Reservation {
            gate: self,
            index,
            at,
            previous,
            booked: true,
        }
    }

    /// Undo a booking, unless a later caller has already booked after it.
    fn release(&self, index: usize, at: Instant, previous: Option<Instant>) {
        let mut state = self.pool.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        if slot.last_call_at == Some(at) {
            slot.last_call_at = previous;
            debug!(credential = slot.label(), index, "unused call slot released");
        }
    }
}

/// A booked call slot on one credential.
///
/// `commit` right before the network call counts it; dropping the
/// reservation without committing (the caller was cancelled while waiting)
/// releases the slot.
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    gate: &'a RateGate,
    index: usize,
    at: Instant,
    previous: Option<Instant>,
    booked: bool,
}

impl Reservation<'_> {
    /// When the call may start.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// Count the call against the credential.
    pub fn commit(mut self) {
        if self.booked {
            let mut state = self.gate.pool.lock();
            if let Some(slot) = state.slots.get_mut(self.index) {
                slot.call_count += 1;
            }
        }
        self.booked = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.booked {
            self.gate.release(self.index, self.at, self.previous);
        }
    }
}
