//! Pool state machine and round-robin credential selection
//!
//! Every slot's state and the rotation cursor live behind one synchronous
//! mutex. Each operation is a single critical section with no `.await` inside,
//! so the cursor read and advance cannot interleave with another `acquire`,
//! and outcome reports never overwrite each other.
//!
//! Composition is fixed at construction; only state flags change afterwards.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cooldown::{CooldownPolicy, deadline};
use crate::error::{Error, Result};
use crate::stats::{CredentialStats, PoolStats};

/// Outcome that pushes a credential into cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// Transient throttle; escalating cooldown.
    Throttled,
    /// Daily quota used up; excluded until the daily reset.
    QuotaExhausted,
}

/// Derived state of a credential.
///
/// Transitions:
/// - Available → CoolingDown (throttled)
/// - Available/CoolingDown → Exhausted (quota hit)
/// - any → Dead (credential rejected)
/// - CoolingDown → Available (cooldown passed, or success)
/// - Exhausted → Available (daily reset)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    CoolingDown,
    Exhausted,
    Dead,
}

impl CredentialStatus {
    /// Status label for stats and logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::CoolingDown => "cooling_down",
            CredentialStatus::Exhausted => "exhausted",
            CredentialStatus::Dead => "dead",
        }
    }
}

/// A credential handed out for one call attempt.
#[derive(Debug, Clone)]
pub struct Lease {
    pub index: usize,
    pub key: Secret<String>,
    /// Time left before the credential's cooldown ends; zero when usable now.
    pub cooldown_remaining: Duration,
    pub last_call_at: Option<Instant>,
}

impl Lease {
    /// Log-safe label for the leased key.
    pub fn label(&self) -> String {
        self.key.label()
    }
}

/// Point-in-time copy of one slot, for assertions and diagnostics.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub index: usize,
    pub label: String,
    pub status: CredentialStatus,
    pub cooldown_until: Instant,
    pub daily_exhausted: bool,
    pub dead: bool,
    pub consecutive_failures: u32,
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<Instant>,
    pub last_call_at: Option<Instant>,
}

pub(crate) struct Slot {
    key: Secret<String>,
    label: String,
    pub(crate) cooldown_until: Instant,
    pub(crate) daily_exhausted: bool,
    pub(crate) dead: bool,
    pub(crate) consecutive_failures: u32,
    pub(crate) call_count: u64,
    pub(crate) success_count: u64,
    pub(crate) failure_count: u64,
    pub(crate) last_used_at: Option<Instant>,
    pub(crate) last_call_at: Option<Instant>,
}

impl Slot {
    fn new(key: Secret<String>, now: Instant) -> Self {
        let label = key.label();
        Self {
            key,
            label,
            cooldown_until: now,
            daily_exhausted: false,
            dead: false,
            consecutive_failures: 0,
            call_count: 0,
            success_count: 0,
            failure_count: 0,
            last_used_at: None,
            last_call_at: None,
        }
    }

    /// Neither dead nor exhausted for the day.
    pub(crate) fn selectable(&self) -> bool {
        !self.dead && !self.daily_exhausted
    }

    pub(crate) fn status(&self, now: Instant) -> CredentialStatus {
        if self.dead {
            CredentialStatus::Dead
        } else if self.daily_exhausted {
            CredentialStatus::Exhausted
        } else if self.cooldown_until > now {
            CredentialStatus::CoolingDown
        } else {
            CredentialStatus::Available
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

pub(crate) struct PoolState {
    next_index: usize,
    pub(crate) slots: Vec<Slot>,
}

impl PoolState {
    pub(crate) fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.dead).count()
    }
}

/// Fixed set of API keys with per-key health state.
///
/// Construct once and share through `Arc`.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    policy: CooldownPolicy,
}

impl CredentialPool {
    /// Build a pool from the configured keys.
    ///
    /// Duplicate keys are dropped (first occurrence wins, order kept). An empty
    /// list is an error.
    pub fn new(keys: Vec<Secret<String>>, policy: CooldownPolicy) -> Result<Self> {
        policy.validate()?;

        let now = Instant::now();
        let mut slots: Vec<Slot> = Vec::with_capacity(keys.len());
        for key in keys {
            if slots.iter().any(|s| s.key.expose() == key.expose()) {
                debug!(credential = %key.label(), "duplicate credential dropped");
                continue;
            }
            slots.push(Slot::new(key, now));
        }
        if slots.is_empty() {
            return Err(Error::NoCredentials);
        }

        info!(credentials = slots.len(), "credential pool initialized");
        Ok(Self {
            state: Mutex::new(PoolState {
                next_index: 0,
                slots,
            }),
            policy,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    /// Number of credentials, dead ones included.
    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    /// Select a credential for the next call attempt. Never fails.
    ///
    /// Scans from the cursor and returns the first selectable key whose
    /// cooldown has passed, advancing the cursor past it. If every selectable
    /// key is cooling down, returns the one that frees up soonest (the lease
    /// says how long to wait). If nothing is selectable, returns slot 0 and
    /// leaves the cursor alone; callers check `all_exhausted` first.
    pub fn acquire(&self) -> Lease {
        let now = Instant::now();
        let mut state = self.lock();
        let n = state.slots.len();
        let start = state.next_index % n;

        let mut ready = None;
        let mut soonest: Option<usize> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = &state.slots[idx];
            if !slot.selectable() {
                continue;
            }
            if slot.cooldown_until <= now {
                ready = Some(idx);
                break;
            }
            if soonest.is_none_or(|s| slot.cooldown_until < state.slots[s].cooldown_until) {
                soonest = Some(idx);
            }
        }

        let index = match ready.or(soonest) {
            Some(idx) => {
                state.next_index = (idx + 1) % n;
                idx
            }
            None => {
                debug!("no selectable credential, falling back to slot 0");
                0
            }
        };

        let slot = &mut state.slots[index];
        slot.last_used_at = Some(now);
        let lease = Lease {
            index,
            key: slot.key.clone(),
            cooldown_remaining: slot.cooldown_until.saturating_duration_since(now),
            last_call_at: slot.last_call_at,
        };
        debug!(
            credential = slot.label(),
            index,
            cooldown_ms = lease.cooldown_remaining.as_millis() as u64,
            "credential acquired"
        );
        lease
    }

    /// Record a throttle or quota response for a credential.
    pub fn penalize(&self, index: usize, penalty: Penalty) {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
        slot.failure_count += 1;

        match penalty {
            Penalty::QuotaExhausted => {
                slot.daily_exhausted = true;
                slot.cooldown_until = deadline(now, self.policy.quota_window);
                warn!(
                    credential = slot.label(),
                    index,
                    window_secs = self.policy.quota_window.as_secs(),
                    "credential exhausted its daily quota"
                );
            }
            Penalty::Throttled => {
                let cooldown = self.policy.cooldown_for(slot.consecutive_failures);
                slot.cooldown_until = deadline(now, cooldown);
                info!(
                    credential = slot.label(),
                    index,
                    consecutive_failures = slot.consecutive_failures,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "credential entering cooldown (throttled)"
                );
            }
        }
    }

    /// Exclude a credential permanently.
    pub fn mark_dead(&self, index: usize) {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        slot.failure_count += 1;
        if !slot.dead {
            slot.dead = true;
            warn!(credential = slot.label(), index, "credential rejected, removed from rotation");
        }
    }

    /// Record a success: the failure streak ends and any cooldown is lifted.
    pub fn reward(&self, index: usize) {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        slot.consecutive_failures = 0;
        slot.success_count += 1;
        if slot.cooldown_until > now {
            slot.cooldown_until = now;
        }
    }

    /// Record a failure that says nothing about the credential (network, 5xx).
    pub fn record_error(&self, index: usize) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.failure_count += 1;
        }
    }

    /// Clear daily exhaustion, failure streaks, and cooldowns on every slot.
    ///
    /// Dead credentials stay dead.
    pub fn reset_daily_exhaustion(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut cleared = 0usize;
        for slot in state.slots.iter_mut() {
            if slot.daily_exhausted {
                cleared += 1;
            }
            slot.daily_exhausted = false;
            slot.consecutive_failures = 0;
            slot.cooldown_until = now;
        }
        info!(cleared, "daily exhaustion reset");
    }

    /// Zero the usage counters on every slot. Health flags are untouched.
    pub fn reset_statistics(&self) {
        let mut state = self.lock();
        for slot in state.slots.iter_mut() {
            slot.call_count = 0;
            slot.success_count = 0;
            slot.failure_count = 0;
            slot.last_used_at = None;
        }
        info!("pool statistics reset");
    }

    /// True when every credential is dead or exhausted for the day.
    pub fn all_exhausted(&self) -> bool {
        self.lock().slots.iter().all(|s| !s.selectable())
    }

    /// Number of credentials that are not dead.
    pub fn alive_count(&self) -> usize {
        self.lock().alive_count()
    }

    /// Copy of one slot's state.
    pub fn snapshot(&self, index: usize) -> Option<CredentialSnapshot> {
        let now = Instant::now();
        let state = self.lock();
        state.slots.get(index).map(|slot| CredentialSnapshot {
            index,
            label: slot.label.clone(),
            status: slot.status(now),
            cooldown_until: slot.cooldown_until,
            daily_exhausted: slot.daily_exhausted,
            dead: slot.dead,
            consecutive_failures: slot.consecutive_failures,
            call_count: slot.call_count,
            success_count: slot.success_count,
            failure_count: slot.failure_count,
            last_used_at: slot.last_used_at,
            last_call_at: slot.last_call_at,
        })
    }

    /// Statistics report for operators.
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.lock();
        let credentials = state
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| CredentialStats::from_slot(index, slot, now))
            .collect();
        PoolStats::from_credentials(credentials)
    }
}
