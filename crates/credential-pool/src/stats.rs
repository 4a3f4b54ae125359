//! Pool statistics report
//!
//! Serialized as-is by the admin API, so field names are part of the
//! operator-facing JSON.

use serde::Serialize;
use tokio::time::Instant;

use crate::pool::{CredentialStatus, Slot};

/// Overall pool condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    /// Every credential usable right now.
    Healthy,
    /// At least one credential is not dead or exhausted.
    Degraded,
    /// Nothing left to rotate to until a reset.
    Unhealthy,
}

/// Per-credential entry; the key itself is reduced to a short prefix.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub index: usize,
    pub label: String,
    pub status: &'static str,
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: f64,
    pub daily_exhausted: bool,
    pub dead: bool,
    /// `success_count / call_count × 100`, or 100 before the first call.
    pub health_percent: f64,
    pub last_used_secs_ago: Option<f64>,
    pub last_call_secs_ago: Option<f64>,
}

impl CredentialStats {
    pub(crate) fn from_slot(index: usize, slot: &Slot, now: Instant) -> Self {
        let secs_ago =
            |at: Option<Instant>| at.map(|t| now.saturating_duration_since(t).as_secs_f64());
        Self {
            index,
            label: slot.label().to_string(),
            status: slot.status(now).label(),
            call_count: slot.call_count,
            success_count: slot.success_count,
            failure_count: slot.failure_count,
            consecutive_failures: slot.consecutive_failures,
            cooldown_remaining_secs: slot.cooldown_until.saturating_duration_since(now).as_secs_f64(),
            daily_exhausted: slot.daily_exhausted,
            dead: slot.dead,
            health_percent: health_percent(slot.success_count, slot.call_count),
            last_used_secs_ago: secs_ago(slot.last_used_at),
            last_call_secs_ago: secs_ago(slot.last_call_at),
        }
    }
}

fn health_percent(successes: u64, calls: u64) -> f64 {
    if calls == 0 {
        return 100.0;
    }
    (successes as f64 / calls as f64 * 100.0).min(100.0)
}

/// Whole-pool report.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub status: PoolHealth,
    pub all_exhausted: bool,
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub exhausted: usize,
    pub dead: usize,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub credentials: Vec<CredentialStats>,
}

impl PoolStats {
    pub(crate) fn from_credentials(credentials: Vec<CredentialStats>) -> Self {
        let count = |status: CredentialStatus| {
            credentials
                .iter()
                .filter(|c| c.status == status.label())
                .count()
        };
        let available = count(CredentialStatus::Available);
        let cooling_down = count(CredentialStatus::CoolingDown);
        let exhausted = count(CredentialStatus::Exhausted);
        let dead = count(CredentialStatus::Dead);
        let total = credentials.len();

        let status = if available == total {
            PoolHealth::Healthy
        } else if available + cooling_down > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        };

        Self {
            status,
            all_exhausted: available + cooling_down == 0,
            total,
            available,
            cooling_down,
            exhausted,
            dead,
            total_calls: credentials.iter().map(|c| c.call_count).sum(),
            total_successes: credentials.iter().map(|c| c.success_count).sum(),
            total_failures: credentials.iter().map(|c| c.failure_count).sum(),
            credentials,
        }
    }
}
