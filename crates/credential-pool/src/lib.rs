//! Credential pool for a generative-AI backend
//!
//! Holds a fixed set of API keys with per-key health state, selects keys
//! round-robin, and spaces calls on each key. Outcomes reported by the caller
//! drive the state machine:
//!
//! 1. Pool built once from the configured keys, every key `Available`
//! 2. `acquire` hands out the next key whose cooldown has passed
//! 3. Transient 429 → escalating cooldown (`penalize(Throttled)`)
//! 4. Daily-quota 429 → exhausted until the daily reset (`penalize(QuotaExhausted)`)
//! 5. 401/403 or an invalid-key 400 → dead for the life of the process
//! 6. Success → failure streak cleared, cooldown pulled back to now
//! 7. Background task clears daily exhaustion once per quota period

pub mod cooldown;
pub mod error;
pub mod gate;
pub mod pool;
pub mod quota;
pub mod reset;
pub mod stats;

pub use cooldown::{CooldownPolicy, MAX_COOLDOWN};
pub use error::{Error, Result};
pub use gate::{GatePolicy, GateTier, RateGate, Reservation};
pub use pool::{CredentialPool, CredentialSnapshot, CredentialStatus, Lease, Penalty};
pub use quota::{classify, classify_429, classify_status};
pub use reset::spawn_daily_reset_task;
pub use stats::{CredentialStats, PoolHealth, PoolStats};
