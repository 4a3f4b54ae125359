//! Classification of backend failures
//!
//! A 429 is either a short per-minute throttle or the daily quota running
//! out; only the body tells them apart. A 400 is usually the request's fault,
//! except when the backend is complaining about the key itself.

use provider::{BackendError, ErrorClassification};

/// Phrases that mark a 429 as the daily quota rather than a throttle.
const DAILY_QUOTA_PATTERNS: &[&str] = &[
    "per day",
    "perday",
    "per_day",
    "daily",
    "requests per day",
];

/// Phrases that mark a 400 as a rejected key.
const INVALID_KEY_PATTERNS: &[&str] = &["api key not valid", "api_key_invalid", "invalid api key"];

/// Classify a 429 body as daily quota exhaustion or a transient throttle.
pub fn classify_429(body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    if DAILY_QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClassification::QuotaExhausted
    } else {
        ErrorClassification::RateLimited
    }
}

/// Classify a non-2xx answer by status and body.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => classify_429(body),
        401 | 403 => ErrorClassification::Unauthorized,
        400 => {
            let lower = body.to_lowercase();
            if INVALID_KEY_PATTERNS.iter().any(|p| lower.contains(p)) {
                ErrorClassification::Unauthorized
            } else {
                ErrorClassification::MalformedRequest
            }
        }
        _ => ErrorClassification::ServerError,
    }
}

/// Classify any backend error.
pub fn classify(error: &BackendError) -> ErrorClassification {
    match error {
        BackendError::Status { status, body } => classify_status(*status, body),
        BackendError::Timeout(_) | BackendError::Network(_) => ErrorClassification::Network,
        BackendError::MalformedResponse(_) => ErrorClassification::ServerError,
    }
}
