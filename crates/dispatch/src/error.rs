//! Call errors and their user-facing categories

use provider::{BackendError, ErrorClassification};
use serde::Serialize;

use crate::extract::MalformedOutput;

/// Pool composition when a call failed fast on exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExhaustionSummary {
    pub total: usize,
    pub dead: usize,
    pub daily_exhausted: usize,
}

/// Errors from one logical call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Every credential is dead or over its daily quota; nothing was sent.
    #[error(
        "all {} credentials unusable ({} rejected, {} over daily quota)",
        .0.total, .0.dead, .0.daily_exhausted
    )]
    QuotaExhausted(ExhaustionSummary),

    /// The backend refused the request itself; other credentials would too.
    #[error("request rejected by backend: {0}")]
    Rejected(BackendError),

    #[error("gave up after {attempts} attempts, last failure {classification}: {last}")]
    AttemptsExhausted {
        attempts: u32,
        classification: ErrorClassification,
        last: BackendError,
    },

    /// Failure after output started; partial output was already delivered.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(BackendError),

    #[error(transparent)]
    MalformedOutput(#[from] MalformedOutput),
}

impl CallError {
    /// Normalized category for end users.
    pub fn category(&self) -> FailureCategory {
        match self {
            CallError::QuotaExhausted(summary) if summary.dead == summary.total => {
                FailureCategory::InvalidCredential
            }
            CallError::QuotaExhausted(_) => FailureCategory::QuotaExhausted,
            CallError::Rejected(_) => FailureCategory::InvalidRequest,
            CallError::AttemptsExhausted { classification, .. } => {
                FailureCategory::from_classification(*classification)
            }
            CallError::StreamInterrupted(error) => {
                FailureCategory::from_classification(credential_pool::classify(error))
            }
            CallError::MalformedOutput(_) => FailureCategory::ServerError,
        }
    }

    /// Label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::QuotaExhausted(_) => "quota_exhausted",
            CallError::Rejected(_) => "rejected",
            CallError::AttemptsExhausted { .. } => "attempts_exhausted",
            CallError::StreamInterrupted(_) => "stream_interrupted",
            CallError::MalformedOutput(_) => "malformed_output",
        }
    }
}

/// The small set of failure kinds shown to end users, each with a fixed,
/// actionable message instead of raw backend text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    QuotaExhausted,
    RateLimited,
    Network,
    InvalidCredential,
    ServerError,
    InvalidRequest,
}

impl FailureCategory {
    pub fn from_classification(classification: ErrorClassification) -> Self {
        match classification {
            ErrorClassification::RateLimited => FailureCategory::RateLimited,
            ErrorClassification::QuotaExhausted => FailureCategory::QuotaExhausted,
            ErrorClassification::Unauthorized => FailureCategory::InvalidCredential,
            ErrorClassification::MalformedRequest => FailureCategory::InvalidRequest,
            ErrorClassification::ServerError => FailureCategory::ServerError,
            ErrorClassification::Network => FailureCategory::Network,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureCategory::QuotaExhausted => "quota_exhausted",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Network => "network_error",
            FailureCategory::InvalidCredential => "invalid_credential",
            FailureCategory::ServerError => "server_error",
            FailureCategory::InvalidRequest => "invalid_request",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FailureCategory::QuotaExhausted => {
                "Daily quota is used up on every API key. Wait for the quota reset or add API keys."
            }
            FailureCategory::RateLimited => {
                "The AI service is rate limiting requests. Retry in a few seconds."
            }
            FailureCategory::Network => {
                "Could not reach the AI service. Check connectivity and retry."
            }
            FailureCategory::InvalidCredential => {
                "No valid API key is available. Check the configured keys."
            }
            FailureCategory::ServerError => {
                "The AI service did not return a usable answer. Retry shortly."
            }
            FailureCategory::InvalidRequest => {
                "The AI service rejected the request. Check its parameters."
            }
        }
    }

    /// HTTP status used when the category reaches an HTTP client.
    pub fn http_status(&self) -> u16 {
        match self {
            FailureCategory::QuotaExhausted | FailureCategory::RateLimited => 429,
            FailureCategory::Network => 504,
            FailureCategory::InvalidCredential => 503,
            FailureCategory::ServerError => 502,
            FailureCategory::InvalidRequest => 400,
        }
    }
}
