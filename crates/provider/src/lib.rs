//! Backend abstraction for generative-AI calls
//!
//! Defines the `Backend` trait that decouples call dispatch from the concrete
//! AI service. A backend takes one credential and one `CallRequest` and
//! returns either the complete text or a token stream. It never rotates
//! credentials or retries; that belongs to the dispatcher.
//!
//! Backend failures are reported as `BackendError` and mapped to an
//! `ErrorClassification` that drives credential state transitions:
//! - RateLimited puts the credential into escalating cooldown
//! - QuotaExhausted marks it exhausted until the daily reset
//! - Unauthorized removes it from rotation permanently
//! - everything else is retried on another credential without penalty

pub mod gemini;

pub use gemini::GeminiBackend;

use common::Secret;
use futures_util::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Classification of backend errors to determine retry/failover strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Short-lived per-credential throttle (429 without a daily-quota signature)
    RateLimited,
    /// Daily quota used up for this credential
    QuotaExhausted,
    /// Credential rejected (401/403 or an invalid-key 400)
    Unauthorized,
    /// The request itself is invalid; every credential would reject it
    MalformedRequest,
    /// 5xx, unexpected status, or an unparseable success body
    ServerError,
    /// Connection failure or timeout
    Network,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::QuotaExhausted => "quota_exhausted",
            ErrorClassification::Unauthorized => "unauthorized",
            ErrorClassification::MalformedRequest => "malformed_request",
            ErrorClassification::ServerError => "server_error",
            ErrorClassification::Network => "network",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from a single backend call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    /// HTTP status, if the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Boxed future used by the dyn-compatible `Backend` trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazily produced text chunks from a streaming call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One logical generation request. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub instruction: String,
    pub content: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Ask the backend for JSON output; the dispatcher also runs extraction.
    pub json_mode: bool,
    /// Allow the backend to ground its answer with web search.
    pub grounding: bool,
    /// Deliver the answer as a chunk stream.
    pub stream: bool,
}

impl CallRequest {
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

    pub fn new(instruction: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            content: content.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_output_tokens: Self::DEFAULT_MAX_OUTPUT_TOKENS,
            json_mode: false,
            grounding: false,
            stream: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn grounded(mut self) -> Self {
        self.grounding = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Abstraction over the generative-AI service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Backend>`).
pub trait Backend: Send + Sync {
    /// Identifier for logging (e.g. "gemini").
    fn id(&self) -> &str;

    /// Issue a request and wait for the complete text.
    fn generate<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, Result<String>>;

    /// Open a token stream.
    ///
    /// An `Err` here means nothing was delivered (status error, connection
    /// failure). Errors after the stream opened arrive as stream items.
    fn generate_stream<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, Result<ChunkStream>>;
}
