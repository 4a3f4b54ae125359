//! Error types for pool construction

/// Errors from building a pool or its policies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credentials configured")]
    NoCredentials,

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
