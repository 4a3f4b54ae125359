//! Typed decoding with fallback
//!
//! Pipeline stages would rather continue with an empty result than abort a
//! whole batch because one answer was unusable. `Decoded` records which of
//! the two happened so callers can still count or log the fallbacks.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::extract::{Extraction, Shape, Strategy, extract_or_default};

/// Outcome of decoding model output into `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// Output decoded; missing fields took their serde defaults.
    Ok(T),
    /// Output unusable; this is `T::default()`.
    Default(T),
}

impl<T> Decoded<T> {
    pub fn is_default(&self) -> bool {
        matches!(self, Decoded::Default(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Decoded::Ok(value) | Decoded::Default(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Decoded::Ok(value) | Decoded::Default(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Ok(value) => Decoded::Ok(f(value)),
            Decoded::Default(value) => Decoded::Default(f(value)),
        }
    }
}

/// Extract a payload of `shape` from raw output and decode it into `T`.
pub fn decode<T>(raw: &str, shape: Shape) -> Decoded<T>
where
    T: DeserializeOwned + Default,
{
    decode_extraction(extract_or_default(raw, shape))
}

/// Decode an already extracted payload.
pub fn decode_extraction<T>(extraction: Extraction) -> Decoded<T>
where
    T: DeserializeOwned + Default,
{
    if extraction.strategy == Strategy::Default {
        return Decoded::Default(T::default());
    }
    match serde_json::from_value::<T>(extraction.value) {
        Ok(value) => Decoded::Ok(value),
        Err(e) => {
            warn!(
                error = %e,
                target_type = std::any::type_name::<T>(),
                "structured output did not match schema, using default"
            );
            Decoded::Default(T::default())
        }
    }
}
