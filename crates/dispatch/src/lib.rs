//! Call dispatch over a credential pool
//!
//! `CallDispatcher` turns one logical generation request into as many backend
//! attempts as it takes, rotating credentials and reporting each outcome to
//! the pool. Structured output goes through `extract`, which recovers JSON
//! from fenced, wrapped, or slightly broken model answers. `GenerationClient`
//! is the surface pipeline stages use; `run_batched` paces their fan-out.

pub mod batch;
pub mod client;
pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod extract;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchPolicy, run_batched};
pub use client::{CallOptions, GenerationClient, GenerationDefaults};
pub use decode::{Decoded, decode, decode_extraction};
pub use dispatcher::{CallDispatcher, CallResult, DispatchPolicy, TextStream};
pub use error::{CallError, ExhaustionSummary, FailureCategory};
pub use extract::{
    Expectation, Extraction, MalformedOutput, Shape, Strategy, extract, extract_or_default,
};
