//! Caller-facing generation API
//!
//! Pipeline stages describe what they want with `CallOptions`; sampling
//! parameters they leave unset come from configured defaults.

use std::sync::Arc;

use provider::CallRequest;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::decode::{Decoded, decode_extraction};
use crate::dispatcher::{CallDispatcher, TextStream};
use crate::error::CallError;
use crate::extract::{Expectation, Shape};

/// Sampling defaults applied when options leave them unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: CallRequest::DEFAULT_TEMPERATURE,
            max_output_tokens: CallRequest::DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

/// What a caller asks for. Also the JSON body of the gateway's generate endpoints.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub instruction: String,
    pub content: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub json_mode: bool,
    pub grounding: bool,
}

impl CallOptions {
    pub fn new(instruction: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
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
}

/// Generation client shared by pipeline stages.
#[derive(Clone)]
pub struct GenerationClient {
    dispatcher: Arc<CallDispatcher>,
    defaults: GenerationDefaults,
}

impl GenerationClient {
    pub fn new(dispatcher: Arc<CallDispatcher>, defaults: GenerationDefaults) -> Self {
        Self {
            dispatcher,
            defaults,
        }
    }

    pub fn dispatcher(&self) -> &Arc<CallDispatcher> {
        &self.dispatcher
    }

    /// Build the backend request, filling unset sampling parameters.
    pub fn request_for(&self, options: &CallOptions) -> CallRequest {
        let mut request = CallRequest::new(options.instruction.clone(), options.content.clone())
            .with_temperature(options.temperature.unwrap_or(self.defaults.temperature))
            .with_max_output_tokens(
                options
                    .max_output_tokens
                    .unwrap_or(self.defaults.max_output_tokens),
            );
        request.json_mode = options.json_mode;
        request.grounding = options.grounding;
        request
    }

    /// Complete text; with `json_mode` it is the extracted JSON text.
    pub async fn call(&self, options: &CallOptions) -> Result<String, CallError> {
        self.dispatcher.dispatch(&self.request_for(options)).await
    }

    /// Streamed text.
    pub async fn call_streaming(&self, options: &CallOptions) -> Result<TextStream, CallError> {
        let request = self.request_for(options).streaming();
        self.dispatcher.dispatch_streaming(&request).await
    }

    /// Decode the answer into `T`, substituting `T::default()` when the
    /// output is unusable. Backend failures are still errors.
    pub async fn call_decoded<T>(
        &self,
        options: &CallOptions,
        shape: Shape,
    ) -> Result<Decoded<T>, CallError>
    where
        T: DeserializeOwned + Default,
    {
        let request = self.request_for(options).json();
        let extraction = self
            .dispatcher
            .dispatch_structured(&request, Expectation::new(shape).or_default())
            .await?;
        Ok(decode_extraction(extraction))
    }
}
