//! Gemini-style generative language backend over HTTP.
//!
//! Non-streaming calls POST to `:generateContent`; streaming calls POST to
//! `:streamGenerateContent?alt=sse` and decode `data:` lines into text chunks.
//! The credential travels in the `x-goog-api-key` header and is never logged.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use common::Secret;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::{Backend, BackendError, BoxFuture, CallRequest, ChunkStream, Result};

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Public endpoint of the generative language API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// HTTP backend for Gemini-compatible `generateContent` endpoints.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{method}",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    /// POST the request body; non-2xx answers become `BackendError::Status`.
    async fn post(
        &self,
        url: String,
        key: &Secret<String>,
        request: &CallRequest,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, key.expose().as_str())
            .json(&build_body(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl Backend for GeminiBackend {
    fn id(&self) -> &str {
        "gemini"
    }

    fn generate<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let response = self
                .post(self.endpoint("generateContent"), key, request)
                .await?;
            let bytes = response.bytes().await.map_err(transport_error)?;
            let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)
                .map_err(|e| BackendError::MalformedResponse(format!("invalid JSON body: {e}")))?;
            completion_text(parsed)
        })
    }

    fn generate_stream<'a>(
        &'a self,
        key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, Result<ChunkStream>> {
        Box::pin(async move {
            let response = self
                .post(self.endpoint("streamGenerateContent?alt=sse"), key, request)
                .await?;
            debug!(model = %self.model, "backend stream opened");
            Ok(sse_chunks(response.bytes_stream()))
        })
    }
}

/// Build the `generateContent` request body.
///
/// JSON mime type and search grounding are mutually exclusive on this API, so
/// grounding wins and JSON output is left to the extractor.
fn build_body(request: &CallRequest) -> serde_json::Value {
    let mut generation_config = serde_json::json!({
        "temperature": request.temperature,
        "maxOutputTokens": request.max_output_tokens,
    });
    if request.json_mode && !request.grounding {
        generation_config["responseMimeType"] = serde_json::json!("application/json");
    }

    let mut body = serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.content }],
        }],
        "generationConfig": generation_config,
    });
    if !request.instruction.is_empty() {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{ "text": request.instruction }],
        });
    }
    if request.grounding {
        body["tools"] = serde_json::json!([{ "googleSearch": {} }]);
    }
    body
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else {
        BackendError::Network(e.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl GenerateContentResponse {
    /// Visible text of the first candidate; thought parts are skipped.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

/// Turn a complete response into text, or explain why there is none.
fn completion_text(response: GenerateContentResponse) -> Result<String> {
    if let Some(err) = response.error {
        return Err(BackendError::Status {
            status: err.code,
            body: err.message,
        });
    }
    let text = response.text();
    if !text.is_empty() {
        return Ok(text);
    }
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_deref())
    {
        return Err(BackendError::MalformedResponse(format!(
            "prompt blocked: {reason}"
        )));
    }
    let finish = response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
        .unwrap_or("none");
    Err(BackendError::MalformedResponse(format!(
        "empty completion (finish reason: {finish})"
    )))
}

/// Decode one SSE line. `None` for non-data lines, keep-alives, and empty deltas.
fn parse_sse_line(line: &[u8]) -> Option<Result<String>> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(b"data:")?;
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);
    if payload.is_empty() || payload == b"[DONE]" {
        return None;
    }
    match serde_json::from_slice::<GenerateContentResponse>(payload) {
        Ok(event) => {
            if let Some(err) = event.error {
                return Some(Err(BackendError::Status {
                    status: err.code,
                    body: err.message,
                }));
            }
            let text = event.text();
            (!text.is_empty()).then_some(Ok(text))
        }
        Err(e) => Some(Err(BackendError::MalformedResponse(format!(
            "invalid stream event: {e}"
        )))),
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> SseState<S> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = parse_sse_line(&line) {
                self.pending.push_back(item);
            }
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.buffer);
        if let Some(item) = parse_sse_line(&rest) {
            self.pending.push_back(item);
        }
    }
}

/// Adapt a raw SSE byte stream into text chunks.
///
/// Lines are split on raw bytes before UTF-8 decoding, so a multi-byte
/// character split across network chunks is reassembled intact. A read error
/// ends the stream after being yielded once.
fn sse_chunks<S, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::with_capacity(4 * 1024),
        pending: VecDeque::new(),
        finished: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer.clear();
                    state.pending.push_back(Err(BackendError::Network(format!(
                        "stream read failed: {e}"
                    ))));
                }
                None => {
                    state.finished = true;
                    state.flush();
                }
            }
        }
    }))
}
