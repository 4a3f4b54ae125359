//! Generation endpoints
//!
//! - `POST /v1/generate`: one complete answer
//! - `POST /v1/generate/stream`: server-sent events (`chunk`, then `done` or `error`)
//! - `POST /v1/generate/batch`: many calls, paced in batches, one result each
//!
//! Request bodies are `CallOptions` JSON. Failures before any output are
//! plain JSON errors with the category's status code.

use std::convert::Infallible;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use dispatch::{CallError, CallOptions, TextStream, run_batched};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn validate(options: &CallOptions, request_id: &str) -> Result<(), ApiError> {
    if options.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty", request_id));
    }
    if let Some(t) = options.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(ApiError::bad_request(
                format!("temperature must be between 0 and 2, got {t}"),
                request_id,
            ));
        }
    }
    if options.max_output_tokens == Some(0) {
        return Err(ApiError::bad_request(
            "max_output_tokens must be greater than 0",
            request_id,
        ));
    }
    Ok(())
}

/// Successful call as JSON. Json-mode answers also carry the parsed value.
fn completion_body(text: String, json_mode: bool, request_id: &str) -> serde_json::Value {
    let mut body = serde_json::json!({ "request_id": request_id });
    if json_mode {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            body["json"] = value;
        }
    }
    body["text"] = serde_json::Value::String(text);
    body
}

fn finish(state: &AppState, endpoint: &'static str, started: Instant, status: StatusCode) {
    if !status.is_success() {
        state.metrics.record_error();
    }
    metrics::record_request(endpoint, status.as_u16(), started.elapsed().as_secs_f64());
}

/// POST /v1/generate
pub async fn generate_handler(
    State(state): State<AppState>,
    body: Result<Json<CallOptions>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    let _guard = state.metrics.begin();
    let started = Instant::now();

    let response = match body {
        Ok(Json(options)) => generate(&state, options, &request_id).await,
        Err(rejection) => ApiError::bad_request(rejection.body_text(), &request_id).into_response(),
    };
    finish(&state, "generate", started, response.status());
    response
}

#[instrument(skip_all, fields(request_id = %request_id, json_mode = options.json_mode))]
async fn generate(state: &AppState, options: CallOptions, request_id: &str) -> Response {
    if let Err(e) = validate(&options, request_id) {
        return e.into_response();
    }
    match state.client.call(&options).await {
        Ok(text) => {
            info!(chars = text.len(), "generation complete");
            Json(completion_body(text, options.json_mode, request_id)).into_response()
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "generation failed");
            ApiError::from_call(&e, request_id).into_response()
        }
    }
}

/// POST /v1/generate/stream
pub async fn stream_handler(
    State(state): State<AppState>,
    body: Result<Json<CallOptions>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    let _guard = state.metrics.begin();
    let started = Instant::now();

    let response = match body {
        Ok(Json(options)) => stream(&state, options, &request_id).await,
        Err(rejection) => ApiError::bad_request(rejection.body_text(), &request_id).into_response(),
    };
    // Time to first chunk; the body keeps streaming after this returns.
    finish(&state, "stream", started, response.status());
    response
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn stream(state: &AppState, options: CallOptions, request_id: &str) -> Response {
    if let Err(e) = validate(&options, request_id) {
        return e.into_response();
    }
    match state.client.call_streaming(&options).await {
        Ok(chunks) => Sse::new(sse_events(chunks, request_id.to_string()))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "stream could not start");
            ApiError::from_call(&e, request_id).into_response()
        }
    }
}

struct EventState {
    chunks: TextStream,
    request_id: String,
    finished: bool,
}

/// Chunk events until the text ends (`done`) or fails (`error`).
fn sse_events(
    chunks: TextStream,
    request_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = EventState {
        chunks,
        request_id,
        finished: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let event = match state.chunks.next().await {
            Some(Ok(text)) => Event::default()
                .event("chunk")
                .data(serde_json::json!({ "text": text }).to_string()),
            Some(Err(e)) => {
                state.finished = true;
                warn!(request_id = %state.request_id, error = %e, "stream interrupted");
                let error = ApiError::from_call(&e, &state.request_id);
                Event::default()
                    .event("error")
                    .data(serde_json::json!({ "error": error.body() }).to_string())
            }
            None => {
                state.finished = true;
                Event::default()
                    .event("done")
                    .data(serde_json::json!({ "request_id": state.request_id }).to_string())
            }
        };
        Some((Ok(event), state))
    })
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<CallOptions>,
}

/// POST /v1/generate/batch
pub async fn batch_handler(
    State(state): State<AppState>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    let _guard = state.metrics.begin();
    let started = Instant::now();

    let response = match body {
        Ok(Json(batch)) => run_batch(&state, batch.items, &request_id).await,
        Err(rejection) => ApiError::bad_request(rejection.body_text(), &request_id).into_response(),
    };
    finish(&state, "batch", started, response.status());
    response
}

#[instrument(skip_all, fields(request_id = %request_id, items = items.len()))]
async fn run_batch(state: &AppState, items: Vec<CallOptions>, request_id: &str) -> Response {
    if items.is_empty() {
        return ApiError::bad_request("items must not be empty", request_id).into_response();
    }
    if items.len() > state.max_batch_items {
        return ApiError::bad_request(
            format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                state.max_batch_items
            ),
            request_id,
        )
        .into_response();
    }
    for (index, options) in items.iter().enumerate() {
        if let Err(e) = validate(options, request_id) {
            let message = format!("item {index}: {}", e.body()["message"].as_str().unwrap_or_default());
            return ApiError::bad_request(message, request_id).into_response();
        }
    }

    let client = state.client.clone();
    let outcomes: Vec<(bool, Result<String, CallError>)> = run_batched(items, state.batch, |options| {
        let client = client.clone();
        async move { (options.json_mode, client.call(&options).await) }
    })
    .await;

    let mut failed = 0usize;
    let results: Vec<serde_json::Value> = outcomes
        .into_iter()
        .map(|(json_mode, outcome)| match outcome {
            Ok(text) => completion_body(text, json_mode, request_id),
            Err(e) => {
                failed += 1;
                warn!(error = %e, kind = e.kind(), "batch item failed");
                serde_json::json!({ "error": ApiError::from_call(&e, request_id).body() })
            }
        })
        .collect();

    info!(succeeded = results.len() - failed, failed, "batch complete");
    Json(serde_json::json!({
        "request_id": request_id,
        "succeeded": results.len() - failed,
        "failed": failed,
        "results": results,
    }))
    .into_response()
}
