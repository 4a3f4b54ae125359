//! API error responses
//!
//! Every failed request answers `{"error":{"type","message","request_id"}}`.
//! Call failures are reduced to their `FailureCategory`; backend text never
//! reaches the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dispatch::{CallError, FailureCategory};

/// Client-facing error with the request id it belongs to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    request_id: String,
}

impl ApiError {
    /// Failed call, normalized to its category.
    pub fn from_call(error: &CallError, request_id: &str) -> Self {
        Self::from_category(error.category(), request_id)
    }

    pub fn from_category(category: FailureCategory, request_id: &str) -> Self {
        Self {
            status: StatusCode::from_u16(category.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            kind: category.label(),
            message: category.message().to_string(),
            request_id: request_id.to_string(),
        }
    }

    /// Request the gateway refuses before dispatching anything.
    pub fn bad_request(message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    /// The `error` object, also used inline in batch results and SSE events.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind,
            "message": self.message,
            "request_id": self.request_id,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.body() });
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
