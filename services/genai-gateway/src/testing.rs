//! Stub backend and app state for router tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Secret;
use credential_pool::{CooldownPolicy, CredentialPool, GatePolicy, GateTier, RateGate};
use dispatch::{BatchPolicy, CallDispatcher, DispatchPolicy, GenerationClient, GenerationDefaults};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use provider::{Backend, BackendError, BoxFuture, CallRequest, ChunkStream};

use crate::AppState;
use crate::service::ServiceMetrics;

/// Backend answering from a shared queue; empty queue answers `"ok: <content>"`.
///
/// A reply is a list of chunks: complete calls concatenate them, streaming
/// calls yield them one by one.
#[derive(Default)]
pub struct StubBackend {
    replies: Mutex<VecDeque<Result<Vec<Result<String, BackendError>>, BackendError>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.push(Ok(vec![Ok(text.to_string())]))
    }

    pub fn fail(self, error: BackendError) -> Self {
        self.push(Err(error))
    }

    pub fn chunks(self, chunks: Vec<Result<String, BackendError>>) -> Self {
        self.push(Ok(chunks))
    }

    fn push(self, reply: Result<Vec<Result<String, BackendError>>, BackendError>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    fn next(&self, request: &CallRequest) -> Result<Vec<Result<String, BackendError>>, BackendError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![Ok(format!("ok: {}", request.content))]))
    }
}

impl Backend for StubBackend {
    fn id(&self) -> &str {
        "stub"
    }

    fn generate<'a>(
        &'a self,
        _key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, provider::Result<String>> {
        let reply = self.next(request);
        Box::pin(async move {
            reply.and_then(|chunks| {
                chunks
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()
                    .map(|chunks| chunks.concat())
            })
        })
    }

    fn generate_stream<'a>(
        &'a self,
        _key: &'a Secret<String>,
        request: &'a CallRequest,
    ) -> BoxFuture<'a, provider::Result<ChunkStream>> {
        let reply = self.next(request);
        Box::pin(async move {
            reply.map(|chunks| -> ChunkStream { Box::pin(futures_util::stream::iter(chunks)) })
        })
    }
}

pub fn rate_limited() -> BackendError {
    BackendError::Status {
        status: 429,
        body: r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#.into(),
    }
}

pub fn daily_quota() -> BackendError {
    BackendError::Status {
        status: 429,
        body: r#"{"error":{"message":"Quota exceeded for metric 'Generate requests per day'"}}"#.into(),
    }
}

pub fn test_pool(keys: usize) -> Arc<CredentialPool> {
    let keys = (0..keys)
        .map(|i| Secret::new(format!("AIzaSyTest-{i:04}")))
        .collect();
    Arc::new(CredentialPool::new(keys, CooldownPolicy::default()).unwrap())
}

pub fn test_prometheus_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// App state over `backend` with a short gate and no batch delay.
pub fn test_app_state(backend: StubBackend, pool: Arc<CredentialPool>) -> AppState {
    let gate = GatePolicy::new(vec![GateTier {
        min_credentials: 1,
        interval: Duration::from_millis(10),
    }])
    .unwrap();
    let gate = Arc::new(RateGate::new(pool, gate));
    let dispatcher = CallDispatcher::new(Arc::new(backend), gate, DispatchPolicy::default());
    AppState {
        client: GenerationClient::new(Arc::new(dispatcher), GenerationDefaults::default()),
        batch: BatchPolicy {
            size: 2,
            delay: Duration::ZERO,
        },
        max_batch_items: 4,
        metrics: ServiceMetrics::new(),
        prometheus: test_prometheus_handle(),
    }
}
