//! Credential rotation and retry around a single backend call
//!
//! One logical request becomes up to `attempts` network calls, each on the
//! credential the pool hands out. Throttles, rejected keys, and transport
//! failures move on to the next credential; a request the backend refuses
//! outright stops immediately. Streaming calls are retried only until the
//! first chunk arrives.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use credential_pool::{CredentialPool, Penalty, RateGate, classify};
use futures_util::{Stream, StreamExt};
use provider::{Backend, BackendError, CallRequest, ChunkStream, ErrorClassification};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::{CallError, ExhaustionSummary};
use crate::extract::{Expectation, Extraction, Shape, extract, extract_or_default};

/// Text chunks of a streamed answer. A failure after the first chunk arrives
/// as a final `StreamInterrupted` item.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, CallError>> + Send>>;

/// Result of `execute`, shaped by the request's streaming flag.
pub enum CallResult {
    Complete(String),
    Stream(TextStream),
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallResult::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            CallResult::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Retry and timeout tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Upper bound on network attempts per logical call.
    pub max_attempts: u32,
    /// Passes over the pool one logical call may make, still capped by
    /// `max_attempts`.
    pub rotations: u32,
    /// Wall-clock limit for a complete answer, or for the first chunk of a stream.
    pub request_timeout: Duration,
    /// Longest gap allowed between stream chunks; `None` waits forever.
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rotations: 1,
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

enum Delivery {
    Complete(String),
    Streaming(ChunkStream),
}

/// Dispatches logical calls over a credential pool.
pub struct CallDispatcher {
    backend: Arc<dyn Backend>,
    pool: Arc<CredentialPool>,
    gate: Arc<RateGate>,
    policy: DispatchPolicy,
}

impl CallDispatcher {
    pub fn new(backend: Arc<dyn Backend>, gate: Arc<RateGate>, policy: DispatchPolicy) -> Self {
        Self {
            backend,
            pool: gate.pool().clone(),
            gate,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Network attempts allowed for one logical call: one per credential and
    /// rotation, at least two, at most `max_attempts`.
    pub fn attempt_budget(&self) -> u32 {
        let size = u32::try_from(self.pool.size()).unwrap_or(u32::MAX);
        size.saturating_mul(self.policy.rotations.max(1))
            .clamp(2, self.policy.max_attempts.max(2))
    }

    /// Complete answer. In json mode the text has been through extraction.
    pub async fn dispatch(&self, request: &CallRequest) -> Result<String, CallError> {
        let text = self.complete(request).await?;
        if request.json_mode {
            return Ok(extract(&text, Shape::Any)?.text);
        }
        Ok(text)
    }

    /// Complete answer decoded against a shape expectation.
    pub async fn dispatch_structured(
        &self,
        request: &CallRequest,
        expectation: Expectation,
    ) -> Result<Extraction, CallError> {
        let text = self.complete(request).await?;
        if expectation.default_on_failure {
            Ok(extract_or_default(&text, expectation.shape))
        } else {
            Ok(extract(&text, expectation.shape)?)
        }
    }

    /// Streamed answer. Errors before the first chunk are retried on other
    /// credentials; errors after it end the stream.
    pub async fn dispatch_streaming(&self, request: &CallRequest) -> Result<TextStream, CallError> {
        match self.run(request, true).await? {
            (Delivery::Streaming(chunks), index) => Ok(self.text_stream(chunks, index)),
            (Delivery::Complete(text), _) => {
                Ok(Box::pin(futures_util::stream::once(async move { Ok(text) })))
            }
        }
    }

    /// Dispatch by the request's streaming flag.
    pub async fn execute(&self, request: &CallRequest) -> Result<CallResult, CallError> {
        if request.stream {
            self.dispatch_streaming(request).await.map(CallResult::Stream)
        } else {
            self.dispatch(request).await.map(CallResult::Complete)
        }
    }

    async fn complete(&self, request: &CallRequest) -> Result<String, CallError> {
        match self.run(request, false).await? {
            (Delivery::Complete(text), _) => Ok(text),
            // Only reachable if a backend streamed when asked not to.
            (Delivery::Streaming(mut chunks), _) => {
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    text.push_str(&chunk.map_err(CallError::StreamInterrupted)?);
                }
                Ok(text)
            }
        }
    }

    /// The attempt loop. Returns the delivery and the credential index that served it.
    #[instrument(skip_all, fields(backend = self.backend.id(), streaming = streaming))]
    async fn run(&self, request: &CallRequest, streaming: bool) -> Result<(Delivery, usize), CallError> {
        let budget = self.attempt_budget();
        let mut last: Option<(ErrorClassification, BackendError)> = None;

        for attempt in 1..=budget {
            if self.pool.all_exhausted() {
                let summary = self.exhaustion_summary();
                warn!(
                    total = summary.total,
                    dead = summary.dead,
                    daily_exhausted = summary.daily_exhausted,
                    "credential pool exhausted, failing fast"
                );
                record_outcome("quota_exhausted");
                return Err(CallError::QuotaExhausted(summary));
            }

            let lease = self.pool.acquire();
            let now = Instant::now();
            let reservation = self.gate.reserve(lease.index, now + lease.cooldown_remaining);
            let start_at = reservation.at();
            if start_at > now {
                debug!(
                    credential = %lease.label(),
                    index = lease.index,
                    delay_ms = (start_at - now).as_millis() as u64,
                    "waiting for credential"
                );
                tokio::time::sleep_until(start_at).await;
            }
            reservation.commit();

            match self.send(&lease.key, request, streaming).await {
                Ok(delivery) => {
                    self.pool.reward(lease.index);
                    record_attempt("success");
                    record_outcome("success");
                    debug!(credential = %lease.label(), index = lease.index, attempt, "call succeeded");
                    return Ok((delivery, lease.index));
                }
                Err(error) => {
                    let classification = classify(&error);
                    record_attempt(classification.label());
                    warn!(
                        credential = %lease.label(),
                        index = lease.index,
                        attempt,
                        budget,
                        %classification,
                        error = %error,
                        "call attempt failed"
                    );
                    match classification {
                        ErrorClassification::RateLimited => {
                            self.pool.penalize(lease.index, Penalty::Throttled)
                        }
                        ErrorClassification::QuotaExhausted => {
                            self.pool.penalize(lease.index, Penalty::QuotaExhausted)
                        }
                        ErrorClassification::Unauthorized => self.pool.mark_dead(lease.index),
                        ErrorClassification::MalformedRequest => {
                            self.pool.record_error(lease.index);
                            record_outcome("rejected");
                            return Err(CallError::Rejected(error));
                        }
                        ErrorClassification::ServerError | ErrorClassification::Network => {
                            self.pool.record_error(lease.index)
                        }
                    }
                    last = Some((classification, error));
                }
            }
        }

        record_outcome("attempts_exhausted");
        Err(match last {
            Some((classification, last)) => CallError::AttemptsExhausted {
                attempts: budget,
                classification,
                last,
            },
            None => CallError::QuotaExhausted(self.exhaustion_summary()),
        })
    }

    /// One network attempt, bounded by the request timeout. For streams the
    /// timeout covers opening the stream and receiving the first chunk.
    async fn send(
        &self,
        key: &Secret<String>,
        request: &CallRequest,
        streaming: bool,
    ) -> Result<Delivery, BackendError> {
        let limit = self.policy.request_timeout;
        let timed_out = || BackendError::Timeout(format!("no response within {}s", limit.as_secs()));

        if !streaming {
            return match tokio::time::timeout(limit, self.backend.generate(key, request)).await {
                Ok(result) => result.map(Delivery::Complete),
                Err(_) => Err(timed_out()),
            };
        }

        let first_chunk = async {
            let mut chunks = match self.backend.generate_stream(key, request).await {
                Ok(chunks) => chunks,
                Err(e) => return Err(e),
            };
            match chunks.next().await {
                Some(Ok(first)) => Ok((first, chunks)),
                Some(Err(e)) => Err(e),
                None => Err(BackendError::MalformedResponse(
                    "stream ended before the first chunk".into(),
                )),
            }
        };
        match tokio::time::timeout(limit, first_chunk).await {
            Ok(Ok((first, rest))) => {
                let replay = futures_util::stream::once(async move { Ok(first) });
                Ok(Delivery::Streaming(Box::pin(replay.chain(rest))))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        }
    }

    /// Adapt backend chunks for the consumer: idle timeout, and the first
    /// error ends the stream as `StreamInterrupted`.
    fn text_stream(&self, chunks: ChunkStream, index: usize) -> TextStream {
        let idle = self.policy.stream_idle_timeout;
        let pool = self.pool.clone();

        Box::pin(futures_util::stream::unfold(
            Some(chunks),
            move |state| {
                let pool = pool.clone();
                async move {
                    let mut chunks = state?;
                    let next = match idle {
                        Some(limit) => match tokio::time::timeout(limit, chunks.next()).await {
                            Ok(item) => item,
                            Err(_) => Some(Err(BackendError::Timeout(format!(
                                "no chunk within {}s",
                                limit.as_secs()
                            )))),
                        },
                        None => chunks.next().await,
                    };
                    match next {
                        Some(Ok(text)) => Some((Ok(text), Some(chunks))),
                        Some(Err(error)) => {
                            warn!(index, error = %error, "stream interrupted after output started");
                            pool.record_error(index);
                            record_outcome("stream_interrupted");
                            Some((Err(CallError::StreamInterrupted(error)), None))
                        }
                        None => None,
                    }
                }
            },
        ))
    }

    fn exhaustion_summary(&self) -> ExhaustionSummary {
        let stats = self.pool.stats();
        ExhaustionSummary {
            total: stats.total,
            dead: stats.dead,
            daily_exhausted: stats.exhausted,
        }
    }
}

fn record_attempt(classification: &'static str) {
    metrics::counter!("genai_dispatch_attempts_total", "classification" => classification)
        .increment(1);
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("genai_dispatch_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Reply, ScriptedBackend, bad_request, daily_quota, invalid_key, server_error, throttled,
    };
    use credential_pool::{CooldownPolicy, GatePolicy, GateTier};
    use serde_json::json;

    const KEYS: [&str; 3] = ["key-0000000", "key-1111111", "key-2222222"];

    fn dispatcher_with(
        backend: ScriptedBackend,
        keys: &[&str],
        policy: DispatchPolicy,
    ) -> (CallDispatcher, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let secrets = keys.iter().map(|k| Secret::new(k.to_string())).collect();
        let pool = Arc::new(CredentialPool::new(secrets, CooldownPolicy::default()).unwrap());
        let gate = Arc::new(RateGate::new(pool, GatePolicy::default()));
        let dispatcher = CallDispatcher::new(backend.clone(), gate, policy);
        (dispatcher, backend)
    }

    /// Pool over `keys` with a 1ms gate, for tests on a real clock.
    fn fast_dispatcher(backend: ScriptedBackend, keys: &[&str]) -> (CallDispatcher, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let secrets = keys.iter().map(|k| Secret::new(k.to_string())).collect();
        let pool = Arc::new(CredentialPool::new(secrets, CooldownPolicy::default()).unwrap());
        let gate = GatePolicy::new(vec![GateTier {
            min_credentials: 1,
            interval: Duration::from_millis(1),
        }])
        .unwrap();
        let gate = Arc::new(RateGate::new(pool, gate));
        let dispatcher = CallDispatcher::new(backend.clone(), gate, DispatchPolicy::default());
        (dispatcher, backend)
    }

    fn dispatcher(backend: ScriptedBackend, keys: &[&str]) -> (CallDispatcher, Arc<ScriptedBackend>) {
        dispatcher_with(backend, keys, DispatchPolicy::default())
    }

    fn request() -> CallRequest {
        CallRequest::new("be brief", "hello")
    }

    async fn drain(mut stream: TextStream) -> Vec<Result<String, CallError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test(start_paused = true)]
    async fn success_rewards_and_counts_the_call() {
        let (dispatcher, backend) = dispatcher(ScriptedBackend::new(), &KEYS);
        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-0000000");
        assert_eq!(backend.calls(), vec!["key-0000000"]);

        let snap = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(snap.call_count, 1);
        assert_eq!(snap.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_dispatches_rotate_credentials() {
        let (dispatcher, backend) = dispatcher(ScriptedBackend::new(), &KEYS);
        for _ in 0..6 {
            dispatcher.dispatch(&request()).await.unwrap();
        }
        assert_eq!(
            backend.calls(),
            vec![
                "key-0000000",
                "key-1111111",
                "key-2222222",
                "key-0000000",
                "key-1111111",
                "key-2222222"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_rotates_to_next_credential() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![throttled()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-1111111");
        assert_eq!(backend.calls(), vec!["key-0000000", "key-1111111"]);

        let throttled = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(throttled.consecutive_failures, 1);
        assert_eq!(throttled.failure_count, 1);
        assert!(throttled.cooldown_until > Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_quota_marks_credential_exhausted() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![daily_quota()]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        dispatcher.dispatch(&request()).await.unwrap();
        assert!(dispatcher.pool().snapshot(0).unwrap().daily_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_is_marked_dead_without_cooldown() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![invalid_key()]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-1111111");
        let dead = dispatcher.pool().snapshot(0).unwrap();
        assert!(dead.dead);
        assert_eq!(dead.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_leave_cooldown_alone() {
        let backend = ScriptedBackend::new().script(
            KEYS[0],
            vec![Reply::Fail(BackendError::Network("connection reset".into()))],
        );
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        dispatcher.dispatch(&request()).await.unwrap();
        let snap = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.cooldown_until <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_request_is_terminal() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![bad_request()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, CallError::Rejected(_)), "got {err:?}");
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_reports_last_failure() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![server_error()])
            .script(KEYS[1], vec![server_error()])
            .script(KEYS[2], vec![throttled()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        match err {
            CallError::AttemptsExhausted {
                attempts,
                classification,
                last,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(classification, ErrorClassification::RateLimited);
                assert_eq!(last.status(), Some(429));
            }
            other => panic!("expected AttemptsExhausted, got {other:?}"),
        }
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_at_least_two_and_at_most_max_attempts() {
        let (single, _) = dispatcher(ScriptedBackend::new(), &KEYS[..1]);
        assert_eq!(single.attempt_budget(), 2);

        let many: Vec<String> = (0..9).map(|i| format!("key-{i:07}")).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        let (wide, _) = dispatcher(ScriptedBackend::new(), &many);
        assert_eq!(wide.attempt_budget(), 5);

        let policy = DispatchPolicy {
            max_attempts: 7,
            rotations: 3,
            ..DispatchPolicy::default()
        };
        let (rotating, _) = dispatcher_with(ScriptedBackend::new(), &KEYS, policy);
        assert_eq!(rotating.attempt_budget(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn single_credential_retries_after_cooldown() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![throttled()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS[..1]);

        let started = Instant::now();
        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-0000000");
        assert_eq!(backend.calls().len(), 2);
        // 5s cooldown dominates the 4.5s gate spacing.
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_fails_fast_without_network_call() {
        let (dispatcher, backend) = dispatcher(ScriptedBackend::new(), &KEYS);
        dispatcher.pool().penalize(0, Penalty::QuotaExhausted);
        dispatcher.pool().mark_dead(1);
        dispatcher.pool().penalize(2, Penalty::QuotaExhausted);
        assert!(dispatcher.pool().all_exhausted());

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        match err {
            CallError::QuotaExhausted(summary) => {
                assert_eq!(summary.total, 3);
                assert_eq!(summary.dead, 1);
                assert_eq!(summary.daily_exhausted, 2);
            }
            other => panic!("expected QuotaExhausted, got {other:?}"),
        }
        assert!(backend.calls().is_empty());

        let stream_err = dispatcher.dispatch_streaming(&request()).await.err();
        assert!(matches!(stream_err, Some(CallError::QuotaExhausted(_))));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_exhausted_mid_call_stops_retrying() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![daily_quota()])
            .script(KEYS[1], vec![invalid_key()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS[..2]);

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, CallError::AttemptsExhausted { .. }), "got {err:?}");
        assert_eq!(backend.calls().len(), 2);

        let again = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(again, CallError::QuotaExhausted(_)));
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_times_out_and_rotates() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![Reply::Hang]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let started = Instant::now();
        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-1111111");
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert_eq!(dispatcher.pool().snapshot(0).unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn json_mode_runs_extraction() {
        let backend = ScriptedBackend::new().script(
            KEYS[0],
            vec![Reply::Text("Here is the result:\n```json\n{\"a\":1}\n```".into())],
        );
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let text = dispatcher.dispatch(&request().json()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn json_mode_garbage_is_malformed_output() {
        let backend =
            ScriptedBackend::new().script(KEYS[0], vec![Reply::Text("no structure here".into())]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let err = dispatcher.dispatch(&request().json()).await.unwrap_err();
        assert!(matches!(err, CallError::MalformedOutput(_)));
        // The call itself succeeded; the credential is not blamed.
        assert_eq!(dispatcher.pool().snapshot(0).unwrap().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn structured_dispatch_honours_shape_and_default() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![Reply::Text("{\"not\": \"an array\"}".into())])
            .script(KEYS[1], vec![Reply::Text("{\"not\": \"an array\"}".into())]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let strict = dispatcher
            .dispatch_structured(&request().json(), Expectation::new(Shape::Array))
            .await;
        assert!(matches!(strict, Err(CallError::MalformedOutput(_))));

        let lenient = dispatcher
            .dispatch_structured(&request().json(), Expectation::new(Shape::Array).or_default())
            .await
            .unwrap();
        assert_eq!(lenient.value, json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_delivers_chunks_in_order() {
        let backend = ScriptedBackend::new().script(
            KEYS[0],
            vec![Reply::Chunks(vec![Ok("a".into()), Ok("b".into()), Ok("c".into())])],
        );
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let stream = dispatcher.dispatch_streaming(&request()).await.unwrap();
        let chunks: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks, vec!["a", "b", "c"]);
        assert_eq!(dispatcher.pool().snapshot(0).unwrap().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_retries_before_first_chunk() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![throttled()])
            .script(
                KEYS[1],
                vec![Reply::Chunks(vec![Err(BackendError::Network("reset".into()))])],
            );
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        let stream = dispatcher.dispatch_streaming(&request()).await.unwrap();
        let chunks: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks, vec!["ok from key-2222222"]);
        assert_eq!(backend.calls(), vec!["key-0000000", "key-1111111", "key-2222222"]);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_is_surfaced_not_retried() {
        let backend = ScriptedBackend::new().script(
            KEYS[0],
            vec![Reply::Chunks(vec![
                Ok("partial ".into()),
                Err(BackendError::Network("connection reset".into())),
                Ok("never delivered".into()),
            ])],
        );
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        let stream = dispatcher.dispatch_streaming(&request()).await.unwrap();
        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial ");
        assert!(matches!(items[1], Err(CallError::StreamInterrupted(_))));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_hits_idle_timeout() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![Reply::Stall(vec!["first".into()])]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);

        let started = Instant::now();
        let stream = dispatcher.dispatch_streaming(&request()).await.unwrap();
        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(CallError::StreamInterrupted(BackendError::Timeout(_))) => {}
            other => panic!("expected idle timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_follows_streaming_flag() {
        let (dispatcher, _) = dispatcher(ScriptedBackend::new(), &KEYS);

        let complete = dispatcher.execute(&request()).await.unwrap();
        assert!(matches!(complete, CallResult::Complete(ref t) if t == "ok from key-0000000"));

        let streamed = dispatcher.execute(&request().streaming()).await.unwrap();
        let CallResult::Stream(stream) = streamed else {
            panic!("expected stream");
        };
        let chunks: Vec<String> = drain(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks, vec!["ok from key-1111111"]);
    }

    /// Three credentials; #0 is throttled twice and succeeds on its third
    /// selection, two full rotations later.
    #[tokio::test(start_paused = true)]
    async fn throttled_credential_recovers_on_third_selection() {
        let backend = ScriptedBackend::new().script(KEYS[0], vec![throttled(), throttled()]);
        let (dispatcher, backend) = dispatcher(backend, &KEYS);

        // Rotation 1: #0 throttles, the call moves to #1. Then #2 serves alone.
        assert_eq!(dispatcher.dispatch(&request()).await.unwrap(), "ok from key-1111111");
        assert_eq!(dispatcher.dispatch(&request()).await.unwrap(), "ok from key-2222222");

        // Rotation 2: #0 is selected once its 5s cooldown passes and throttles again.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(dispatcher.dispatch(&request()).await.unwrap(), "ok from key-1111111");
        assert_eq!(dispatcher.dispatch(&request()).await.unwrap(), "ok from key-2222222");

        // Rotation 3: after the 10s cooldown, #0 serves the call.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(dispatcher.dispatch(&request()).await.unwrap(), "ok from key-0000000");

        let calls = backend.calls();
        assert_eq!(calls.iter().filter(|k| *k == KEYS[0]).count(), 3);
        let recovered = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(recovered.cooldown_until <= Instant::now());
        assert_eq!(recovered.success_count, 1);
        assert_eq!(recovered.failure_count, 2);
    }

    /// The same recovery inside one logical call: every key throttles, and the
    /// call keeps rotating until #0 comes back on its third selection.
    #[tokio::test(start_paused = true)]
    async fn single_call_recovers_on_first_credential_after_two_rotations() {
        let backend = ScriptedBackend::new()
            .script(KEYS[0], vec![throttled(), throttled()])
            .script(KEYS[1], vec![throttled(), throttled()])
            .script(KEYS[2], vec![throttled(), throttled()]);
        let policy = DispatchPolicy {
            max_attempts: 7,
            rotations: 3,
            ..DispatchPolicy::default()
        };
        let (dispatcher, backend) = dispatcher_with(backend, &KEYS, policy);

        let started = Instant::now();
        let text = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(text, "ok from key-0000000");
        assert_eq!(
            backend.calls(),
            vec![
                KEYS[0], KEYS[1], KEYS[2], KEYS[0], KEYS[1], KEYS[2], KEYS[0]
            ]
        );
        // 5s for the first cooldowns, then 10s for the second.
        assert_eq!(started.elapsed(), Duration::from_secs(15));

        let recovered = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(recovered.cooldown_until <= Instant::now());
        assert_eq!(recovered.call_count, 3);
        assert_eq!(recovered.success_count, 1);
        for index in [1, 2] {
            assert_eq!(dispatcher.pool().snapshot(index).unwrap().consecutive_failures, 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_lose_no_updates() {
        const CALLS: usize = 30;
        let (dispatcher, backend) = fast_dispatcher(ScriptedBackend::new(), &KEYS);
        let dispatcher = Arc::new(dispatcher);

        let tasks = (0..CALLS).map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&request()).await })
        });
        let results = futures_util::future::join_all(tasks).await;
        for result in results {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(backend.calls().len(), CALLS);
        let snapshots: Vec<_> = (0..KEYS.len())
            .map(|i| dispatcher.pool().snapshot(i).unwrap())
            .collect();
        assert_eq!(snapshots.iter().map(|s| s.call_count).sum::<u64>(), CALLS as u64);
        assert_eq!(snapshots.iter().map(|s| s.success_count).sum::<u64>(), CALLS as u64);
        for snap in &snapshots {
            assert_eq!(snap.call_count, (CALLS / KEYS.len()) as u64);
            assert_eq!(snap.success_count, (CALLS / KEYS.len()) as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_waiting_on_the_gate_is_not_counted() {
        let (dispatcher, backend) = dispatcher(ScriptedBackend::new(), &KEYS[..1]);
        dispatcher.dispatch(&request()).await.unwrap();

        // The next call on the only key must wait 4.5s; give up after one.
        let waited = tokio::time::timeout(Duration::from_secs(1), dispatcher.dispatch(&request())).await;
        assert!(waited.is_err());

        assert_eq!(backend.calls().len(), 1);
        let snap = dispatcher.pool().snapshot(0).unwrap();
        assert_eq!(snap.call_count, 1);
        assert_eq!(dispatcher.pool().stats().credentials[0].health_percent, 100.0);

        // The released slot is spaced from the real call, not the abandoned one.
        let started = Instant::now();
        dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(3500));
        assert_eq!(dispatcher.pool().snapshot(0).unwrap().call_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_records_metrics() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let backend = ScriptedBackend::new().script(KEYS[0], vec![throttled()]);
        let (dispatcher, _) = dispatcher(backend, &KEYS);
        dispatcher.dispatch(&request()).await.unwrap();

        let output = handle.render();
        assert!(output.contains("genai_dispatch_attempts_total{classification=\"rate_limited\"} 1"));
        assert!(output.contains("genai_dispatch_attempts_total{classification=\"success\"} 1"));
        assert!(output.contains("genai_dispatch_total{outcome=\"success\"} 1"));
    }
}
