//! In-memory backend with per-key scripted replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use common::Secret;
use futures_util::StreamExt;
use provider::{Backend, BackendError, BoxFuture, CallRequest, ChunkStream};

/// One scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    Fail(BackendError),
    /// Stream items, delivered in order.
    Chunks(Vec<Result<String, BackendError>>),
    /// Stream that yields these chunks and then stalls forever.
    Stall(Vec<String>),
    /// Never answers.
    Hang,
}

pub(crate) fn throttled() -> Reply {
    Reply::Fail(BackendError::Status {
        status: 429,
        body: r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#.into(),
    })
}

pub(crate) fn daily_quota() -> Reply {
    Reply::Fail(BackendError::Status {
        status: 429,
        body: r#"{"error":{"code":429,"message":"Quota exceeded for quota metric 'Generate requests per day'"}}"#.into(),
    })
}

pub(crate) fn invalid_key() -> Reply {
    Reply::Fail(BackendError::Status {
        status: 400,
        body: r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key."}}"#.into(),
    })
}

pub(crate) fn bad_request() -> Reply {
    Reply::Fail(BackendError::Status {
        status: 400,
        body: r#"{"error":{"code":400,"message":"Invalid value at 'generation_config.temperature'"}}"#.into(),
    })
}

pub(crate) fn server_error() -> Reply {
    Reply::Fail(BackendError::Status {
        status: 503,
        body: "The model is overloaded. Please try again later.".into(),
    })
}

/// Backend whose answers are scripted per API key.
///
/// A key with no script left answers `Text("ok from <key>")`.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(self, key: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), replies.into());
        self
    }

    /// Keys in the order they were called with.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self, key: &Secret<String>) -> Reply {
        let key = key.expose().clone();
        self.calls.lock().unwrap().push(key.clone());
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Text(format!("ok from {key}")))
    }
}

impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn generate<'a>(
        &'a self,
        key: &'a Secret<String>,
        _request: &'a CallRequest,
    ) -> BoxFuture<'a, provider::Result<String>> {
        let reply = self.next_reply(key);
        Box::pin(async move {
            match reply {
                Reply::Text(text) => Ok(text),
                Reply::Fail(error) => Err(error),
                Reply::Chunks(items) => items.into_iter().collect::<Result<Vec<_>, _>>().map(|v| v.concat()),
                Reply::Stall(_) | Reply::Hang => std::future::pending().await,
            }
        })
    }

    fn generate_stream<'a>(
        &'a self,
        key: &'a Secret<String>,
        _request: &'a CallRequest,
    ) -> BoxFuture<'a, provider::Result<ChunkStream>> {
        let reply = self.next_reply(key);
        Box::pin(async move {
            let stream: ChunkStream = match reply {
                Reply::Text(text) => Box::pin(futures_util::stream::iter(vec![Ok(text)])),
                Reply::Fail(error) => return Err(error),
                Reply::Chunks(items) => Box::pin(futures_util::stream::iter(items)),
                Reply::Stall(chunks) => Box::pin(
                    futures_util::stream::iter(chunks.into_iter().map(Ok))
                        .chain(futures_util::stream::pending()),
                ),
                Reply::Hang => std::future::pending().await,
            };
            Ok(stream)
        })
    }
}
