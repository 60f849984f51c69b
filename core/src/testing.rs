//! In-process scripted backend.
//!
//! Answers each path from a queue of canned replies and records every request
//! it sees. The last reply queued for a path keeps answering once the queue
//! is down to it.

use crate::error::TransportError;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, StreamingResponse};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ScriptedChunk {
    pub delay: Duration,
    pub bytes: Vec<u8>,
}

impl ScriptedChunk {
    pub fn now(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            delay: Duration::ZERO,
            bytes: bytes.into(),
        }
    }

    pub fn after(delay: Duration, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            delay,
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        chunks: Vec<ScriptedChunk>,
    },
    Fail(TransportError),
}

impl ScriptedReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self::Respond {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            chunks: vec![ScriptedChunk::now(body.to_string())],
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            chunks: vec![ScriptedChunk::now(body)],
        }
    }

    /// A `text/plain` body delivered as the given chunks.
    pub fn stream(status: u16, chunks: Vec<ScriptedChunk>) -> Self {
        Self::Respond {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            chunks,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Self::Respond { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    latency: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reply` for the next request to `path`.
    pub fn reply(&self, path: &str, reply: ScriptedReply) -> &Self {
        self.routes
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Holds every answer on `path` back by `delay`.
    pub fn latency(&self, path: &str, delay: Duration) -> &Self {
        self.latency.lock().insert(path.to_string(), delay);
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    async fn next_reply(&self, request: ApiRequest) -> Result<ScriptedReply, TransportError> {
        let path = request.path.clone();
        self.requests.lock().push(request);
        let delay = self.latency.lock().get(&path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut routes = self.routes.lock();
        let queue = routes
            .get_mut(&path)
            .ok_or_else(|| TransportError::Connect(format!("no scripted reply for {path}")))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.ok_or_else(|| TransportError::Connect(format!("no scripted reply for {path}")))
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        match self.next_reply(request).await? {
            ScriptedReply::Respond {
                status,
                headers,
                chunks,
            } => {
                let mut body = Vec::new();
                for chunk in chunks {
                    if !chunk.delay.is_zero() {
                        tokio::time::sleep(chunk.delay).await;
                    }
                    body.extend_from_slice(&chunk.bytes);
                }
                Ok(ApiResponse {
                    status: status_code(status)?,
                    headers: header_map(&headers),
                    body,
                })
            }
            ScriptedReply::Fail(err) => Err(err),
        }
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<StreamingResponse, TransportError> {
        match self.next_reply(request).await? {
            ScriptedReply::Respond {
                status,
                headers,
                chunks,
            } => {
                let body = stream::iter(chunks)
                    .then(|chunk| async move {
                        if !chunk.delay.is_zero() {
                            tokio::time::sleep(chunk.delay).await;
                        }
                        Ok(chunk.bytes)
                    })
                    .boxed();
                Ok(StreamingResponse {
                    status: status_code(status)?,
                    headers: header_map(&headers),
                    body,
                })
            }
            ScriptedReply::Fail(err) => Err(err),
        }
    }
}

fn status_code(status: u16) -> Result<StatusCode, TransportError> {
    StatusCode::from_u16(status)
        .map_err(|_| TransportError::InvalidRequest(format!("invalid scripted status {status}")))
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid scripted header"),
        }
    }
    map
}
