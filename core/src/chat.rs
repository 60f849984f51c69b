use crate::error::{ApiError, TransportError};
use crate::session::SessionState;
use crate::transport::{ApiRequest, ByteStream, HttpTransport};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const CHAT_STREAM_PATH: &str = "/ai/chat/stream";

pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";
pub const KNOWLEDGE_SOURCES_B64_HEADER: &str = "x-knowledge-sources-b64";
pub const KNOWLEDGE_SOURCES_HEADER: &str = "x-knowledge-sources";
pub const PIPELINE_WARNING_HEADER: &str = "x-rag-error";

/// In-band marker the backend writes into the body when generation fails.
pub const ERROR_SENTINEL: &str = "[ERROR]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamOptions {
    pub model: String,
    pub use_knowledge: bool,
    pub top_k: u32,
}

impl StreamOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            use_knowledge: false,
            top_k: 5,
        }
    }

    pub fn with_knowledge(mut self, top_k: u32) -> Self {
        self.use_knowledge = true;
        self.top_k = top_k;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Starting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl StreamPhase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// How a stream ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Serialize)]
struct ChatStreamRequest<'a> {
    model: &'a str,
    message: &'a str,
    conversation_id: Option<i64>,
    use_knowledge: bool,
    topk: u32,
}

/// One piece of decoded body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIncrement {
    pub text: String,
    /// The text carries [`ERROR_SENTINEL`]; nothing follows it.
    pub is_error: bool,
}

pub type IncrementStream = BoxStream<'static, Result<DecodedIncrement, TransportError>>;

/// Turns a response body into text increments, one per non-empty chunk.
///
/// The stream ends after the body ends, after the first transport error,
/// after the first increment carrying the error sentinel, or as soon as
/// `cancel` fires. Cancellation ends it without an error item.
pub fn decode_increments(body: ByteStream, cancel: CancellationToken) -> IncrementStream {
    let state = DecodeState {
        body,
        decoder: Utf8Decoder::default(),
        scanner: SentinelScanner::default(),
        cancel,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                next = state.body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let text = state.decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    let increment = state.scanner.classify(text);
                    state.finished = increment.is_error;
                    return Some((Ok(increment), state));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.decoder.finish();
                    if tail.is_empty() {
                        return None;
                    }
                    let increment = state.scanner.classify(tail);
                    return Some((Ok(increment), state));
                }
            }
        }
    })
    .boxed()
}

struct DecodeState {
    body: ByteStream,
    decoder: Utf8Decoder,
    scanner: SentinelScanner,
    cancel: CancellationToken,
    finished: bool,
}

/// Incremental UTF-8 decoding; sequences split across chunks are held back
/// until complete, invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Finds [`ERROR_SENTINEL`] even when it straddles two increments.
#[derive(Debug, Default)]
struct SentinelScanner {
    carry: String,
}

impl SentinelScanner {
    fn classify(&mut self, text: String) -> DecodedIncrement {
        let mut window = std::mem::take(&mut self.carry);
        window.push_str(&text);
        let is_error = window.contains(ERROR_SENTINEL);

        let keep = ERROR_SENTINEL.len() - 1;
        let start = window
            .char_indices()
            .rev()
            .nth(keep.saturating_sub(1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.carry = window[start..].to_string();

        DecodedIncrement { text, is_error }
    }
}

/// Citation list from the response headers.
///
/// The base64 JSON header wins when it yields entries; otherwise the
/// comma-separated header is used. Undecodable headers count as absent.
pub fn parse_knowledge_sources(headers: &HeaderMap) -> Vec<String> {
    let from_b64 = header_str(headers, KNOWLEDGE_SOURCES_B64_HEADER)
        .map(decode_b64_json_array)
        .unwrap_or_default();
    if !from_b64.is_empty() {
        return from_b64;
    }
    header_str(headers, KNOWLEDGE_SOURCES_HEADER)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn decode_b64_json_array(encoded: &str) -> Vec<String> {
    let Ok(bytes) = STANDARD.decode(encoded.trim()) else {
        tracing::debug!("ignoring knowledge sources header with invalid base64");
        return Vec::new();
    };
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Ok(_) | Err(_) => {
            tracing::debug!("ignoring knowledge sources header that is not a JSON array");
            Vec::new()
        }
    }
}

pub fn parse_conversation_id(headers: &HeaderMap) -> Option<i64> {
    header_str(headers, CONVERSATION_ID_HEADER).and_then(|value| value.trim().parse().ok())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

fn warn_on_foreign_charset(headers: &HeaderMap) {
    let charset = header_str(headers, CONTENT_TYPE.as_str()).and_then(|value| {
        value
            .split(';')
            .map(str::trim)
            .find_map(|param| param.strip_prefix("charset="))
            .map(|charset| charset.trim_matches('"').to_ascii_lowercase())
    });
    if let Some(charset) = charset {
        if !matches!(charset.as_str(), "utf-8" | "utf8" | "us-ascii") {
            tracing::warn!(%charset, "chat stream declared a non UTF-8 charset, decoding as UTF-8");
        }
    }
}

fn stream_status_error(status: StatusCode, body: &[u8]) -> ApiError {
    let text = String::from_utf8_lossy(body).trim().to_string();
    let message = if text.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        text
    };
    if status == StatusCode::UNAUTHORIZED {
        ApiError::AuthExpired { message }
    } else {
        ApiError::Status { status, message }
    }
}

fn failure_text(err: &ApiError) -> String {
    match err {
        ApiError::AuthExpired { message } | ApiError::Status { message, .. } => message.clone(),
        ApiError::StreamProtocol(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Writes the terminal phase of one exchange.
///
/// When `start` is dropped before the exchange settles, the session ends as
/// cancelled instead of staying active.
struct Settlement<'a> {
    state: &'a Mutex<StreamState>,
    settled: bool,
}

impl Settlement<'_> {
    fn settle(&mut self, outcome: &Result<StreamOutcome, ApiError>) {
        self.settled = true;
        let mut state = self.state.lock();
        state.cancel = None;
        match outcome {
            Ok(StreamOutcome::Completed) => {
                state.phase = StreamPhase::Completed;
                tracing::info!(conversation_id = ?state.conversation_id, "chat stream completed");
            }
            Ok(StreamOutcome::Cancelled) => {
                state.phase = StreamPhase::Cancelled;
                tracing::info!("chat stream cancelled");
            }
            Err(err) => {
                state.phase = StreamPhase::Failed;
                state.last_error = Some(failure_text(err));
                tracing::warn!(error = %err, "chat stream failed");
            }
        }
    }
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.state.lock();
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        state.phase = StreamPhase::Cancelled;
        tracing::info!("chat stream dropped before it settled");
    }
}

#[derive(Debug, Default)]
struct StreamState {
    phase: StreamPhase,
    conversation_id: Option<i64>,
    knowledge_sources: Vec<String>,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
    latest_start: u64,
}

/// One chat surface: at most one streamed exchange at a time.
///
/// Clones share the same state, so one clone can cancel what another started.
#[derive(Clone)]
pub struct ChatSession {
    transport: Arc<dyn HttpTransport>,
    session: SessionState,
    state: Arc<Mutex<StreamState>>,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn HttpTransport>, session: SessionState) -> Self {
        Self {
            transport,
            session,
            state: Arc::new(Mutex::new(StreamState::default())),
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    pub fn conversation_id(&self) -> Option<i64> {
        self.state.lock().conversation_id
    }

    pub fn knowledge_sources(&self) -> Vec<String> {
        self.state.lock().knowledge_sources.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// The next message opens a new conversation.
    pub fn new_conversation(&self) {
        self.state.lock().conversation_id = None;
    }

    /// The next message continues `conversation_id`.
    pub fn resume(&self, conversation_id: i64) {
        self.state.lock().conversation_id = Some(conversation_id);
    }

    /// Aborts the exchange in flight. No-op when nothing is in flight.
    pub fn cancel(&self) {
        let state = self.state.lock();
        if !state.phase.is_active() {
            return;
        }
        if let Some(token) = &state.cancel {
            tracing::debug!("cancelling chat stream");
            token.cancel();
        }
    }

    /// Sends `message` and forwards decoded text to `on_increment` as it arrives.
    ///
    /// An exchange already in flight is cancelled and allowed to settle first.
    /// A start that is itself overtaken by a newer start before it runs ends
    /// as [`StreamOutcome::Cancelled`].
    pub async fn start<F>(
        &self,
        message: &str,
        options: &StreamOptions,
        mut on_increment: F,
    ) -> Result<StreamOutcome, ApiError>
    where
        F: FnMut(&str) + Send,
    {
        let ticket = {
            let mut state = self.state.lock();
            state.latest_start += 1;
            if let Some(token) = &state.cancel {
                token.cancel();
            }
            state.latest_start
        };

        let _turn = self.turn.lock().await;

        let token = CancellationToken::new();
        let conversation_id = {
            let mut state = self.state.lock();
            if state.latest_start != ticket {
                return Ok(StreamOutcome::Cancelled);
            }
            state.phase = StreamPhase::Starting;
            state.knowledge_sources.clear();
            state.last_error = None;
            state.cancel = Some(token.clone());
            state.conversation_id
        };

        let mut settlement = Settlement {
            state: &self.state,
            settled: false,
        };
        let outcome = self
            .exchange(message, options, conversation_id, &token, &mut on_increment)
            .await;
        settlement.settle(&outcome);
        outcome
    }

    async fn exchange<F>(
        &self,
        message: &str,
        options: &StreamOptions,
        conversation_id: Option<i64>,
        token: &CancellationToken,
        on_increment: &mut F,
    ) -> Result<StreamOutcome, ApiError>
    where
        F: FnMut(&str) + Send,
    {
        let mut request = ApiRequest::post(CHAT_STREAM_PATH).json(&ChatStreamRequest {
            model: &options.model,
            message,
            conversation_id,
            use_knowledge: options.use_knowledge,
            topk: options.top_k,
        })?;
        // Not renewed here: a replay would resend a message that may already be answering.
        if let Some(access_token) = self.session.access_token() {
            request = request.bearer(access_token);
        }
        tracing::info!(model = %options.model, ?conversation_id, "starting chat stream");

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(StreamOutcome::Cancelled),
            response = self.transport.open_stream(request) => response?,
        };
        if token.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }

        if !response.status.is_success() {
            let status = response.status;
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamOutcome::Cancelled),
                body = response.collect_body() => body.unwrap_or_default(),
            };
            return Err(stream_status_error(status, &body));
        }

        self.absorb_metadata(&response.headers);

        let mut increments = decode_increments(response.body, token.clone());
        while let Some(item) = increments.next().await {
            let increment = item?;
            on_increment(&increment.text);
            if increment.is_error {
                return Err(ApiError::StreamProtocol(increment.text));
            }
        }

        if token.is_cancelled() {
            Ok(StreamOutcome::Cancelled)
        } else {
            Ok(StreamOutcome::Completed)
        }
    }

    fn absorb_metadata(&self, headers: &HeaderMap) {
        warn_on_foreign_charset(headers);
        if let Some(warning) = header_str(headers, PIPELINE_WARNING_HEADER) {
            tracing::warn!(%warning, "knowledge pipeline reported a problem");
        }
        let sources = parse_knowledge_sources(headers);

        let mut state = self.state.lock();
        if let Some(id) = parse_conversation_id(headers) {
            if state.conversation_id != Some(id) {
                tracing::debug!(conversation_id = id, "conversation assigned by server");
                state.conversation_id = Some(id);
            }
        }
        state.knowledge_sources = sources;
        state.phase = StreamPhase::Streaming;
    }
}
