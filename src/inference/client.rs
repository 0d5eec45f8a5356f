//! HTTP transport shared by every provider.
//!
//! [`InferenceClient`] wraps one `reqwest` client bound to a server URL and
//! an optional bearer key, maps transport failures onto [`LmError`], and runs
//! the common inference pipeline: send, race the body against cancellation,
//! decode frames, assemble the result and fire the end/error hooks.

use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::LmError;
use super::params::Translation;
use super::stats::StatsEngine;
use super::streaming::{DecodedStream, DecoderState, FrameGrammar, Framing, StreamDecoder};
use super::types::{InferenceHooks, InferenceOptions, InferenceResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout. There is no total timeout: generation can take
/// arbitrarily long and deadlines are the caller's business via `abort`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Holds the cancellation token of the most recent call.
///
/// Each call takes a fresh token, replacing the previous one, so `cancel`
/// only ever reaches the latest call. Outside a call the slot holds an
/// already-cancelled token, so `cancel` before the first call or after the
/// latest one finished reports `false`.
#[derive(Debug)]
pub struct CancelSlot {
    current: Mutex<Slot>,
}

#[derive(Debug)]
struct Slot {
    call: u64,
    token: CancellationToken,
}

fn idle_token() -> CancellationToken {
    let idle = CancellationToken::new();
    idle.cancel();
    idle
}

impl Default for CancelSlot {
    fn default() -> Self {
        Self {
            current: Mutex::new(Slot {
                call: 0,
                token: idle_token(),
            }),
        }
    }
}

impl CancelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a new token for the call about to start. The slot is
    /// released when the returned guard drops.
    pub fn fresh(&self) -> ActiveCall<'_> {
        let token = CancellationToken::new();
        let mut current = self.lock();
        current.call = current.call.wrapping_add(1);
        current.token = token.clone();
        ActiveCall {
            slot: self,
            call: current.call,
            token,
        }
    }

    /// Retire `call`'s token. Does nothing if a later call took the slot.
    pub fn release(&self, call: u64) {
        let mut current = self.lock();
        if current.call == call {
            current.token = idle_token();
        }
    }

    /// Cancel the latest call. Returns `false` when there is no call in
    /// flight or its token was already cancelled.
    pub fn cancel(&self) -> bool {
        let current = self.lock();
        if current.token.is_cancelled() {
            return false;
        }
        current.token.cancel();
        true
    }
}

/// Token of a call in flight. Dropping it releases the [`CancelSlot`].
#[derive(Debug)]
pub struct ActiveCall<'a> {
    slot: &'a CancelSlot,
    call: u64,
    token: CancellationToken,
}

impl ActiveCall<'_> {
    pub fn id(&self) -> u64 {
        self.call
    }
}

impl std::ops::Deref for ActiveCall<'_> {
    type Target = CancellationToken;

    fn deref(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.slot.release(self.call);
    }
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// One inference call, ready to send.
pub struct InferenceRequest<'a> {
    pub path: &'a str,
    pub translation: Translation,
    pub stream: bool,
    pub grammar: &'a dyn FrameGrammar,
    pub options: &'a InferenceOptions,
}

/// HTTP client for one backend server.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: HttpClient,
    provider: &'static str,
    base_url: String,
    api_key: Option<String>,
}

impl InferenceClient {
    pub fn new(
        provider: &'static str,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Self, LmError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LmError::BackendUnavailable {
                endpoint: base_url.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send without looking at the status.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response, LmError> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.send().await.map_err(|e| send_error(&self.url(path), e))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LmError> {
        let response = self.send(Method::GET, path, None).await?;
        read_json(check_status(response).await?).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, LmError> {
        let body = serde_json::to_value(body)?;
        let response = self.send(Method::POST, path, Some(&body)).await?;
        read_json(check_status(response).await?).await
    }

    /// Run one inference call end to end.
    ///
    /// `on_end` fires with the result, `on_error` with the message of any
    /// failure other than a caller abort.
    pub async fn infer(
        &self,
        request: InferenceRequest<'_>,
        cancel: &CancellationToken,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError> {
        let result = self.run(request, cancel, hooks).await;
        match result {
            Ok(ref r) => hooks.ended(r),
            Err(LmError::Cancelled) => tracing::info!(provider = self.provider, "inference cancelled"),
            Err(ref e) => {
                tracing::warn!(provider = self.provider, error = %e, "inference failed");
                hooks.error(&e.to_string());
            }
        }
        result
    }

    async fn run(
        &self,
        request: InferenceRequest<'_>,
        cancel: &CancellationToken,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError> {
        let url = self.url(request.path);
        let grammar = request.grammar;

        for field in &request.translation.dropped {
            tracing::warn!(
                provider = self.provider,
                field = *field,
                "parameter not supported by this backend, dropped"
            );
        }

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            provider = self.provider,
            url = %url,
            stream = request.stream,
            "inference request"
        );
        if request.options.debug {
            tracing::info!(payload = %request.translation.payload, "inference payload");
        }

        let mut stats = StatsEngine::start();
        let mut builder = self.request(Method::POST, request.path).json(&request.translation.payload);
        if request.stream && grammar.framing() == Framing::Sse {
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LmError::Cancelled),
            sent = builder.send() => sent.map_err(|e| send_error(&url, e))?,
        };
        let response = check_status(response).await?;

        let decoded = if request.stream {
            let mut decoder = StreamDecoder::new(grammar);
            let mut body = response.bytes_stream();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LmError::Cancelled),
                    next = body.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => decoder.feed(&chunk, cancel, hooks, &mut stats)?,
                    Some(Err(e)) => {
                        return Err(LmError::BackendUnavailable {
                            endpoint: url,
                            reason: format!("stream read error: {e}"),
                        })
                    }
                    None => break,
                }
                if decoder.state() == DecoderState::Terminated {
                    break;
                }
            }
            decoder.finish(cancel, hooks, &mut stats)?
        } else {
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LmError::Cancelled),
                bytes = response.bytes() => bytes.map_err(|e| send_error(&url, e))?,
            };
            let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
                LmError::malformed(
                    format!("invalid JSON response: {e}"),
                    &String::from_utf8_lossy(&bytes),
                )
            })?;
            StreamDecoder::decode_single(grammar, &body)?
        };

        let result = assemble(grammar, decoded, &stats);
        if request.options.verbose {
            tracing::info!(
                provider = self.provider,
                total_tokens = result.stats.total_tokens,
                tokens_per_second = result.stats.tokens_per_second,
                total_time_ms = result.stats.total_time,
                "inference complete"
            );
        }
        Ok(result)
    }
}

fn assemble(grammar: &dyn FrameGrammar, decoded: DecodedStream, stats: &StatsEngine) -> InferenceResult {
    let tokens = grammar
        .reported_tokens(&decoded.server_stats)
        .unwrap_or(decoded.fragments);
    InferenceResult {
        text: decoded.text,
        thinking: decoded.thinking,
        stats: stats.finish(tokens),
        server_stats: decoded.server_stats,
        tool_calls: decoded.tool_calls,
    }
}

fn send_error(url: &str, e: reqwest::Error) -> LmError {
    let reason = if e.is_connect() {
        format!("connection failed: {e}")
    } else if e.is_timeout() {
        format!("connection timed out: {e}")
    } else {
        e.to_string()
    };
    LmError::BackendUnavailable {
        endpoint: url.to_string(),
        reason,
    }
}

/// Turn a non-2xx response into `HttpError`, keeping the backend's text.
pub async fn check_status(response: Response) -> Result<Response, LmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LmError::HttpError {
        status: status.as_u16(),
        body,
    })
}

pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, LmError> {
    let url = response.url().to_string();
    let bytes = response.bytes().await.map_err(|e| send_error(&url, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        LmError::malformed(format!("invalid JSON response: {e}"), &String::from_utf8_lossy(&bytes))
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cancel_slot_reaches_latest_token_only() {
        let slot = CancelSlot::new();
        let first = slot.fresh();
        let second = slot.fresh();
        slot.cancel();
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_cancel_slot_idempotent() {
        let slot = CancelSlot::new();
        assert!(!slot.cancel());
        let token = slot.fresh();
        assert!(!token.is_cancelled());
        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_slot_released_after_call() {
        let slot = CancelSlot::new();
        let call = slot.fresh();
        let token = CancellationToken::clone(&call);
        drop(call);
        assert!(!slot.cancel());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_slot_stale_release_keeps_latest() {
        let slot = CancelSlot::new();
        let first = slot.fresh();
        let second = slot.fresh();
        slot.release(first.id());
        assert!(slot.cancel());
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = InferenceClient::new("llamacpp", "http://localhost:8080/", None).unwrap();
        assert_eq!(client.url("/completion"), "http://localhost:8080/completion");
    }

    #[tokio::test]
    async fn test_get_json_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = InferenceClient::new("openai", &server.uri(), Some("sk-test".into())).unwrap();
        let body: Value = client.get_json("/models").await.unwrap();
        assert_eq!(body, json!({"data": []}));
    }

    #[tokio::test]
    async fn test_http_error_keeps_backend_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model 'x' not found"))
            .mount(&server)
            .await;

        let client = InferenceClient::new("ollama", &server.uri(), None).unwrap();
        let err = client
            .post_json::<Value>("/api/show", &json!({"name": "x"}))
            .await
            .unwrap_err();
        match err {
            LmError::HttpError { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "model 'x' not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = InferenceClient::new("llamacpp", "http://127.0.0.1:9", None).unwrap();
        let err = client.get_json::<Value>("/props").await.unwrap_err();
        assert!(matches!(err, LmError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("unreachable"));
    }
}
