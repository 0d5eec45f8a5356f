#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use locallm::{InferenceHooks, Lm, LmParams, ProviderKind};
use serde_json::Value;
use wiremock::{MockServer, ResponseTemplate};

pub const PLANETS: [&str; 3] = ["Mercury", ", Venus", ", Earth"];

/// Body of `data:` events, one per frame.
pub fn sse(frames: &[Value]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

/// One JSON value per line.
pub fn ndjson(frames: &[Value]) -> String {
    frames.iter().map(|f| format!("{f}\n")).collect()
}

pub fn sse_response(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into(), "text/event-stream")
}

pub fn ndjson_response(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into(), "application/x-ndjson")
}

pub fn lm(kind: ProviderKind, server: &MockServer) -> Lm {
    let mut params = LmParams::new(kind, server.uri());
    if kind.requires_api_key() {
        params = params.with_api_key("sk-test");
    }
    if matches!(kind, ProviderKind::Ollama | ProviderKind::OpenAi) {
        params = params.with_model("test-model");
    }
    Lm::new(params).unwrap()
}

/// Shared record of everything the hooks saw.
#[derive(Debug, Default)]
pub struct Recorded {
    pub tokens: Vec<String>,
    pub starts: usize,
    pub ends: usize,
    pub errors: Vec<String>,
}

pub fn recording_hooks() -> (InferenceHooks<'static>, Arc<Mutex<Recorded>>) {
    let record = Arc::new(Mutex::new(Recorded::default()));
    let (tokens, starts, ends, errors) = (record.clone(), record.clone(), record.clone(), record.clone());
    let hooks = InferenceHooks::new()
        .on_token(move |t| tokens.lock().unwrap().tokens.push(t.to_string()))
        .on_start(move |_| starts.lock().unwrap().starts += 1)
        .on_end(move |_| ends.lock().unwrap().ends += 1)
        .on_error(move |e| errors.lock().unwrap().errors.push(e.to_string()));
    (hooks, record)
}
