//! Ollama.
//!
//! Completions go to `POST /api/generate`. Streaming bodies are NDJSON, one
//! object per line with the fragment in `response` (and reasoning in
//! `thinking`); the last line has `done: true` plus the eval counters.
//! Models are listed from `/api/tags`, inspected with `/api/show` and, when
//! missing, retrieved with `/api/pull`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{context, ActiveModel, Provider, ProviderKind};
use crate::inference::client::{check_status, read_json, CancelSlot, InferenceClient, InferenceRequest};
use crate::inference::errors::LmError;
use crate::inference::params::translate_ollama;
use crate::inference::streaming::{FrameEvent, FrameGrammar, Framing, JsonBuffer};
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions, LoadProgress,
    ModelDescriptor, ModelInfo,
};

const KIND: ProviderKind = ProviderKind::Ollama;

/// Context window assumed when the Modelfile does not set `num_ctx`.
const DEFAULT_CONTEXT: u32 = 2048;

/// Minimum spacing between two pull progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// ─── Frame Grammar ───────────────────────────────────────────────────────────

struct OllamaGrammar;

fn in_band_error(frame: &Value) -> Option<LmError> {
    let message = frame.get("error")?;
    Some(LmError::BackendError {
        message: message.as_str().map(String::from).unwrap_or_else(|| message.to_string()),
    })
}

fn server_stats(frame: &Map<String, Value>) -> Map<String, Value> {
    let mut stats = frame.clone();
    for key in ["response", "context", "thinking"] {
        stats.remove(key);
    }
    stats
}

impl FrameGrammar for OllamaGrammar {
    fn framing(&self) -> Framing {
        Framing::Ndjson
    }

    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if let Some(err) = in_band_error(frame) {
            return Err(err);
        }
        let Some(obj) = frame.as_object() else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        if let Some(thinking) = obj.get("thinking").and_then(Value::as_str) {
            events.push(FrameEvent::Thinking(thinking.to_string()));
        }
        if let Some(response) = obj.get("response").and_then(Value::as_str) {
            events.push(FrameEvent::Content(response.to_string()));
        }
        if obj.get("done").and_then(Value::as_bool) == Some(true) {
            events.push(FrameEvent::ServerStats(server_stats(obj)));
            events.push(FrameEvent::Done);
        }
        Ok(events)
    }

    fn decode_complete(&self, body: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if let Some(err) = in_band_error(body) {
            return Err(err);
        }
        let obj = body
            .as_object()
            .ok_or_else(|| LmError::malformed("generate response is not an object", &body.to_string()))?;
        let response = obj
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| LmError::malformed("generate response has no response field", &body.to_string()))?;

        let mut events = Vec::new();
        if let Some(thinking) = obj.get("thinking").and_then(Value::as_str) {
            events.push(FrameEvent::Thinking(thinking.to_string()));
        }
        events.push(FrameEvent::Content(response.to_string()));
        events.push(FrameEvent::ServerStats(server_stats(obj)));
        events.push(FrameEvent::Done);
        Ok(events)
    }

    fn reported_tokens(&self, server_stats: &Map<String, Value>) -> Option<u64> {
        server_stats.get("eval_count").and_then(Value::as_u64)
    }
}

// ─── API Shapes ──────────────────────────────────────────────────────────────

/// Raw Ollama `/api/tags` response shape.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    details: Option<TagModelDetails>,
}

#[derive(Debug, Deserialize)]
struct TagModelDetails {
    parameter_size: Option<String>,
    quantization_level: Option<String>,
}

/// Raw progress line from `/api/pull`.
#[derive(Debug, Deserialize)]
struct PullLine {
    status: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

/// `num_ctx` from the Modelfile parameters block of `/api/show`.
fn parse_num_ctx(show: &Value) -> Option<u32> {
    show.get("parameters")?
        .as_str()?
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("num_ctx"), Some(value)) => value.parse().ok(),
                _ => None,
            }
        })
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Adapter for an Ollama server.
pub struct OllamaProvider {
    client: InferenceClient,
    model: ActiveModel,
    cancel: CancelSlot,
}

impl OllamaProvider {
    pub fn new(
        server_url: &str,
        api_key: Option<String>,
        model: Option<ModelDescriptor>,
    ) -> Result<Self, LmError> {
        Ok(Self {
            client: InferenceClient::new(KIND.as_str(), server_url, api_key)?,
            model: ActiveModel::new(model),
            cancel: CancelSlot::new(),
        })
    }

    /// `Ok(None)` when the server does not have the model.
    async fn show(&self, name: &str) -> Result<Option<Value>, LmError> {
        let body = json!({ "model": name, "name": name });
        let response = self.client.send(Method::POST, "/api/show", Some(&body)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(check_status(response).await?).await.map(Some)
    }

    /// Stream `/api/pull`, reporting progress at most every
    /// [`PROGRESS_INTERVAL`] and once more when the pull ends.
    async fn pull(&self, source: &str, options: &mut LoadOptions<'_>) -> Result<(), LmError> {
        tracing::info!(model = %source, "pulling model");
        let body = json!({ "model": source, "name": source, "stream": true });
        let response = self.client.send(Method::POST, "/api/pull", Some(&body)).await?;
        let response = check_status(response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = JsonBuffer::default();
        let mut last_emit: Option<Instant> = None;
        let mut latest: Option<LoadProgress> = None;
        let mut latest_sent = true;

        loop {
            while let Some(value) = buffer.next_value()? {
                let line: PullLine = serde_json::from_value(value)?;
                if let Some(error) = line.error {
                    return Err(LmError::BackendError { message: error });
                }
                let total = line.total.unwrap_or(0);
                let completed = line.completed.unwrap_or(0);
                let percent = if total > 0 {
                    (completed as f64 / total as f64) * 100.0
                } else {
                    0.0
                };
                let progress = LoadProgress {
                    status: line.status.unwrap_or_default(),
                    total,
                    completed,
                    percent: (percent * 10.0).round() / 10.0,
                };

                if last_emit.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL) {
                    options.report(&progress);
                    last_emit = Some(Instant::now());
                    latest_sent = true;
                } else {
                    latest_sent = false;
                }
                latest = Some(progress);
            }

            match stream.next().await {
                Some(Ok(chunk)) => buffer.push(&chunk),
                Some(Err(e)) => {
                    return Err(LmError::BackendUnavailable {
                        endpoint: self.client.url("/api/pull"),
                        reason: format!("stream read error: {e}"),
                    })
                }
                None => break,
            }
        }

        if buffer.has_partial() {
            return Err(LmError::malformed("pull stream ended inside a JSON value", &buffer.excerpt()));
        }
        if let (false, Some(ref progress)) = (latest_sent, latest) {
            options.report(progress);
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> ModelDescriptor {
        self.model.get()
    }

    async fn info(&self) -> Result<ModelDescriptor, LmError> {
        Err(LmError::NotImplemented {
            provider: KIND.as_str(),
            operation: "info",
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError> {
        let tags: TagsResponse = self.client.get_json("/api/tags").await?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelDescriptor {
                name: m.name,
                context_length: None,
                info: m.details.map(|d| ModelInfo {
                    param_size: d.parameter_size.unwrap_or_default(),
                    quantization: d.quantization_level.unwrap_or_default(),
                }),
                extra: None,
            })
            .collect())
    }

    /// Inspects the model with `/api/show`. A missing model is pulled when
    /// the caller asked for progress or gave a source, otherwise it fails
    /// with `ModelNotFound`.
    async fn load_model(&self, name: &str, mut options: LoadOptions<'_>) -> Result<(), LmError> {
        let show = match self.show(name).await? {
            Some(show) => show,
            None if options.on_progress.is_some() || !options.urls.is_empty() => {
                let source = options.urls.first().cloned().unwrap_or_else(|| name.to_string());
                self.pull(&source, &mut options).await?;
                self.show(name).await?.ok_or_else(|| LmError::ModelNotFound {
                    name: name.to_string(),
                    reason: "not present after pull".into(),
                })?
            }
            None => {
                return Err(LmError::ModelNotFound {
                    name: name.to_string(),
                    reason: "not installed on the server".into(),
                })
            }
        };

        let context_length = options.context_length.or_else(|| parse_num_ctx(&show)).unwrap_or_else(|| {
            tracing::info!(default = DEFAULT_CONTEXT, "num_ctx not set in Modelfile, using default");
            DEFAULT_CONTEXT
        });
        let info = show.get("details").map(|d| ModelInfo {
            param_size: d["parameter_size"].as_str().unwrap_or_default().to_string(),
            quantization: d["quantization_level"].as_str().unwrap_or_default().to_string(),
        });

        self.model.set(ModelDescriptor {
            name: name.to_string(),
            context_length: Some(context_length),
            info,
            extra: None,
        });
        Ok(())
    }

    async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        options: &InferenceOptions,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError> {
        let model = self.model.require(KIND, params)?;
        let cancel = self.cancel.fresh();
        let translation = translate_ollama(prompt, params, &context(&model, options))?;
        let request = InferenceRequest {
            path: "/api/generate",
            translation,
            stream: params.stream,
            grammar: &OllamaGrammar,
            options,
        };
        self.client.infer(request, &cancel, hooks).await
    }

    async fn abort(&self) {
        self.cancel.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
