//! llama.cpp server (`llama-server`).
//!
//! Completions go to `POST /completion`. Streaming frames are SSE `data:`
//! events of the form `{"content": "...", "stop": false}`; the last one has
//! `stop: true` and carries the timings, which become the server stats.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{context, model_basename, ActiveModel, Provider, ProviderKind};
use crate::inference::client::{CancelSlot, InferenceClient, InferenceRequest};
use crate::inference::errors::LmError;
use crate::inference::params::translate_llamacpp;
use crate::inference::streaming::{FrameEvent, FrameGrammar, Framing};
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};

const KIND: ProviderKind = ProviderKind::LlamaCpp;

// ─── Frame Grammar ───────────────────────────────────────────────────────────

struct LlamaCppGrammar;

fn stats_without_content(frame: &Map<String, Value>) -> Map<String, Value> {
    let mut stats = frame.clone();
    stats.remove("content");
    stats
}

fn in_band_error(frame: &Value) -> Option<LmError> {
    let error = frame.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| error.to_string());
    Some(LmError::BackendError { message })
}

impl FrameGrammar for LlamaCppGrammar {
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if let Some(err) = in_band_error(frame) {
            return Err(err);
        }
        let Some(obj) = frame.as_object() else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        if let Some(content) = obj.get("content").and_then(Value::as_str) {
            events.push(FrameEvent::Content(content.to_string()));
        }
        if obj.get("stop").and_then(Value::as_bool) == Some(true) {
            events.push(FrameEvent::ServerStats(stats_without_content(obj)));
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
            .ok_or_else(|| LmError::malformed("completion response is not an object", &body.to_string()))?;
        let content = obj
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| LmError::malformed("completion response has no content", &body.to_string()))?;
        Ok(vec![
            FrameEvent::Content(content.to_string()),
            FrameEvent::ServerStats(stats_without_content(obj)),
            FrameEvent::Done,
        ])
    }

    fn reported_tokens(&self, server_stats: &Map<String, Value>) -> Option<u64> {
        server_stats
            .get("tokens_predicted")
            .and_then(Value::as_u64)
            .or_else(|| server_stats.get("timings")?.get("predicted_n")?.as_u64())
    }
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Adapter for a llama.cpp server.
///
/// The server normally runs one model. `load_model` records the name, which
/// is sent as `model` so router setups can dispatch on it.
pub struct LlamaCppProvider {
    client: InferenceClient,
    model: ActiveModel,
    cancel: CancelSlot,
}

impl LlamaCppProvider {
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
}

#[async_trait]
impl Provider for LlamaCppProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> ModelDescriptor {
        self.model.get()
    }

    async fn info(&self) -> Result<ModelDescriptor, LmError> {
        let props: Value = self.client.get_json("/props").await?;
        let settings = props
            .get("default_generation_settings")
            .or_else(|| props.get("generation_settings"));
        let context_length = settings
            .and_then(|s| s.get("n_ctx"))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        let name = props
            .get("model_path")
            .or_else(|| settings.and_then(|s| s.get("model")))
            .and_then(Value::as_str)
            .map(model_basename)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| LmError::malformed("/props names no model", &props.to_string()))?;

        Ok(ModelDescriptor::named(name).with_context(context_length))
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError> {
        let listing: Value = match self.client.get_json("/v1/models").await {
            Ok(listing) => listing,
            Err(LmError::HttpError { status: 404, .. }) => {
                tracing::debug!("no /v1/models endpoint, listing the served model");
                return Ok(vec![self.info().await?]);
            }
            Err(e) => return Err(e),
        };

        let entries = listing
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| LmError::malformed("model listing has no data array", &listing.to_string()))?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let mut extra = entry.as_object()?.clone();
                let name = match extra.remove("id")? {
                    Value::String(id) => id,
                    _ => return None,
                };
                let context_length = entry
                    .pointer("/meta/n_ctx_train")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok());
                Some(ModelDescriptor {
                    name,
                    context_length,
                    info: None,
                    extra: (!extra.is_empty()).then_some(extra),
                })
            })
            .collect())
    }

    async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError> {
        if name.is_empty() {
            let served = self.info().await?;
            let context_length = options.context_length.or(served.context_length);
            self.model.set(served.with_context(context_length));
            return Ok(());
        }
        self.model
            .set(ModelDescriptor::named(name).with_context(options.context_length));
        Ok(())
    }

    async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        options: &InferenceOptions,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError> {
        let cancel = self.cancel.fresh();
        let model = self.model.get();
        let translation = translate_llamacpp(prompt, params, &context(&model, options))?;
        let request = InferenceRequest {
            path: "/completion",
            translation,
            stream: params.stream,
            grammar: &LlamaCppGrammar,
            options,
        };
        self.client.infer(request, &cancel, hooks).await
    }

    async fn abort(&self) {
        self.cancel.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
