//! Goinfer.
//!
//! Completions go to `POST /completion` with a mandatory bearer key.
//! Streaming frames are SSE `data:` events shaped
//! `{"num": n, "msg_type": "token" | "system" | "error", "content": ..., "data": ...}`.
//! A `system` message with content `result` ends the stream and carries the
//! server's own stats.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{context, ActiveModel, Provider, ProviderKind};
use crate::inference::client::{check_status, CancelSlot, InferenceClient, InferenceRequest};
use crate::inference::errors::LmError;
use crate::inference::params::translate_goinfer;
use crate::inference::streaming::{FrameEvent, FrameGrammar, Framing};
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};

const KIND: ProviderKind = ProviderKind::Goinfer;

/// Context window requested when neither the caller nor the server says.
const DEFAULT_CONTEXT: u32 = 2048;

// ─── Frame Grammar ───────────────────────────────────────────────────────────

struct GoinferGrammar;

fn stats_of(result: &Value) -> Map<String, Value> {
    result
        .get("stats")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

impl FrameGrammar for GoinferGrammar {
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError> {
        let content = frame.get("content").and_then(Value::as_str).unwrap_or_default();
        match frame.get("msg_type").and_then(Value::as_str) {
            Some("token") => Ok(vec![FrameEvent::Content(content.to_string())]),
            Some("system") if content == "result" => {
                let data = frame.get("data").cloned().unwrap_or(Value::Null);
                Ok(vec![FrameEvent::ServerStats(stats_of(&data)), FrameEvent::Done])
            }
            Some("error") => Err(LmError::BackendError {
                message: content.to_string(),
            }),
            _ => Ok(Vec::new()),
        }
    }

    fn decode_complete(&self, body: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if body.get("msg_type").and_then(Value::as_str) == Some("error") {
            return self.decode_frame(body);
        }
        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| LmError::malformed("completion response has no text", &body.to_string()))?;
        Ok(vec![
            FrameEvent::Content(text.to_string()),
            FrameEvent::ServerStats(stats_of(body)),
            FrameEvent::Done,
        ])
    }

    fn reported_tokens(&self, server_stats: &Map<String, Value>) -> Option<u64> {
        server_stats.get("totalTokens").and_then(Value::as_u64)
    }
}

// ─── API Shapes ──────────────────────────────────────────────────────────────

/// `GET /model/state`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelState {
    #[serde(default)]
    models: HashMap<String, ModelTemplate>,
    #[serde(default)]
    is_model_loaded: bool,
    #[serde(default)]
    loaded_model: String,
    #[serde(default)]
    ctx: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelTemplate {
    #[serde(default)]
    name: String,
    #[serde(default)]
    ctx: Option<u32>,
}

// ─── Provider ────────────────────────────────────────────────────────────────

/// Adapter for a Goinfer server.
pub struct GoinferProvider {
    client: InferenceClient,
    model: ActiveModel,
    cancel: CancelSlot,
}

impl GoinferProvider {
    pub fn new(server_url: &str, api_key: Option<String>, model: Option<ModelDescriptor>) -> Result<Self, LmError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or(LmError::MissingCredential {
                provider: KIND.as_str(),
            })?;
        Ok(Self {
            client: InferenceClient::new(KIND.as_str(), server_url, Some(api_key))?,
            model: ActiveModel::new(model),
            cancel: CancelSlot::new(),
        })
    }

    async fn state(&self) -> Result<ModelState, LmError> {
        self.client.get_json("/model/state").await
    }
}

#[async_trait]
impl Provider for GoinferProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> ModelDescriptor {
        self.model.get()
    }

    async fn info(&self) -> Result<ModelDescriptor, LmError> {
        let state = self.state().await?;
        if !state.is_model_loaded || state.loaded_model.is_empty() {
            return Err(LmError::NoModelSelected {
                provider: KIND.as_str(),
            });
        }
        Ok(ModelDescriptor::named(state.loaded_model).with_context(state.ctx))
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError> {
        let state = self.state().await?;
        let mut models: Vec<ModelDescriptor> = state
            .models
            .into_iter()
            .map(|(name, template)| {
                let mut extra = Map::new();
                if !template.name.is_empty() {
                    extra.insert("template".into(), Value::String(template.name));
                }
                ModelDescriptor {
                    name,
                    context_length: template.ctx,
                    info: None,
                    extra: (!extra.is_empty()).then_some(extra),
                }
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError> {
        let context_length = match options.context_length {
            Some(ctx) => ctx,
            None => self
                .list_models()
                .await?
                .into_iter()
                .find(|m| m.name == name)
                .and_then(|m| m.context_length)
                .unwrap_or(DEFAULT_CONTEXT),
        };

        let body = json!({ "name": name, "ctx": context_length });
        let response = self.client.send(Method::POST, "/model/load", Some(&body)).await?;
        match response.status() {
            StatusCode::ACCEPTED => tracing::warn!(model = %name, "model was already loaded"),
            StatusCode::NOT_FOUND => {
                return Err(LmError::ModelNotFound {
                    name: name.to_string(),
                    reason: response.text().await.unwrap_or_default(),
                })
            }
            _ => {
                check_status(response).await?;
            }
        }

        self.model
            .set(ModelDescriptor::named(name).with_context(Some(context_length)));
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
        let translation = translate_goinfer(prompt, params, &context(&model, options))?;
        let request = InferenceRequest {
            path: "/completion",
            translation,
            stream: params.stream,
            grammar: &GoinferGrammar,
            options,
        };
        self.client.infer(request, &cancel, hooks).await
    }

    async fn abort(&self) {
        self.cancel.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
