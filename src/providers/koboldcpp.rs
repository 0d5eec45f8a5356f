//! koboldcpp.
//!
//! Streaming goes to `POST /api/extra/generate/stream` as SSE
//! `event: message` events carrying `{"token": "...", "finish_reason": ...}`.
//! Non-streaming calls use `POST /api/v1/generate`, which answers
//! `{"results": [{"text": "..."}]}`. The server runs exactly one model.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{context, model_basename, ActiveModel, Provider, ProviderKind};
use crate::inference::client::{CancelSlot, InferenceClient, InferenceRequest};
use crate::inference::errors::LmError;
use crate::inference::params::translate_koboldcpp;
use crate::inference::streaming::{FrameEvent, FrameGrammar, Framing};
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};

const KIND: ProviderKind = ProviderKind::KoboldCpp;

// ─── Frame Grammar ───────────────────────────────────────────────────────────

struct KoboldGrammar;

impl FrameGrammar for KoboldGrammar {
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError> {
        let mut events = Vec::new();
        if let Some(token) = frame.get("token").and_then(Value::as_str) {
            events.push(FrameEvent::Content(token.to_string()));
        }
        if frame
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some_and(|r| !r.is_empty())
        {
            events.push(FrameEvent::Done);
        }
        Ok(events)
    }

    fn decode_complete(&self, body: &Value) -> Result<Vec<FrameEvent>, LmError> {
        let text = body
            .pointer("/results/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| LmError::malformed("generate response has no results[0].text", &body.to_string()))?;
        Ok(vec![FrameEvent::Content(text.to_string()), FrameEvent::Done])
    }
}

// ─── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ModelResult {
    result: String,
}

#[derive(Debug, Deserialize)]
struct ContextValue {
    value: u32,
}

/// Adapter for a koboldcpp server.
pub struct KoboldCppProvider {
    client: InferenceClient,
    model: ActiveModel,
    cancel: CancelSlot,
}

impl KoboldCppProvider {
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
impl Provider for KoboldCppProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> ModelDescriptor {
        self.model.get()
    }

    async fn info(&self) -> Result<ModelDescriptor, LmError> {
        let name: ModelResult = self.client.get_json("/api/v1/model").await?;
        let ctx: ContextValue = self
            .client
            .get_json("/api/extra/true_max_context_length")
            .await?;
        Ok(ModelDescriptor::named(name.result).with_context(Some(ctx.value)))
    }

    /// koboldcpp cannot enumerate; the served model is the only entry.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError> {
        Ok(vec![self.info().await?])
    }

    /// Verifies the served model. The server cannot switch models, so a
    /// request for a different one fails instead of being ignored.
    async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError> {
        let served = self.info().await?;
        if !name.is_empty() && name != served.name && name != model_basename(&served.name) {
            return Err(LmError::ModelNotFound {
                name: name.to_string(),
                reason: format!("server is running '{}'", served.name),
            });
        }
        let context_length = options.context_length.or(served.context_length);
        self.model.set(served.with_context(context_length));
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
        let translation = translate_koboldcpp(prompt, params, &context(&model, options))?;
        let request = InferenceRequest {
            path: if params.stream {
                "/api/extra/generate/stream"
            } else {
                "/api/v1/generate"
            },
            translation,
            stream: params.stream,
            grammar: &KoboldGrammar,
            options,
        };
        self.client.infer(request, &cancel, hooks).await
    }

    /// Also asks the server to stop generating, since dropping the
    /// connection alone leaves koboldcpp running to completion.
    async fn abort(&self) {
        if !self.cancel.cancel() {
            return;
        }
        let body = json!({ "genkey": "" });
        match self
            .client
            .send(reqwest::Method::POST, "/api/extra/abort", Some(&body))
            .await
        {
            Ok(resp) => tracing::debug!(status = %resp.status(), "abort sent"),
            Err(e) => tracing::debug!(error = %e, "abort request failed"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_frame() {
        let events = KoboldGrammar
            .decode_frame(&json!({"token": ", Venus", "finish_reason": null}))
            .unwrap();
        assert_eq!(events, vec![FrameEvent::Content(", Venus".into())]);
    }

    #[test]
    fn test_finish_reason_terminates() {
        let events = KoboldGrammar
            .decode_frame(&json!({"token": "", "finish_reason": "stop"}))
            .unwrap();
        assert_eq!(events.last(), Some(&FrameEvent::Done));
    }

    #[test]
    fn test_complete_results() {
        let events = KoboldGrammar
            .decode_complete(&json!({"results": [{"text": "Mercury, Venus, Earth"}]}))
            .unwrap();
        assert_eq!(events[0], FrameEvent::Content("Mercury, Venus, Earth".into()));
    }

    #[test]
    fn test_complete_without_results_is_malformed() {
        assert!(matches!(
            KoboldGrammar.decode_complete(&json!({"detail": "x"})),
            Err(LmError::MalformedResponse { .. })
        ));
    }
}
