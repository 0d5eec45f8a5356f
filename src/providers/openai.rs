//! OpenAI-compatible Chat Completions.
//!
//! Requests go to `POST {server}/chat/completions` with a bearer key. The
//! prompt, history, tools and prefill are replayed as chat messages.
//! Streaming frames are SSE `data:` chunks whose `choices[0].delta` carries
//! content, reasoning or tool call deltas; `data: [DONE]` ends the stream
//! and a final chunk with `usage` (requested via `stream_options`) supplies
//! the server stats.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use super::{context, ActiveModel, Provider, ProviderKind};
use crate::inference::client::{CancelSlot, InferenceClient, InferenceRequest};
use crate::inference::errors::LmError;
use crate::inference::params::translate_openai;
use crate::inference::streaming::{FrameEvent, FrameGrammar, Framing};
use crate::inference::tool_call_parser::parse_native_json_tool_call;
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};

const KIND: ProviderKind = ProviderKind::OpenAi;

// ─── Frame Grammar ───────────────────────────────────────────────────────────

/// Some servers send `null` where others omit the field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A streaming chunk. Fields absent from a given chunk deserialize empty.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default, deserialize_with = "null_as_default")]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    /// DeepSeek, vLLM and llama.cpp name it `reasoning_content`; others `reasoning`.
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// A non-streaming response.
#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    #[serde(default)]
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
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

struct OpenAiGrammar;

impl FrameGrammar for OpenAiGrammar {
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if let Some(err) = in_band_error(frame) {
            return Err(err);
        }
        let chunk: ChatChunk = serde_json::from_value(frame.clone())
            .map_err(|e| LmError::malformed(format!("unexpected chunk shape: {e}"), &frame.to_string()))?;

        let mut events = Vec::new();
        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = choice.delta.unwrap_or_default();
            if let Some(reasoning) = delta.reasoning_content {
                events.push(FrameEvent::Thinking(reasoning));
            }
            if let Some(content) = delta.content {
                events.push(FrameEvent::Content(content));
            }
            for call in delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                events.push(FrameEvent::ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                events.push(FrameEvent::ToolCallsReady);
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(FrameEvent::ServerStats(usage));
        }
        Ok(events)
    }

    fn decode_complete(&self, body: &Value) -> Result<Vec<FrameEvent>, LmError> {
        if let Some(err) = in_band_error(body) {
            return Err(err);
        }
        let completion: ChatCompletion = serde_json::from_value(body.clone())
            .map_err(|e| LmError::malformed(format!("unexpected completion shape: {e}"), &body.to_string()))?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LmError::malformed("completion has no choices", &body.to_string()))?;

        let mut events = Vec::new();
        if let Some(reasoning) = message.reasoning_content {
            events.push(FrameEvent::Thinking(reasoning));
        }
        events.push(FrameEvent::Content(message.content.unwrap_or_default()));
        for call in message.tool_calls {
            let spec = parse_native_json_tool_call(call.id.as_deref(), &call.function.name, &call.function.arguments)?;
            events.push(FrameEvent::ToolCall(spec));
        }
        if let Some(usage) = completion.usage {
            events.push(FrameEvent::ServerStats(usage));
        }
        events.push(FrameEvent::Done);
        Ok(events)
    }

    fn reported_tokens(&self, server_stats: &Map<String, Value>) -> Option<u64> {
        server_stats.get("completion_tokens").and_then(Value::as_u64)
    }
}

// ─── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<Map<String, Value>>,
}

/// Adapter for an OpenAI-compatible endpoint.
pub struct OpenAiProvider {
    client: InferenceClient,
    model: ActiveModel,
    cancel: CancelSlot,
}

impl OpenAiProvider {
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
}

#[async_trait]
impl Provider for OpenAiProvider {
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
        let list: ModelList = self.client.get_json("/models").await?;
        Ok(list
            .data
            .into_iter()
            .filter_map(|mut entry| {
                let name = match entry.remove("id")? {
                    Value::String(id) => id,
                    _ => return None,
                };
                Some(ModelDescriptor {
                    name,
                    context_length: None,
                    info: None,
                    extra: (!entry.is_empty()).then_some(entry),
                })
            })
            .collect())
    }

    async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError> {
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
        let model = self.model.require(KIND, params)?;
        let cancel = self.cancel.fresh();
        let translation = translate_openai(prompt, params, &context(&model, options))?;
        let request = InferenceRequest {
            path: "/chat/completions",
            translation,
            stream: params.stream,
            grammar: &OpenAiGrammar,
            options,
        };
        self.client.infer(request, &cancel, hooks).await
    }

    async fn abort(&self) {
        self.cancel.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_delta() {
        let events = OpenAiGrammar
            .decode_frame(&json!({"choices": [{"index": 0, "delta": {"content": "Mercury"}, "finish_reason": null}]}))
            .unwrap();
        assert_eq!(events, vec![FrameEvent::Content("Mercury".into())]);
    }

    #[test]
    fn test_reasoning_delta_aliases() {
        for key in ["reasoning_content", "reasoning"] {
            let events = OpenAiGrammar
                .decode_frame(&json!({"choices": [{"delta": {key: "hmm"}}]}))
                .unwrap();
            assert_eq!(events, vec![FrameEvent::Thinking("hmm".into())]);
        }
    }

    #[test]
    fn test_tool_call_delta_and_ready() {
        let events = OpenAiGrammar
            .decode_frame(&json!({"choices": [{
                "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                    "function": {"name": "sum", "arguments": "{\"a\":"}}]},
                "finish_reason": null
            }]}))
            .unwrap();
        assert_eq!(
            events,
            vec![FrameEvent::ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                name: Some("sum".into()),
                arguments: Some("{\"a\":".into()),
            }]
        );

        let events = OpenAiGrammar
            .decode_frame(&json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}))
            .unwrap();
        assert_eq!(events, vec![FrameEvent::ToolCallsReady]);
    }

    #[test]
    fn test_usage_chunk() {
        let events = OpenAiGrammar
            .decode_frame(&json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}}))
            .unwrap();
        match &events[0] {
            FrameEvent::ServerStats(usage) => assert_eq!(OpenAiGrammar.reported_tokens(usage), Some(3)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_complete_with_tool_calls() {
        let events = OpenAiGrammar
            .decode_complete(&json!({
                "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_9", "type": "function", "function": {"name": "get_weather", "arguments": "{\"location\":\"Paris\"}"}}
                ]}, "finish_reason": "tool_calls"}]
            }))
            .unwrap();
        assert_eq!(events[0], FrameEvent::Content(String::new()));
        match &events[1] {
            FrameEvent::ToolCall(call) => {
                assert_eq!(call.id, "call_9");
                assert_eq!(call.arguments["location"], "Paris");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_error_object() {
        let err = OpenAiGrammar
            .decode_frame(&json!({"error": {"message": "rate limited", "type": "requests"}}))
            .unwrap_err();
        assert_eq!(err.to_string(), "backend error: rate limited");
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(matches!(
            OpenAiProvider::new("https://api.openai.com/v1", None, None),
            Err(LmError::MissingCredential { provider: "openai" })
        ));
    }
}
