//! Parameter translation table.
//!
//! One pure function per dialect turns the prompt, the neutral
//! [`GenerationParameters`] and the per-call [`TranslationContext`] into the
//! backend's request body. Each neutral field either lands in exactly one
//! backend field or is reported in [`Translation::dropped`]. The caller's
//! `extra` map is merged into the top level last and may override anything.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::errors::LmError;
use super::types::{
    ChatMessage, ContentPart, GenerationParameters, HistoryTurn, ImageUrl, InferenceOptions,
    MessageContent, Role, ToolCallResponse, ToolDefinition,
};

/// Adapter state a translation may read.
#[derive(Debug, Clone, Copy)]
pub struct TranslationContext<'a> {
    /// Name of the active model, if one was selected.
    pub model: Option<&'a str>,
    /// Context window of the active model.
    pub context_length: Option<u32>,
    pub options: &'a InferenceOptions,
}

/// A backend request body plus the neutral fields it could not carry.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub payload: Value,
    pub dropped: Vec<&'static str>,
}

impl Translation {
    fn build(
        request: impl Serialize,
        extra: &Map<String, Value>,
        dropped: Vec<&'static str>,
    ) -> Result<Self, LmError> {
        let mut payload = serde_json::to_value(request)?;
        merge_extension(&mut payload, extra);
        Ok(Translation { payload, dropped })
    }
}

/// Shallow-merge `extra` into the top level of `payload`.
pub fn merge_extension(payload: &mut Value, extra: &Map<String, Value>) {
    if let Value::Object(map) = payload {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// Records neutral fields a dialect has no slot for.
#[derive(Default)]
struct Dropped(Vec<&'static str>);

impl Dropped {
    fn check(&mut self, present: bool, name: &'static str) {
        if present {
            self.0.push(name);
        }
    }

    /// Options only the chat dialect can express.
    fn conversation(&mut self, options: &InferenceOptions, keeps_system: bool) {
        self.check(!keeps_system && options.system.is_some(), "system");
        self.check(!options.history.is_empty(), "history");
        self.check(!options.tools.is_empty(), "tools");
        self.check(options.assistant.is_some(), "assistant");
    }
}

fn is_empty_slice(s: &&[String]) -> bool {
    s.is_empty()
}

fn strip_data_url(image: &str) -> &str {
    match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    }
}

fn as_data_url(image: &str) -> String {
    if image.starts_with("data:") || image.starts_with("http://") || image.starts_with("https://") {
        image.to_string()
    } else {
        format!("data:image/jpeg;base64,{image}")
    }
}

// ─── llama.cpp ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LlamaCppRequest<'a> {
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tfs_z: Option<f32>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<&'a Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    image_data: Vec<LlamaCppImage<'a>>,
}

#[derive(Debug, Serialize)]
struct LlamaCppImage<'a> {
    data: &'a str,
    id: usize,
}

pub fn translate_llamacpp(
    prompt: &str,
    params: &GenerationParameters,
    ctx: &TranslationContext<'_>,
) -> Result<Translation, LmError> {
    let mut dropped = Dropped::default();
    dropped.conversation(ctx.options, false);

    let request = LlamaCppRequest {
        prompt,
        stream: params.stream,
        model: params.model.as_deref().or(ctx.model).filter(|m| !m.is_empty()),
        n_predict: params.max_tokens,
        temperature: params.temperature,
        top_k: params.top_k,
        top_p: params.top_p,
        min_p: params.min_p,
        repeat_penalty: params.repeat_penalty,
        tfs_z: params.tfs,
        stop: &params.stop,
        grammar: params.grammar.as_deref(),
        json_schema: params.schema.as_ref(),
        image_data: params
            .images
            .iter()
            .enumerate()
            .map(|(id, img)| LlamaCppImage {
                data: strip_data_url(img),
                id,
            })
            .collect(),
    };
    Translation::build(request, &params.extra, dropped.0)
}

// ─── koboldcpp ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct KoboldRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rep_pen: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tfs: Option<f32>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    stop_sequence: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

/// koboldcpp serves one fixed model, so `model` is never sent. Streaming is
/// selected by endpoint, not by a body field.
pub fn translate_koboldcpp(
    prompt: &str,
    params: &GenerationParameters,
    ctx: &TranslationContext<'_>,
) -> Result<Translation, LmError> {
    let mut dropped = Dropped::default();
    dropped.conversation(ctx.options, false);
    dropped.check(params.model.is_some(), "model");
    dropped.check(params.schema.is_some(), "schema");

    let request = KoboldRequest {
        prompt,
        max_context_length: ctx.context_length,
        max_length: params.max_tokens,
        temperature: params.temperature,
        top_k: params.top_k,
        top_p: params.top_p,
        min_p: params.min_p,
        rep_pen: params.repeat_penalty,
        tfs: params.tfs,
        stop_sequence: &params.stop,
        grammar: params.grammar.as_deref(),
        images: params.images.iter().map(|i| strip_data_url(i)).collect(),
    };
    Translation::build(request, &params.extra, dropped.0)
}

// ─── Ollama ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    /// Ollama streams unless told otherwise, so this is always sent.
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
    options: OllamaOptions<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tfs_z: Option<f32>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    stop: &'a [String],
}

pub fn translate_ollama(
    prompt: &str,
    params: &GenerationParameters,
    ctx: &TranslationContext<'_>,
) -> Result<Translation, LmError> {
    let mut dropped = Dropped::default();
    dropped.conversation(ctx.options, true);
    dropped.check(params.grammar.is_some(), "grammar");

    let request = OllamaRequest {
        model: params.model.as_deref().or(ctx.model).unwrap_or_default(),
        prompt,
        stream: params.stream,
        system: ctx.options.system.as_deref(),
        format: params.schema.as_ref(),
        images: params.images.iter().map(|i| strip_data_url(i)).collect(),
        options: OllamaOptions {
            num_ctx: ctx.context_length,
            num_predict: params.max_tokens,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            min_p: params.min_p,
            repeat_penalty: params.repeat_penalty,
            tfs_z: params.tfs,
            stop: &params.stop,
        },
    };
    Translation::build(request, &params.extra, dropped.0)
}

// ─── Goinfer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GoinferRequest<'a> {
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tfs: Option<f32>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
}

/// Goinfer keeps the neutral field names. The loaded model is server state.
pub fn translate_goinfer(
    prompt: &str,
    params: &GenerationParameters,
    ctx: &TranslationContext<'_>,
) -> Result<Translation, LmError> {
    let mut dropped = Dropped::default();
    dropped.conversation(ctx.options, false);
    dropped.check(params.model.is_some(), "model");
    dropped.check(params.schema.is_some(), "schema");
    dropped.check(!params.images.is_empty(), "images");

    let request = GoinferRequest {
        prompt,
        stream: params.stream,
        max_tokens: params.max_tokens,
        temperature: params.temperature,
        top_k: params.top_k,
        top_p: params.top_p,
        min_p: params.min_p,
        repeat_penalty: params.repeat_penalty,
        tfs: params.tfs,
        stop: &params.stop,
        grammar: params.grammar.as_deref(),
    };
    Translation::build(request, &params.extra, dropped.0)
}

// ─── OpenAI Chat Completions ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

pub fn translate_openai(
    prompt: &str,
    params: &GenerationParameters,
    ctx: &TranslationContext<'_>,
) -> Result<Translation, LmError> {
    let mut dropped = Dropped::default();
    dropped.check(params.top_k.is_some(), "top_k");
    dropped.check(params.min_p.is_some(), "min_p");
    dropped.check(params.repeat_penalty.is_some(), "repeat_penalty");
    dropped.check(params.tfs.is_some(), "tfs");
    dropped.check(params.grammar.is_some(), "grammar");

    let has_tools = !ctx.options.tools.is_empty();
    let request = ChatCompletionRequest {
        model: params.model.as_deref().or(ctx.model).unwrap_or_default(),
        messages: render_messages(prompt, &params.images, ctx.options),
        stream: params.stream,
        stream_options: params.stream.then(|| json!({ "include_usage": true })),
        max_completion_tokens: params.max_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        stop: &params.stop,
        response_format: params.schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema, "strict": true },
            })
        }),
        tools: has_tools.then(|| ctx.options.tools.iter().map(ToolDefinition::from).collect()),
        tool_choice: has_tools.then_some("auto"),
        parallel_tool_calls: has_tools.then_some(true),
    };
    Translation::build(request, &params.extra, dropped.0)
}

/// Replay the conversation as chat messages.
///
/// Order: system prompt, history turns verbatim, the prompt as a user
/// message with its images, then the assistant
/// prefill. A tool round becomes one assistant message carrying every call
/// followed by one `tool` message per result. A blank prompt contributes
/// no text: the user message is omitted, or carries only the images.
pub fn render_messages(prompt: &str, images: &[String], options: &InferenceOptions) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(ref system) = options.system {
        messages.push(ChatMessage::text(Role::System, system.clone()));
    }

    for turn in &options.history {
        match turn {
            HistoryTurn::User(text) => messages.push(ChatMessage::text(Role::User, text.clone())),
            HistoryTurn::Assistant(text) => {
                messages.push(ChatMessage::text(Role::Assistant, text.clone()))
            }
            HistoryTurn::ToolRound(round) => {
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: Some(round.iter().map(|t| ToolCallResponse::from(&t.call)).collect()),
                });
                for turn in round {
                    let content = match turn.response {
                        Value::String(ref s) => s.clone(),
                        ref other => other.to_string(),
                    };
                    messages.push(ChatMessage {
                        role: Role::Tool,
                        content: Some(MessageContent::Text(content)),
                        tool_call_id: Some(turn.call.id.clone()),
                        tool_calls: None,
                    });
                }
            }
        }
    }

    let blank = prompt.trim().is_empty();
    if !blank || !images.is_empty() {
        let content = if images.is_empty() {
            MessageContent::Text(prompt.to_string())
        } else {
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !blank {
                parts.push(ContentPart::Text {
                    text: prompt.to_string(),
                });
            }
            parts.extend(images.iter().map(|img| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: as_data_url(img),
                },
            }));
            MessageContent::Parts(parts)
        };
        messages.push(ChatMessage {
            role: Role::User,
            content: Some(content),
            tool_call_id: None,
            tool_calls: None,
        });
    }

    if let Some(ref prefill) = options.assistant {
        messages.push(ChatMessage::text(Role::Assistant, prefill.clone()));
    }

    messages
}

// ─── Tests ───────────────────────────────────────────────────────────────────
