//! Shared types for the provider contract.
//!
//! Caller-facing types (model descriptors, neutral generation parameters,
//! conversation history, tool specs, results, per-call hooks) plus the
//! OpenAI Chat Completions wire types used to replay a conversation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::stats::{InferenceStats, IngestionStats};

// ─── Models ──────────────────────────────────────────────────────────────────

/// A model the backend can run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ModelInfo>,
    /// Backend-specific metadata (e.g. llama.cpp router status).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl ModelDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context_length: Option<u32>) -> Self {
        self.context_length = context_length;
        self
    }
}

/// Size and quantization as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub param_size: String,
    pub quantization: String,
}

/// Options for `load_model`.
#[derive(Default)]
pub struct LoadOptions<'a> {
    /// Context window to use instead of the backend's default.
    pub context_length: Option<u32>,
    /// Where to fetch the model from when the backend can retrieve models.
    pub urls: Vec<String>,
    /// Invoked periodically while a model is being retrieved.
    pub on_progress: Option<Box<dyn FnMut(&LoadProgress) + Send + 'a>>,
}

impl<'a> LoadOptions<'a> {
    pub fn with_context(mut self, context_length: u32) -> Self {
        self.context_length = Some(context_length);
        self
    }

    pub fn with_progress(mut self, f: impl FnMut(&LoadProgress) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub(crate) fn report(&mut self, progress: &LoadProgress) {
        if let Some(ref mut f) = self.on_progress {
            f(progress);
        }
    }
}

impl fmt::Debug for LoadOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("context_length", &self.context_length)
            .field("urls", &self.urls)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Progress of a model retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    pub status: String,
    pub total: u64,
    pub completed: u64,
    pub percent: f64,
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Backend-neutral generation parameters.
///
/// Translated per backend by [`crate::inference::params`]. `extra` is
/// shallow-merged last into the backend payload and is not validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub stream: bool,
    /// Per-call model override, for backends that route by model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    /// Tail-free sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tfs: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// GBNF grammar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    /// JSON schema constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Base64 images, bare or as `data:` URLs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl GenerationParameters {
    pub fn streaming() -> Self {
        Self {
            stream: true,
            ..Self::default()
        }
    }
}

/// Per-call options orthogonal to sampling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    pub system: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub tools: Vec<ToolSpec>,
    /// Assistant prefill appended after the prompt.
    pub assistant: Option<String>,
    pub debug: bool,
    pub verbose: bool,
}

/// One conversation turn, replayed verbatim and in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTurn {
    User(String),
    Assistant(String),
    ToolRound(Vec<ToolTurn>),
}

/// A tool call issued by the model and the result the caller fed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTurn {
    pub call: ToolCallSpec,
    pub response: Value,
}

/// Static declaration of a tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<ToolArgSpec>,
}

/// A named argument of a [`ToolSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolArgSpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default)]
    pub required: bool,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// A complete tool call. Never exposed before all argument fragments arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSpec {
    /// Backend-assigned, or `call_<uuid>` when the backend gave none.
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Terminal value of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    /// Concatenation of every content fragment, thinking excluded.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub stats: InferenceStats,
    /// Backend-native usage numbers, unmodified.
    pub server_stats: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSpec>,
}

// ─── Hooks ───────────────────────────────────────────────────────────────────

/// Per-call event handlers. Absent handlers drop their events.
#[derive(Default)]
pub struct InferenceHooks<'a> {
    on_token: Option<Box<dyn FnMut(&str) + Send + 'a>>,
    on_start: Option<Box<dyn FnMut(&IngestionStats) + Send + 'a>>,
    on_end: Option<Box<dyn FnMut(&InferenceResult) + Send + 'a>>,
    on_error: Option<Box<dyn FnMut(&str) + Send + 'a>>,
}

impl<'a> InferenceHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_token(mut self, f: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_token = Some(Box::new(f));
        self
    }

    pub fn on_start(mut self, f: impl FnMut(&IngestionStats) + Send + 'a) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl FnMut(&InferenceResult) + Send + 'a) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub(crate) fn token(&mut self, fragment: &str) {
        if let Some(ref mut f) = self.on_token {
            f(fragment);
        }
    }

    pub(crate) fn started(&mut self, stats: &IngestionStats) {
        if let Some(ref mut f) = self.on_start {
            f(stats);
        }
    }

    pub(crate) fn ended(&mut self, result: &InferenceResult) {
        if let Some(ref mut f) = self.on_end {
            f(result);
        }
    }

    pub(crate) fn error(&mut self, message: &str) {
        if let Some(ref mut f) = self.on_error {
            f(message);
        }
    }
}

impl fmt::Debug for InferenceHooks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceHooks")
            .field("on_token", &self.on_token.is_some())
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ─── Chat Wire Types ─────────────────────────────────────────────────────────

/// A single message in a chat completions request.
///
/// Serialization notes for OpenAI-compatible servers:
/// - `content` must be `""` (not `null`) for assistant messages with tool calls.
///   Many local servers misinterpret `null` content and fail to recognize the
///   tool call round-trip pattern.
/// - `tool_call_id` and `tool_calls` are skipped when `None`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<MessageContent>,
    /// Tool call results are sent back as `tool` role messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant messages may contain tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// Plain text, or text plus image parts for vision models.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multi-part user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Custom serializer for `content`: emit `""` instead of `null` when `None`.
fn serialize_content<S>(value: &Option<MessageContent>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(content) => content.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

/// Function definition within a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSpec> for ToolDefinition {
    fn from(spec: &ToolSpec) -> Self {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &spec.arguments {
            properties.insert(
                arg.name.clone(),
                serde_json::json!({
                    "type": arg.r#type.as_deref().unwrap_or("string"),
                    "description": arg.description,
                }),
            );
            if arg.required {
                required.push(Value::String(arg.name.clone()));
            }
        }
        ToolDefinition {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            },
        }
    }
}

/// Tool call as sent back in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCallSpec> for ToolCallResponse {
    fn from(call: &ToolCallSpec) -> Self {
        ToolCallResponse {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCallResponse {
                name: call.name.clone(),
                arguments: Value::Object(call.arguments.clone()).to_string(),
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
