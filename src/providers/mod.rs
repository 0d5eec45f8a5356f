//! Backend dialects behind one [`Provider`] contract.
//!
//! Each adapter owns its HTTP client (and with it the bearer key), its
//! active model and its cancellation slot. Nothing is shared between
//! adapter instances.

pub mod goinfer;
pub mod koboldcpp;
pub mod llamacpp;
pub mod ollama;
pub mod openai;

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::inference::errors::LmError;
use crate::inference::params::TranslationContext;
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};

pub use goinfer::GoinferProvider;
pub use koboldcpp::KoboldCppProvider;
pub use llamacpp::LlamaCppProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

// ─── Provider Kind ───────────────────────────────────────────────────────────

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    LlamaCpp,
    KoboldCpp,
    Ollama,
    Goinfer,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::LlamaCpp => "llamacpp",
            ProviderKind::KoboldCpp => "koboldcpp",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Goinfer => "goinfer",
            ProviderKind::OpenAi => "openai",
        }
    }

    /// Whether the backend refuses requests without a bearer key.
    pub fn requires_api_key(self) -> bool {
        matches!(self, ProviderKind::Goinfer | ProviderKind::OpenAi)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "llamacpp" => Ok(ProviderKind::LlamaCpp),
            "koboldcpp" => Ok(ProviderKind::KoboldCpp),
            "ollama" => Ok(ProviderKind::Ollama),
            "goinfer" => Ok(ProviderKind::Goinfer),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(LmError::ConfigError {
                reason: format!("unknown provider '{other}'"),
            }),
        }
    }
}

// ─── Provider Contract ───────────────────────────────────────────────────────

/// Operations every backend adapter implements.
///
/// One call in flight per adapter is the supported pattern. A second
/// `infer` issued before the first resolves takes over the cancellation
/// slot, so `abort` then reaches only the second call.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Snapshot of the active model.
    fn model(&self) -> ModelDescriptor;

    /// Metadata of the model the server is running. Fails with
    /// `NotImplemented` on backends that cannot report it.
    async fn info(&self) -> Result<ModelDescriptor, LmError>;

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError>;

    /// Select, verify or retrieve a model, depending on the backend.
    async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError>;

    async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        options: &InferenceOptions,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError>;

    /// Cancel the latest call. Never fails; a no-op when nothing is running.
    async fn abort(&self);
}

// ─── Shared Adapter State ────────────────────────────────────────────────────

/// The adapter's active model, written by `load_model`, read by `infer`.
#[derive(Debug, Default)]
pub(crate) struct ActiveModel(Mutex<ModelDescriptor>);

impl ActiveModel {
    pub(crate) fn new(initial: Option<ModelDescriptor>) -> Self {
        Self(Mutex::new(initial.unwrap_or_default()))
    }

    pub(crate) fn get(&self) -> ModelDescriptor {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set(&self, model: ModelDescriptor) {
        tracing::info!(model = %model.name, context_length = ?model.context_length, "active model set");
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = model;
    }

    /// The name to send, or `NoModelSelected` for backends that route by it.
    pub(crate) fn require(
        &self,
        provider: ProviderKind,
        params: &GenerationParameters,
    ) -> Result<ModelDescriptor, LmError> {
        let model = self.get();
        let has_override = params.model.as_deref().is_some_and(|m| !m.is_empty());
        if model.name.is_empty() && !has_override {
            return Err(LmError::NoModelSelected {
                provider: provider.as_str(),
            });
        }
        Ok(model)
    }
}

pub(crate) fn context<'a>(model: &'a ModelDescriptor, options: &'a InferenceOptions) -> TranslationContext<'a> {
    TranslationContext {
        model: (!model.name.is_empty()).then_some(model.name.as_str()),
        context_length: model.context_length,
        options,
    }
}

/// Last `/`-separated segment of a model path.
pub(crate) fn model_basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            ProviderKind::LlamaCpp,
            ProviderKind::KoboldCpp,
            ProviderKind::Ollama,
            ProviderKind::Goinfer,
            ProviderKind::OpenAi,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
        assert!("vllm".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_requires_api_key() {
        assert!(ProviderKind::OpenAi.requires_api_key());
        assert!(ProviderKind::Goinfer.requires_api_key());
        assert!(!ProviderKind::Ollama.requires_api_key());
    }

    #[test]
    fn test_active_model_require() {
        let active = ActiveModel::new(None);
        let params = GenerationParameters::default();
        assert!(matches!(
            active.require(ProviderKind::Ollama, &params),
            Err(LmError::NoModelSelected { provider: "ollama" })
        ));

        let with_override = GenerationParameters {
            model: Some("qwen2.5".into()),
            ..GenerationParameters::default()
        };
        assert!(active.require(ProviderKind::Ollama, &with_override).is_ok());

        active.set(ModelDescriptor::named("llama3"));
        assert_eq!(active.require(ProviderKind::Ollama, &params).unwrap().name, "llama3");
    }

    #[test]
    fn test_model_basename() {
        assert_eq!(model_basename("/models/mistral-7b.Q4_K_M.gguf"), "mistral-7b.Q4_K_M.gguf");
        assert_eq!(model_basename("koboldcpp/mistral"), "mistral");
        assert_eq!(model_basename("plain"), "plain");
    }
}
