//! The `Lm` facade: one type in front of every backend.
//!
//! ```ignore
//! let lm = Lm::new(LmParams::new(ProviderKind::Ollama, "http://localhost:11434"))?;
//! lm.load_model("llama3.1:8b", LoadOptions::default()).await?;
//! let mut hooks = InferenceHooks::new().on_token(|t| print!("{t}"));
//! let result = lm
//!     .infer("list the planets", &GenerationParameters::streaming(), &InferenceOptions::default(), &mut hooks)
//!     .await?;
//! ```

use std::path::Path;

use crate::inference::config::{load_config, LmConfig};
use crate::inference::errors::LmError;
use crate::inference::types::{
    GenerationParameters, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    ModelDescriptor,
};
use crate::providers::{
    GoinferProvider, KoboldCppProvider, LlamaCppProvider, OllamaProvider, OpenAiProvider, Provider,
    ProviderKind,
};

/// Construction parameters for [`Lm`].
#[derive(Debug, Clone, PartialEq)]
pub struct LmParams {
    pub provider: ProviderKind,
    pub server_url: String,
    pub api_key: Option<String>,
    /// Initial active model, recorded without contacting the server.
    pub model: Option<String>,
    pub context_length: Option<u32>,
}

impl LmParams {
    pub fn new(provider: ProviderKind, server_url: impl Into<String>) -> Self {
        Self {
            provider,
            server_url: server_url.into(),
            api_key: None,
            model: None,
            context_length: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Backend-agnostic client. Swapping backends means building a new `Lm`.
pub struct Lm {
    provider: Box<dyn Provider>,
    defaults: GenerationParameters,
}

impl Lm {
    /// Build the adapter for `params.provider`.
    ///
    /// Fails with `MissingCredential` right away when the backend requires a
    /// key and none was given.
    pub fn new(params: LmParams) -> Result<Self, LmError> {
        let api_key = params.api_key.filter(|k| !k.trim().is_empty());
        if params.provider.requires_api_key() && api_key.is_none() {
            return Err(LmError::MissingCredential {
                provider: params.provider.as_str(),
            });
        }

        let model = params
            .model
            .filter(|m| !m.is_empty())
            .map(|name| ModelDescriptor::named(name).with_context(params.context_length));
        let url = params.server_url.as_str();

        let provider: Box<dyn Provider> = match params.provider {
            ProviderKind::LlamaCpp => Box::new(LlamaCppProvider::new(url, api_key, model)?),
            ProviderKind::KoboldCpp => Box::new(KoboldCppProvider::new(url, api_key, model)?),
            ProviderKind::Ollama => Box::new(OllamaProvider::new(url, api_key, model)?),
            ProviderKind::Goinfer => Box::new(GoinferProvider::new(url, api_key, model)?),
            ProviderKind::OpenAi => Box::new(OpenAiProvider::new(url, api_key, model)?),
        };
        tracing::info!(provider = %params.provider, server_url = %url, "provider ready");

        Ok(Self {
            provider,
            defaults: GenerationParameters::default(),
        })
    }

    /// Build from a config entry, `None` selecting the default one.
    pub fn from_config(config: &LmConfig, name: Option<&str>) -> Result<Self, LmError> {
        let (_, entry) = config.resolve(name)?;
        let mut lm = Self::new(entry.to_params())?;
        lm.defaults = entry.defaults.clone();
        Ok(lm)
    }

    /// Load a config file and build from it.
    pub fn from_config_file(path: &Path, name: Option<&str>) -> Result<Self, LmError> {
        Self::from_config(&load_config(path)?, name)
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Snapshot of the active model.
    pub fn model(&self) -> ModelDescriptor {
        self.provider.model()
    }

    /// Generation parameters configured for this backend.
    pub fn defaults(&self) -> &GenerationParameters {
        &self.defaults
    }

    pub async fn info(&self) -> Result<ModelDescriptor, LmError> {
        self.provider.info().await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LmError> {
        self.provider.list_models().await
    }

    pub async fn load_model(&self, name: &str, options: LoadOptions<'_>) -> Result<(), LmError> {
        self.provider.load_model(name, options).await
    }

    pub async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        options: &InferenceOptions,
        hooks: &mut InferenceHooks<'_>,
    ) -> Result<InferenceResult, LmError> {
        self.provider.infer(prompt, params, options, hooks).await
    }

    pub async fn abort(&self) {
        self.provider.abort().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
