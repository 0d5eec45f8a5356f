//! YAML configuration.
//!
//! A config file names one or more backend servers and the default
//! generation parameters to use with each:
//!
//! ```yaml
//! default_provider: local
//! providers:
//!   local:
//!     provider: ollama
//!     server_url: http://localhost:11434
//!     model: llama3.1:8b
//!     defaults: { temperature: 0.7, max_tokens: 512 }
//!   hosted:
//!     provider: openai
//!     server_url: https://api.openai.com/v1
//!     api_key: ${OPENAI_API_KEY}
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are resolved from the environment before
//! parsing; a leading `~` in a default expands to the home directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::LmError;
use super::types::GenerationParameters;
use crate::lm::LmParams;
use crate::providers::ProviderKind;

/// Environment variable pointing straight at a config file.
pub const CONFIG_ENV: &str = "LOCALLM_CONFIG";
/// File name searched for when walking up from a directory.
pub const CONFIG_FILE: &str = "locallm.yaml";

// ─── Config Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct LmConfig {
    #[serde(default)]
    pub default_provider: Option<String>,
    pub providers: HashMap<String, ProviderConfig>,
}

/// One backend server.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub server_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Recorded as the active model without contacting the server.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub defaults: GenerationParameters,
}

impl ProviderConfig {
    pub fn to_params(&self) -> LmParams {
        LmParams {
            provider: self.provider,
            server_url: self.server_url.clone(),
            api_key: self.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: self.model.clone().filter(|m| !m.is_empty()),
            context_length: self.context_length,
        }
    }
}

impl LmConfig {
    /// Pick a provider entry by name, falling back to `default_provider`,
    /// then to the only entry when there is exactly one.
    pub fn resolve(&self, name: Option<&str>) -> Result<(&str, &ProviderConfig), LmError> {
        let wanted = name.or(self.default_provider.as_deref());
        match wanted {
            Some(wanted) => self
                .providers
                .get_key_value(wanted)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| LmError::ConfigError {
                    reason: format!("provider '{wanted}' not found in config"),
                }),
            None if self.providers.len() == 1 => self
                .providers
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| LmError::ConfigError {
                    reason: "no providers configured".into(),
                }),
            None => Err(LmError::ConfigError {
                reason: "no provider named and no default_provider set".into(),
            }),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `LOCALLM_CONFIG` wins when it points at an existing file; otherwise the
/// directories from `start` upward are searched for `locallm.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, LmError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV} does not point at a file, searching");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(LmError::ConfigError {
        reason: format!("could not find {CONFIG_FILE}"),
    })
}

pub fn load_config(path: &Path) -> Result<LmConfig, LmError> {
    let raw = std::fs::read_to_string(path).map_err(|e| LmError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<LmConfig, LmError> {
    let interpolated = interpolate_env_vars(raw);
    let config: LmConfig = serde_yaml::from_str(&interpolated).map_err(|e| LmError::ConfigError {
        reason: format!("invalid config: {e}"),
    })?;
    if config.providers.is_empty() {
        return Err(LmError::ConfigError {
            reason: "no providers configured".into(),
        });
    }
    tracing::debug!(providers = config.providers.len(), "config loaded");
    Ok(config)
}

// ─── Interpolation ───────────────────────────────────────────────────────────

fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// `NAME` or `NAME:-default`. An unset or empty variable takes the default.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
