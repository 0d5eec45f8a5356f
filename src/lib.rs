//! One client API over local and hosted LLM servers.
//!
//! [`Lm`] fronts five backend dialects (llama.cpp, koboldcpp, Ollama,
//! Goinfer and OpenAI-compatible APIs). Each call is translated into the
//! backend's wire shape, streamed frames are normalized into one token
//! sequence, tool calls are reassembled from deltas and timing stats are
//! computed the same way regardless of backend.

pub mod inference;
pub mod lm;
pub mod providers;

pub use inference::errors::LmError;
pub use inference::types::{
    GenerationParameters, HistoryTurn, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    LoadProgress, ModelDescriptor, ToolArgSpec, ToolCallSpec, ToolSpec, ToolTurn,
};
pub use inference::{InferenceStats, IngestionStats, LmConfig};
pub use lm::{Lm, LmParams};
pub use providers::{Provider, ProviderKind};

/// Environment variable selecting `json` log output.
pub const LOG_FORMAT_ENV: &str = "LOCALLM_LOG_FORMAT";

/// Install a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` overrides the default `locallm=info,warn` filter. Set
/// `LOCALLM_LOG_FORMAT=json` for one JSON object per line. Calling this
/// again, or after the host installed its own subscriber, does nothing.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("locallm=info,warn"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(version = env!("CARGO_PKG_VERSION"), "locallm tracing initialized");
    }
}
