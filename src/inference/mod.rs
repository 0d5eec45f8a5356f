//! Inference plumbing shared by every backend dialect.
//!
//! - Neutral request/response types and per-call hooks
//! - The parameter translation table
//! - Frame splitting and the streaming decoder state machine
//! - Tool call delta accumulation
//! - Timing statistics
//! - The HTTP transport and inference pipeline
//! - YAML configuration
//!
//! Nothing here knows which backend it talks to; the dialects in
//! [`crate::providers`] supply the endpoint, the translation and the
//! frame grammar.

pub mod client;
pub mod config;
pub mod errors;
pub mod params;
pub mod stats;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::{CancelSlot, InferenceClient};
pub use config::{find_config_path, load_config, LmConfig, ProviderConfig};
pub use errors::LmError;
pub use stats::{InferenceStats, IngestionStats, StatsEngine};
pub use streaming::{FrameEvent, FrameGrammar, Framing, StreamDecoder, THINK_CLOSE, THINK_OPEN};
pub use tool_call_parser::ToolCallAccumulator;
pub use types::{
    GenerationParameters, HistoryTurn, InferenceHooks, InferenceOptions, InferenceResult, LoadOptions,
    LoadProgress, ModelDescriptor, ModelInfo, ToolArgSpec, ToolCallSpec, ToolSpec, ToolTurn,
};
