//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Each variant
//! carries enough context to tell an unreachable backend, a missing model and
//! an unparseable response apart from the message alone.

use thiserror::Error;

/// Errors that can occur while talking to an inference backend.
#[derive(Debug, Error)]
pub enum LmError {
    /// TCP/HTTP connection to the backend failed, or the stream broke mid-read.
    #[error("backend unreachable at {endpoint}: {reason}")]
    BackendUnavailable { endpoint: String, reason: String },

    /// An explicit load-by-name failed.
    #[error("model not found: '{name}' ({reason})")]
    ModelNotFound { name: String, reason: String },

    /// The operation has no meaning for this backend.
    #[error("{operation} is not implemented for the {provider} provider")]
    NotImplemented {
        provider: &'static str,
        operation: &'static str,
    },

    /// A frame or a final payload could not be parsed.
    #[error("response was not parseable: {reason}")]
    MalformedResponse { reason: String, payload: String },

    /// The accumulated arguments of a tool call are not a JSON object.
    #[error("tool call '{name}' has unparseable arguments: {reason}")]
    ToolCallArgumentParse {
        name: String,
        raw_arguments: String,
        reason: String,
    },

    /// The caller aborted the request.
    #[error("inference cancelled")]
    Cancelled,

    /// Non-2xx HTTP response. `body` is the backend's own text, unmodified.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The backend reported an error in-band, inside the stream.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// `infer` was called before any model was selected.
    #[error("no model selected for the {provider} provider, call load_model first")]
    NoModelSelected { provider: &'static str },

    /// The backend mandates a credential and none was supplied.
    #[error("missing API key for the {provider} provider")]
    MissingCredential { provider: &'static str },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl LmError {
    /// Build a `MalformedResponse`, keeping at most a short excerpt of the payload.
    pub fn malformed(reason: impl Into<String>, payload: &str) -> Self {
        const MAX_EXCERPT: usize = 512;
        let mut end = payload.len().min(MAX_EXCERPT);
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        LmError::MalformedResponse {
            reason: reason.into(),
            payload: payload[..end].to_string(),
        }
    }

    /// Whether this error is the result of a caller-initiated abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LmError::Cancelled)
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            LmError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LmError {
    fn from(e: serde_json::Error) -> Self {
        LmError::MalformedResponse {
            reason: e.to_string(),
            payload: String::new(),
        }
    }
}
