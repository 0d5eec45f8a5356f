//! Tool call reconstruction.
//!
//! Streaming backends send a tool call as a series of deltas keyed by call
//! index. Any delta may carry the id, the name, a slice of the JSON-encoded
//! arguments, or any mix of those. The [`ToolCallAccumulator`] keeps one
//! entry per index and only turns them into [`ToolCallSpec`]s when the
//! backend signals the calls are ready.
//!
//! Non-streaming responses carry complete calls, handled by
//! [`parse_native_json_tool_call`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::LmError;
use super::types::ToolCallSpec;

// ─── Streaming Deltas ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    fragments: Vec<String>,
}

/// Sparse per-index accumulator for streamed tool call deltas.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<u32, PendingCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fold one delta into the entry for `index`.
    ///
    /// A present id or name overwrites the previous value; an absent one
    /// leaves it untouched. Argument slices are appended in arrival order.
    pub fn apply(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let entry = self.pending.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            entry.id = Some(id.to_string());
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            entry.name = Some(name.to_string());
        }
        if let Some(args) = arguments {
            entry.fragments.push(args.to_string());
        }
    }

    /// Turn every pending entry into a complete call, in index order.
    ///
    /// Fails on the first call whose joined arguments are not a JSON object.
    pub fn finalize(&mut self) -> Result<Vec<ToolCallSpec>, LmError> {
        let pending = std::mem::take(&mut self.pending);
        let mut calls = Vec::with_capacity(pending.len());
        for (index, call) in pending {
            let raw = call.fragments.concat();
            let name = call.name.unwrap_or_default();
            if name.is_empty() {
                return Err(LmError::ToolCallArgumentParse {
                    name: format!("#{index}"),
                    raw_arguments: raw,
                    reason: "tool call has no name".into(),
                });
            }
            let arguments = parse_arguments(&name, &raw)?;
            calls.push(ToolCallSpec {
                id: call.id.unwrap_or_else(synthesize_id),
                name,
                arguments,
            });
        }
        Ok(calls)
    }
}

// ─── Complete Calls ──────────────────────────────────────────────────────────

/// Build a call from a non-streaming response.
///
/// `arguments` may be a JSON-encoded string (OpenAI) or an object (Ollama).
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments: &Value,
) -> Result<ToolCallSpec, LmError> {
    if name.is_empty() {
        return Err(LmError::ToolCallArgumentParse {
            name: String::new(),
            raw_arguments: arguments.to_string(),
            reason: "tool call has no name".into(),
        });
    }

    let arguments = match arguments {
        Value::Object(map) => map.clone(),
        Value::String(raw) => parse_arguments(name, raw)?,
        Value::Null => Map::new(),
        other => {
            return Err(LmError::ToolCallArgumentParse {
                name: name.to_string(),
                raw_arguments: other.to_string(),
                reason: "arguments are not a JSON object".into(),
            })
        }
    };

    Ok(ToolCallSpec {
        id: id
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(synthesize_id),
        name: name.to_string(),
        arguments,
    })
}

fn parse_arguments(name: &str, raw: &str) -> Result<Map<String, Value>, LmError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(LmError::ToolCallArgumentParse {
            name: name.to_string(),
            raw_arguments: raw.to_string(),
            reason: "arguments are not a JSON object".into(),
        }),
        Err(e) => Err(LmError::ToolCallArgumentParse {
            name: name.to_string(),
            raw_arguments: raw.to_string(),
            reason: format!("invalid JSON arguments: {e}"),
        }),
    }
}

fn synthesize_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_three_fragment_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_abc"), Some("sum"), Some("{\"a\":"));
        acc.apply(0, None, None, Some("1,\"b\":"));
        acc.apply(0, None, None, Some("2}"));

        let calls = acc.finalize().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "sum");
        assert_eq!(Value::Object(calls[0].arguments.clone()), json!({"a": 1, "b": 2}));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, None, Some("list_dir"), Some("{}"));
        let calls = acc.finalize().unwrap();
        assert!(calls[0].id.starts_with("call_"));
        assert!(calls[0].id.len() > "call_".len());
    }

    #[test]
    fn test_later_delta_never_clears_name_or_id() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_1"), Some("search"), None);
        acc.apply(0, Some(""), None, Some("{\"q\":\"rust\"}"));
        let calls = acc.finalize().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn test_interleaved_calls_finalize_in_index_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(1, Some("call_b"), Some("second"), Some("{\"x\":"));
        acc.apply(0, Some("call_a"), Some("first"), Some("{\"y\":"));
        acc.apply(1, None, None, Some("2}"));
        acc.apply(0, None, None, Some("1}"));

        let calls = acc.finalize().unwrap();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].arguments["y"], 1);
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].arguments["x"], 2);
    }

    #[test]
    fn test_empty_arguments_become_empty_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_1"), Some("now"), None);
        let calls = acc.finalize().unwrap();
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn test_truncated_arguments_fail() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_1"), Some("sum"), Some("{\"a\":"));
        let err = acc.finalize().unwrap_err();
        match err {
            LmError::ToolCallArgumentParse { name, raw_arguments, .. } => {
                assert_eq!(name, "sum");
                assert_eq!(raw_arguments, "{\"a\":");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_object_arguments_fail() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, None, Some("sum"), Some("[1,2]"));
        assert!(matches!(
            acc.finalize(),
            Err(LmError::ToolCallArgumentParse { .. })
        ));
    }

    #[test]
    fn test_nameless_call_fails() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_1"), None, Some("{}"));
        assert!(acc.finalize().is_err());
    }

    #[test]
    fn test_native_call_with_string_arguments() {
        let call = parse_native_json_tool_call(
            Some("call_1"),
            "get_weather",
            &json!("{\"location\":\"Paris\"}"),
        )
        .unwrap();
        assert_eq!(call.id, "call_1");
        assert_eq!(call.arguments["location"], "Paris");
    }

    #[test]
    fn test_native_call_with_object_arguments() {
        let call = parse_native_json_tool_call(None, "get_weather", &json!({"location": "Oslo"})).unwrap();
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.arguments["location"], "Oslo");
    }

    #[test]
    fn test_native_call_invalid_json() {
        let result = parse_native_json_tool_call(Some("call_1"), "get_weather", &json!("not json"));
        assert!(matches!(result, Err(LmError::ToolCallArgumentParse { .. })));
    }

    #[test]
    fn test_native_call_empty_name() {
        assert!(parse_native_json_tool_call(None, "", &json!({})).is_err());
    }
}
