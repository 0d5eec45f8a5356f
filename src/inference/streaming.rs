//! Streaming frame decoding.
//!
//! Two layers:
//!
//! 1. [`FrameSplitter`] turns raw body bytes into JSON frames. SSE events are
//!    split on blank lines and their `data:` payloads fed to an incremental
//!    JSON buffer; NDJSON bodies go straight to the buffer. A network read
//!    never has to line up with a frame, and a JSON value split across two
//!    reads or two events is held until it is complete.
//! 2. [`StreamDecoder`] applies a backend's [`FrameGrammar`] to each frame and
//!    drives the per-call state machine: content accumulation, thinking
//!    markers, tool call deltas, server statistics and termination.

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::errors::LmError;
use super::stats::StatsEngine;
use super::tool_call_parser::ToolCallAccumulator;
use super::types::{InferenceHooks, ToolCallSpec};

/// Marker delivered to the token callback when reasoning output begins.
pub const THINK_OPEN: &str = "<think>\n";
/// Marker delivered when reasoning output gives way to the answer.
pub const THINK_CLOSE: &str = "\n</think>\n\n";

// ─── Framing ─────────────────────────────────────────────────────────────────

/// How a backend delimits frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events, one JSON document per `data:` payload.
    Sse,
    /// Newline-delimited JSON objects.
    Ndjson,
}

/// One unit handed from the splitter to the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Json(Value),
    /// Literal end marker (`data: [DONE]`).
    Sentinel,
}

/// Accumulates bytes until a complete JSON value can be parsed.
#[derive(Debug, Default)]
pub struct JsonBuffer {
    buf: Vec<u8>,
}

impl JsonBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether a partial value is waiting for more bytes.
    pub fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Parse the next complete value, if one is available.
    ///
    /// An incomplete value stays buffered. Any other parse failure is fatal.
    pub fn next_value(&mut self) -> Result<Option<Value>, LmError> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Ok(None);
        };

        let mut values = serde_json::Deserializer::from_slice(&self.buf[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let end = start + values.byte_offset();
                self.buf.drain(..end);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(LmError::malformed(
                format!("invalid JSON frame: {e}"),
                &String::from_utf8_lossy(&self.buf[start..]),
            )),
            None => Ok(None),
        }
    }

    /// The buffered bytes as text, for error payloads.
    pub fn excerpt(&self) -> String {
        String::from_utf8_lossy(&self.buf).trim().to_string()
    }
}

/// Splits a response body into frames according to its [`Framing`].
#[derive(Debug)]
pub struct FrameSplitter {
    framing: Framing,
    /// Raw SSE bytes not yet split into events.
    raw: Vec<u8>,
    json: JsonBuffer,
    closed: bool,
}

impl FrameSplitter {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            raw: Vec::new(),
            json: JsonBuffer::default(),
            closed: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        match self.framing {
            Framing::Ndjson => self.json.push(bytes),
            Framing::Sse => self.raw.extend(bytes.iter().copied().filter(|b| *b != b'\r')),
        }
    }

    /// Mark the end of the body. A trailing event without its blank line is
    /// still processed.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, LmError> {
        loop {
            if let Some(value) = self.json.next_value()? {
                return Ok(Some(RawFrame::Json(value)));
            }
            if self.framing == Framing::Ndjson {
                return self.at_rest();
            }

            let Some(event) = self.take_event() else {
                return self.at_rest();
            };
            match parse_sse_event(&event) {
                SseEvent::Done => {
                    if self.json.has_partial() {
                        return Err(self.truncated());
                    }
                    return Ok(Some(RawFrame::Sentinel));
                }
                SseEvent::Data(data) => self.json.push(data.as_bytes()),
                SseEvent::Empty => {}
            }
        }
    }

    fn take_event(&mut self) -> Option<String> {
        if let Some(pos) = self.raw.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.raw.drain(..pos + 2).collect();
            return Some(String::from_utf8_lossy(&event[..pos]).into_owned());
        }
        if self.closed && !self.raw.is_empty() {
            let event = std::mem::take(&mut self.raw);
            return Some(String::from_utf8_lossy(&event).into_owned());
        }
        None
    }

    /// Nothing more to hand out: fine mid-stream, fatal after close if a
    /// value is cut short.
    fn at_rest(&self) -> Result<Option<RawFrame>, LmError> {
        if self.closed && self.json.has_partial() {
            return Err(self.truncated());
        }
        Ok(None)
    }

    fn truncated(&self) -> LmError {
        LmError::malformed("stream ended inside a JSON value", &self.json.excerpt())
    }
}

enum SseEvent {
    Data(String),
    Done,
    Empty,
}

/// Collect the `data:` lines of one event. `event:` names and `:` comments
/// carry nothing the decoder needs.
fn parse_sse_event(event: &str) -> SseEvent {
    let mut data: Option<String> = None;
    for line in event.lines() {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        match data {
            Some(ref mut d) => {
                d.push('\n');
                d.push_str(rest);
            }
            None => data = Some(rest.to_string()),
        }
    }
    match data {
        Some(d) if d.trim() == "[DONE]" => SseEvent::Done,
        Some(d) if !d.trim().is_empty() => SseEvent::Data(d),
        _ => SseEvent::Empty,
    }
}

// ─── Grammar ─────────────────────────────────────────────────────────────────

/// What a frame means, independent of the backend's field names.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Content(String),
    Thinking(String),
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// A complete call from a non-streaming response.
    ToolCall(ToolCallSpec),
    /// The backend declared its tool calls complete.
    ToolCallsReady,
    ServerStats(Map<String, Value>),
    Done,
}

/// Backend-specific reading of frames.
///
/// Frames whose shape the grammar does not recognise yield no events. An
/// in-band error report is returned as `Err`.
pub trait FrameGrammar: Send + Sync {
    fn framing(&self) -> Framing;

    /// Events carried by one streamed frame.
    fn decode_frame(&self, frame: &Value) -> Result<Vec<FrameEvent>, LmError>;

    /// Events carried by a complete non-streaming response.
    fn decode_complete(&self, body: &Value) -> Result<Vec<FrameEvent>, LmError>;

    /// Generated-token count from the backend's own statistics, if it has one.
    fn reported_tokens(&self, _server_stats: &Map<String, Value>) -> Option<u64> {
        None
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitFirstFrame,
    Streaming,
    Terminated,
    Cancelled,
}

/// Everything a finished stream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedStream {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallSpec>,
    pub server_stats: Map<String, Value>,
    /// Non-empty content and thinking fragments seen.
    pub fragments: u64,
}

/// Per-call decoder. Not reused across calls.
pub struct StreamDecoder<'g> {
    grammar: &'g dyn FrameGrammar,
    splitter: FrameSplitter,
    state: DecoderState,
    text: String,
    thinking: String,
    in_thinking: bool,
    tools: ToolCallAccumulator,
    tool_calls: Vec<ToolCallSpec>,
    server_stats: Map<String, Value>,
    fragments: u64,
    /// Strings waiting for the token callback, in stream order.
    outbox: Vec<String>,
    first_frame_pending: bool,
}

impl<'g> StreamDecoder<'g> {
    pub fn new(grammar: &'g dyn FrameGrammar) -> Self {
        Self {
            grammar,
            splitter: FrameSplitter::new(grammar.framing()),
            state: DecoderState::AwaitFirstFrame,
            text: String::new(),
            thinking: String::new(),
            in_thinking: false,
            tools: ToolCallAccumulator::new(),
            tool_calls: Vec::new(),
            server_stats: Map::new(),
            fragments: 0,
            outbox: Vec::new(),
            first_frame_pending: false,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Decode a non-streaming response as an already-terminated stream.
    pub fn decode_single(grammar: &'g dyn FrameGrammar, body: &Value) -> Result<DecodedStream, LmError> {
        let mut decoder = Self::new(grammar);
        for event in grammar.decode_complete(body)? {
            decoder.apply(event)?;
        }
        decoder.outbox.clear();
        decoder.state = DecoderState::Terminated;
        decoder.into_decoded()
    }

    /// Process one network read. Every complete frame it finishes is
    /// decoded and its fragments delivered before the next frame is looked at.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        cancel: &CancellationToken,
        hooks: &mut InferenceHooks<'_>,
        stats: &mut StatsEngine,
    ) -> Result<(), LmError> {
        self.splitter.push(chunk);
        self.drain(cancel, hooks, stats)
    }

    /// Close the stream and assemble the result.
    pub fn finish(
        mut self,
        cancel: &CancellationToken,
        hooks: &mut InferenceHooks<'_>,
        stats: &mut StatsEngine,
    ) -> Result<DecodedStream, LmError> {
        self.splitter.close();
        self.drain(cancel, hooks, stats)?;
        if self.in_thinking {
            self.in_thinking = false;
            hooks.token(THINK_CLOSE);
        }
        self.state = DecoderState::Terminated;
        self.into_decoded()
    }

    fn drain(
        &mut self,
        cancel: &CancellationToken,
        hooks: &mut InferenceHooks<'_>,
        stats: &mut StatsEngine,
    ) -> Result<(), LmError> {
        while let Some(frame) = self.splitter.next_frame()? {
            if cancel.is_cancelled() {
                self.state = DecoderState::Cancelled;
                return Err(LmError::Cancelled);
            }
            self.process(frame)?;

            if self.first_frame_pending {
                self.first_frame_pending = false;
                if let Some(ingestion) = stats.mark_first_token() {
                    hooks.started(&ingestion);
                }
            }
            for fragment in self.outbox.drain(..) {
                hooks.token(&fragment);
            }
        }
        Ok(())
    }

    fn process(&mut self, frame: RawFrame) -> Result<(), LmError> {
        if self.state == DecoderState::Terminated {
            tracing::debug!(?frame, "frame after end of stream ignored");
            return Ok(());
        }
        let events = match frame {
            RawFrame::Sentinel => vec![FrameEvent::Done],
            RawFrame::Json(ref value) => self.grammar.decode_frame(value)?,
        };
        if events.is_empty() {
            tracing::debug!(?frame, "unrecognised frame dropped");
        }
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: FrameEvent) -> Result<(), LmError> {
        match event {
            FrameEvent::Content(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                self.begin();
                if self.in_thinking {
                    self.in_thinking = false;
                    self.outbox.push(THINK_CLOSE.to_string());
                }
                self.fragments += 1;
                self.text.push_str(&text);
                self.outbox.push(text);
            }
            FrameEvent::Thinking(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                self.begin();
                if !self.in_thinking {
                    self.in_thinking = true;
                    self.outbox.push(THINK_OPEN.to_string());
                }
                self.fragments += 1;
                self.thinking.push_str(&text);
                self.outbox.push(text);
            }
            FrameEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.begin();
                self.tools
                    .apply(index, id.as_deref(), name.as_deref(), arguments.as_deref());
            }
            FrameEvent::ToolCall(call) => {
                self.begin();
                self.tool_calls.push(call);
            }
            FrameEvent::ToolCallsReady => {
                let calls = self.tools.finalize()?;
                self.tool_calls.extend(calls);
            }
            FrameEvent::ServerStats(stats) => self.server_stats.extend(stats),
            FrameEvent::Done => self.state = DecoderState::Terminated,
        }
        Ok(())
    }

    fn begin(&mut self) {
        if self.state == DecoderState::AwaitFirstFrame {
            self.state = DecoderState::Streaming;
            self.first_frame_pending = true;
        }
    }

    fn into_decoded(mut self) -> Result<DecodedStream, LmError> {
        if !self.tools.is_empty() {
            let calls = self.tools.finalize()?;
            self.tool_calls.extend(calls);
        }
        Ok(DecodedStream {
            text: self.text,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            tool_calls: self.tool_calls,
            server_stats: self.server_stats,
            fragments: self.fragments,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
