//! Re-framing of a Gemini response stream into `OpenAI` streaming chunks.
//!
//! The [`StreamReframer`] is fed raw upstream bytes as they arrive. Each complete
//! Gemini response object becomes one `chat.completion.chunk`; a trailing partial
//! object stays buffered until the next [`feed`](StreamReframer::feed).
//!
//! Usage:
//!   let mut reframer = StreamReframer::new("gemini-1.5-flash", ReframeOptions::default());
//!   for bytes in upstream_chunks {
//!       for frame in reframer.feed(&bytes) {
//!           // send frame.data() as one SSE event
//!       }
//!   }
//!   let done = reframer.finish();

use serde::Serialize;
use std::collections::HashMap;

use super::gemini_types::GenerateContentResponse;
use super::openai_types::{
    ChatCompletionChunk, ChatErrorResponse, ChatToolCallFunction, ChunkChoice, ChunkDelta,
    ChunkToolCall,
};
use super::response::{
    candidate_index, encode_arguments, map_finish_reason, new_completion_id, new_tool_call_id,
    split_parts,
};
use super::scanner::JsonObjectScanner;
use crate::config::StreamConfig;

pub const DONE_SENTINEL: &str = "[DONE]";

/// One SSE message sent to the client.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    Error(ChatErrorResponse),
    Done,
}

impl StreamFrame {
    /// The `data:` payload of this frame.
    pub fn data(&self) -> String {
        match self {
            StreamFrame::Chunk(chunk) => to_json(chunk),
            StreamFrame::Error(err) => to_json(err),
            StreamFrame::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamFrame::Done)
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct ReframeOptions {
    /// Abort once a partial object grows past this many bytes.
    pub max_buffer_bytes: usize,
    /// Emit an error frame for undecodable objects instead of only logging them.
    pub surface_malformed: bool,
}

impl Default for ReframeOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ReframeOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_buffer_bytes: config.max_buffer_bytes,
            surface_malformed: config.surface_malformed,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CandidateState {
    role_sent: bool,
    tool_calls: u32,
}

/// Stateful translator from a Gemini byte stream to `OpenAI` stream frames.
/// One instance per upstream stream, driven by a single consumer.
#[derive(Debug)]
pub struct StreamReframer {
    scanner: JsonObjectScanner,
    options: ReframeOptions,
    model: String,
    id: String,
    created: i64,
    /// Keyed by the candidate's own `index`, not its position in the chunk.
    candidates: HashMap<u32, CandidateState>,
    chunks: usize,
    dropped: usize,
    aborted: bool,
}

impl StreamReframer {
    pub fn new(model: &str, options: ReframeOptions) -> Self {
        Self {
            scanner: JsonObjectScanner::new(),
            options,
            model: model.to_string(),
            id: new_completion_id(),
            created: chrono::Utc::now().timestamp(),
            candidates: HashMap::new(),
            chunks: 0,
            dropped: 0,
            aborted: false,
        }
    }

    /// Frames for an upstream that refused the request before streaming began.
    pub fn upstream_rejected(status: u16, body: &str) -> Vec<StreamFrame> {
        vec![
            StreamFrame::Error(ChatErrorResponse::upstream(status, body)),
            StreamFrame::Done,
        ]
    }

    /// Buffer `bytes` and return a frame for every object they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamFrame> {
        if self.aborted {
            return Vec::new();
        }

        self.scanner.feed(bytes);
        let mut frames = Vec::new();

        while let Some(object) = self.scanner.next_object() {
            match serde_json::from_slice::<serde_json::Value>(&object) {
                Ok(value) if value.get("error").is_some() => {
                    frames.push(StreamFrame::Error(upstream_error_object(&value)));
                }
                Ok(value) => match serde_json::from_value::<GenerateContentResponse>(value) {
                    Ok(resp) => frames.push(StreamFrame::Chunk(self.translate(&resp))),
                    Err(e) => self.malformed(&mut frames, &e, object.len()),
                },
                Err(e) => self.malformed(&mut frames, &e, object.len()),
            }
        }

        if self.scanner.pending_len() > self.options.max_buffer_bytes {
            self.aborted = true;
            tracing::error!(
                pending = self.scanner.pending_len(),
                limit = self.options.max_buffer_bytes,
                "Upstream object exceeds stream buffer limit, aborting stream"
            );
            frames.push(StreamFrame::Error(ChatErrorResponse::new(
                "stream_buffer_overflow",
                format!(
                    "Upstream response object exceeded {} buffered bytes",
                    self.options.max_buffer_bytes
                ),
            )));
        }

        frames
    }

    /// The terminating frame. Bytes of an unfinished object are discarded.
    pub fn finish(&self) -> StreamFrame {
        let pending = self.scanner.pending_len();
        if pending > 0 {
            tracing::warn!(pending, "Upstream stream ended inside an object, discarding tail");
        }
        tracing::debug!(chunks = self.chunks, dropped = self.dropped, "Stream reframed");
        StreamFrame::Done
    }

    /// Whether the buffer limit was hit; later feeds are ignored.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks
    }

    pub fn fragments_dropped(&self) -> usize {
        self.dropped
    }

    fn malformed(&mut self, frames: &mut Vec<StreamFrame>, err: &serde_json::Error, len: usize) {
        self.dropped += 1;
        tracing::warn!(error = %err, bytes = len, "Dropping undecodable upstream fragment");
        if self.options.surface_malformed {
            frames.push(StreamFrame::Error(ChatErrorResponse::new(
                "stream_decode_error",
                format!("Undecodable upstream fragment ({len} bytes): {err}"),
            )));
        }
    }

    fn translate(&mut self, resp: &GenerateContentResponse) -> ChatCompletionChunk {
        let mut choices = Vec::with_capacity(resp.candidates.len());

        for (position, candidate) in resp.candidates.iter().enumerate() {
            let index = candidate_index(position, candidate);
            let state = self.candidates.entry(index).or_default();

            let (text, calls) = split_parts(candidate);
            let tool_calls: Vec<ChunkToolCall> = calls
                .into_iter()
                .map(|(name, args)| {
                    let call_index = state.tool_calls;
                    state.tool_calls += 1;
                    ChunkToolCall {
                        index: call_index,
                        id: new_tool_call_id(),
                        call_type: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: name.to_string(),
                            arguments: encode_arguments(args),
                        },
                    }
                })
                .collect();

            let role = (!state.role_sent).then(|| "assistant".to_string());
            state.role_sent = true;

            let finish_reason = candidate.finish_reason.as_deref().map(|reason| {
                if state.tool_calls > 0 {
                    "tool_calls".to_string()
                } else {
                    map_finish_reason(Some(reason)).to_string()
                }
            });

            choices.push(ChunkChoice {
                index,
                delta: ChunkDelta {
                    role,
                    content: text,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason,
            });
        }

        self.chunks += 1;

        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
        }
    }
}

/// `{"error": {"code", "message", "status"}}` sent by Gemini inside the stream.
fn upstream_error_object(value: &serde_json::Value) -> ChatErrorResponse {
    let error = &value["error"];
    let message = error["message"]
        .as_str()
        .map_or_else(|| value.to_string(), str::to_string);

    let mut converted = ChatErrorResponse::new(
        error["status"].as_str().unwrap_or("upstream_error"),
        message,
    );
    converted.error.code = error.get("code").cloned();
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_object(text: &str, finish: Option<&str>) -> String {
        let mut candidate = json!({
            "content": {"role": "model", "parts": [{"text": text}]}
        });
        if let Some(reason) = finish {
            candidate["finishReason"] = json!(reason);
        }
        json!({"candidates": [candidate]}).to_string()
    }

    fn chunks(frames: &[StreamFrame]) -> Vec<&ChatCompletionChunk> {
        frames
            .iter()
            .filter_map(|f| match f {
                StreamFrame::Chunk(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_simple_text_stream() {
        let mut reframer = StreamReframer::new("gemini-1.5-flash", ReframeOptions::default());
        let body = format!(
            "[{},\r\n{}]",
            text_object("Hello", None),
            text_object(" world", Some("STOP"))
        );

        let frames = reframer.feed(body.as_bytes());
        let chunks = chunks(&frames);
        assert_eq!(chunks.len(), 2);

        assert_eq!(chunks[0].object, "chat.completion.chunk");
        assert_eq!(chunks[0].model, "gemini-1.5-flash");
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hello"));
        assert_eq!(chunks[0].choices[0].finish_reason, None);

        assert_eq!(chunks[1].choices[0].delta.role, None);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some(" world"));
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[0].id, chunks[1].id);

        assert!(reframer.finish().is_done());
    }

    #[test]
    fn test_choices_follow_candidate_index() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let first = json!({"candidates": [
            {"content": {"parts": [{"text": "a0"}]}, "index": 0},
            {"content": {"parts": [{"text": "b0"}]}, "index": 1}
        ]});
        let second = json!({"candidates": [
            {"content": {"parts": [
                {"text": "b1"},
                {"functionCall": {"name": "lookup", "args": {}}}
            ]}, "finishReason": "STOP", "index": 1}
        ]});
        let third = json!({"candidates": [
            {"content": {"parts": [{"text": "a1"}]}, "finishReason": "STOP", "index": 0}
        ]});
        let body = format!("[{first},{second},{third}]");

        let frames = reframer.feed(body.as_bytes());
        let chunks = chunks(&frames);
        assert_eq!(chunks.len(), 3);

        let only = &chunks[1].choices;
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].index, 1);
        assert_eq!(only[0].delta.content.as_deref(), Some("b1"));
        assert_eq!(only[0].delta.role, None);
        assert_eq!(only[0].finish_reason.as_deref(), Some("tool_calls"));

        // Candidate 0 is untouched by candidate 1's tool call.
        let last = &chunks[2].choices[0];
        assert_eq!(last.index, 0);
        assert_eq!(last.delta.role, None);
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_max_tokens_maps_to_length() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let frames = reframer.feed(text_object("cut", Some("MAX_TOKENS")).as_bytes());
        assert_eq!(chunks(&frames)[0].choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_tool_call_stream() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let object = json!({"candidates": [{
            "content": {"role": "model", "parts": [
                {"functionCall": {"name": "search", "args": {"q": "rust"}}},
                {"functionCall": {"name": "fetch", "args": {"url": "x"}}}
            ]},
            "finishReason": "STOP"
        }]});

        let frames = reframer.feed(object.to_string().as_bytes());
        let chunk = chunks(&frames)[0];
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[1].index, 1);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_incomplete_object_yields_nothing_until_completed() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let object = text_object("partial {", None);
        let (head, tail) = object.split_at(object.len() - 3);

        assert!(reframer.feed(b"[").is_empty());
        assert!(reframer.feed(head.as_bytes()).is_empty());
        let frames = reframer.feed(tail.as_bytes());
        assert_eq!(chunks(&frames).len(), 1);
        assert_eq!(
            chunks(&frames)[0].choices[0].delta.content.as_deref(),
            Some("partial {")
        );
    }

    #[test]
    fn test_malformed_fragment_dropped_by_default() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let body = format!("[{{\"candidates\": }},{}]", text_object("ok", None));

        let frames = reframer.feed(body.as_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(chunks(&frames)[0].choices[0].delta.content.as_deref(), Some("ok"));
        assert_eq!(reframer.fragments_dropped(), 1);
    }

    #[test]
    fn test_malformed_fragment_surfaced_when_enabled() {
        let options = ReframeOptions {
            surface_malformed: true,
            ..ReframeOptions::default()
        };
        let mut reframer = StreamReframer::new("m", options);
        let body = format!("[{{\"candidates\": }},{}]", text_object("ok", None));

        let frames = reframer.feed(body.as_bytes());
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            StreamFrame::Error(err) => {
                assert_eq!(err.error.error_type.as_deref(), Some("stream_decode_error"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(matches!(frames[1], StreamFrame::Chunk(_)));
    }

    #[test]
    fn test_buffer_limit_aborts_stream() {
        let options = ReframeOptions {
            max_buffer_bytes: 16,
            surface_malformed: false,
        };
        let mut reframer = StreamReframer::new("m", options);

        let frames = reframer.feed(br#"[{"candidates": [{"content": {"parts": [{"text": "#);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], StreamFrame::Error(_)));
        assert!(reframer.is_aborted());
        assert!(reframer.feed(b"\"x\"}]}}]}]").is_empty());
    }

    #[test]
    fn test_upstream_error_object_in_stream() {
        let mut reframer = StreamReframer::new("m", ReframeOptions::default());
        let body = r#"[{"error": {"code": 429, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED"}}]"#;

        let frames = reframer.feed(body.as_bytes());
        match &frames[0] {
            StreamFrame::Error(err) => {
                assert_eq!(err.error.message, "Resource exhausted");
                assert_eq!(err.error.code, Some(json!(429)));
                assert_eq!(err.error.error_type.as_deref(), Some("RESOURCE_EXHAUSTED"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_upstream_rejected_frames() {
        let frames = StreamReframer::upstream_rejected(400, "{\"error\":\"bad\"}");
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].data(),
            "{\"error\":{\"message\":\"{\\\"error\\\":\\\"bad\\\"}\",\"code\":400}}"
        );
        assert_eq!(frames[1].data(), "[DONE]");
    }
}
