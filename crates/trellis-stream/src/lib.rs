use serde_json::{Map, Value};
use tracing::trace;

use trellis_types::{AgentEvent, ResponseMeta, ToolCall, ToolCallEvent};
use trellis_wire::{ChatCompletion, ChatCompletionChunk, Delta, ToolCallDelta, DONE_FRAME};

/// Parses one line of the agent's stream-json output. Blank or malformed
/// lines yield `None`; partial writes must never abort the stream.
pub fn parse_stream_line(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(AgentEvent::from_value(value)),
        Err(_) => {
            trace!(len = line.len(), "dropped non-json stream line");
            None
        }
    }
}

/// Turns agent events into `chat.completion.chunk` bodies for one response.
/// Bound to a single `id`/`created`/`model` triple for its lifetime.
pub struct SseConverter {
    meta: ResponseMeta,
    role_opened: bool,
}

impl SseConverter {
    pub fn new(meta: ResponseMeta) -> Self {
        Self {
            meta,
            role_opened: false,
        }
    }

    pub fn handle_event(&mut self, event: &AgentEvent) -> Vec<ChatCompletionChunk> {
        match event {
            AgentEvent::Thinking(thinking) => {
                let Some(text) = thinking.delta_text() else {
                    return Vec::new();
                };
                vec![self.chunk(Delta {
                    reasoning_content: Some(text.to_string()),
                    ..Delta::default()
                })]
            }
            AgentEvent::Assistant(assistant) => {
                // Final accumulated messages omit timestamp_ms and were
                // already streamed piecewise.
                if assistant.timestamp_ms.is_none() {
                    return Vec::new();
                }
                assistant
                    .text_parts()
                    .into_iter()
                    .map(|text| {
                        self.chunk(Delta {
                            content: Some(text.to_string()),
                            ..Delta::default()
                        })
                    })
                    .collect()
            }
            AgentEvent::ToolCall(tool_call) => self.passthrough_tool_call(tool_call),
            AgentEvent::Result(_) | AgentEvent::Unrecognized(_) => Vec::new(),
        }
    }

    /// Terminal empty-delta chunk plus the `[DONE]` sentinel, rendered as
    /// SSE frames.
    pub fn finish(&mut self, finish_reason: &str) -> Vec<String> {
        vec![
            ChatCompletionChunk::terminal(&self.meta, finish_reason).frame(),
            DONE_FRAME.to_string(),
        ]
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    /// Forwards a non-intercepted tool call to the client unmodified, under
    /// its raw upstream name.
    fn passthrough_tool_call(&mut self, event: &ToolCallEvent) -> Vec<ChatCompletionChunk> {
        let Some(raw_name) = event
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or_else(|| event.tool_call.keys().next().map(String::as_str))
        else {
            return Vec::new();
        };

        let payload = event
            .tool_call
            .get(raw_name)
            .or_else(|| event.tool_call.values().next());
        let Some(args) = passthrough_arguments(payload) else {
            return Vec::new();
        };

        let id = event
            .call_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(ToolCall::generated_id);
        let arguments = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
        let call = ToolCall::new(id, raw_name, arguments);

        vec![self.chunk(Delta {
            tool_calls: Some(vec![ToolCallDelta::from_call(&call)]),
            ..Delta::default()
        })]
    }

    fn chunk(&mut self, mut delta: Delta) -> ChatCompletionChunk {
        // Every stream opens with exactly one role-bearing chunk, on
        // whichever channel emits first. Streams with no reasoning phase
        // still get the role on their first content delta.
        if !self.role_opened {
            self.role_opened = true;
            delta.role = Some("assistant".to_string());
        }
        ChatCompletionChunk::new(&self.meta, delta, None)
    }
}

fn passthrough_arguments(payload: Option<&Value>) -> Option<Map<String, Value>> {
    let Some(payload) = payload.and_then(|v| v.as_object()) else {
        return Some(Map::new());
    };
    if let Some(Value::Object(args)) = payload.get("args") {
        return Some(args.clone());
    }
    let mut flat = Map::new();
    for (key, value) in payload {
        if key != "result" {
            flat.insert(key.clone(), value.clone());
        }
    }
    // Result-only payloads are completion echoes, not new calls.
    if flat.is_empty() && payload.contains_key("result") {
        return None;
    }
    Some(flat)
}

/// Collects one full turn for the non-streamed response shape. The final
/// `result` event is authoritative when present; otherwise the accumulated
/// partial deltas stand.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    reasoning: String,
    content: String,
    result: Option<String>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Thinking(thinking) => {
                if let Some(text) = thinking.delta_text() {
                    self.reasoning.push_str(text);
                }
            }
            AgentEvent::Assistant(assistant) => {
                if assistant.timestamp_ms.is_some() {
                    for text in assistant.text_parts() {
                        self.content.push_str(text);
                    }
                }
            }
            AgentEvent::Result(result) => {
                if let Some(text) = result.text() {
                    self.result = Some(text.to_string());
                }
            }
            AgentEvent::ToolCall(_) | AgentEvent::Unrecognized(_) => {}
        }
    }

    pub fn content(&self) -> &str {
        match &self.result {
            Some(result) if !result.is_empty() => result,
            _ => &self.content,
        }
    }

    pub fn reasoning(&self) -> Option<&str> {
        if self.reasoning.is_empty() {
            None
        } else {
            Some(&self.reasoning)
        }
    }

    pub fn into_completion(self, meta: &ResponseMeta) -> ChatCompletion {
        let reasoning = self.reasoning().map(str::to_string);
        let content = self.content().to_string();
        ChatCompletion::text(meta, content, reasoning)
    }
}
