use serde::{Deserialize, Serialize};

use trellis_types::{ResponseMeta, ToolCall};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One streamed `chat.completion.chunk` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Tool-call entry inside a streamed delta. `output` carries a locally
/// executed tool's result so the client can relay it back without a round
/// trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallDeltaFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallDeltaFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCallDelta {
    pub fn from_call(call: &ToolCall) -> Self {
        Self {
            index: 0,
            id: call.id.clone(),
            kind: call.kind.clone(),
            function: ToolCallDeltaFunction {
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            },
            output: None,
        }
    }
}

impl ChatCompletionChunk {
    pub fn new(meta: &ResponseMeta, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn content(meta: &ResponseMeta, text: impl Into<String>) -> Self {
        Self::new(
            meta,
            Delta {
                content: Some(text.into()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn terminal(meta: &ResponseMeta, finish_reason: &str) -> Self {
        Self::new(meta, Delta::default(), Some(finish_reason.to_string()))
    }

    /// Renders this chunk as one SSE frame.
    pub fn frame(&self) -> String {
        // Serialization of these plain shapes cannot fail.
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("data: {body}\n\n")
    }
}

/// Non-streamed `chat.completion` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantTurn,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantTurn {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatCompletion {
    pub fn text(meta: &ResponseMeta, content: String, reasoning: Option<String>) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion".to_string(),
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantTurn {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: reasoning,
                    tool_calls: None,
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(data: Vec<ModelEntry>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ResponseMeta {
        ResponseMeta {
            id: "resp-1".to_string(),
            created: 123,
            model: "auto".to_string(),
        }
    }

    #[test]
    fn empty_delta_serializes_as_empty_object() {
        let chunk = ChatCompletionChunk::terminal(&meta(), "stop");
        let body = serde_json::to_string(&chunk).unwrap();
        assert!(body.contains("\"delta\":{}"));
        assert!(body.contains("\"finish_reason\":\"stop\""));
    }

    #[test]
    fn frame_wraps_body_in_sse_framing() {
        let frame = ChatCompletionChunk::content(&meta(), "hi").frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains("\"object\":\"chat.completion.chunk\""));
    }

    #[test]
    fn tool_call_delta_echoes_call_fields() {
        let call = ToolCall::new("call_9", "read", "{\"path\":\"a.txt\"}".to_string());
        let delta = ToolCallDelta::from_call(&call);
        assert_eq!(delta.id, "call_9");
        assert_eq!(delta.function.name, "read");
        assert_eq!(delta.function.arguments, "{\"path\":\"a.txt\"}");
    }
}
