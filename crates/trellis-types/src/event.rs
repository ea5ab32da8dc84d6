use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One parsed line of the agent's stream-json output. Unknown or
/// partially-shaped events collapse to `Unrecognized` instead of failing,
/// so a single odd line never aborts a stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ToolCall(ToolCallEvent),
    Assistant(AssistantEvent),
    Thinking(ThinkingEvent),
    Result(ResultEvent),
    Unrecognized(Value),
}

impl AgentEvent {
    pub fn from_value(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match kind {
            "tool_call" => match serde_json::from_value::<ToolCallEvent>(value.clone()) {
                Ok(event) => AgentEvent::ToolCall(event),
                Err(_) => AgentEvent::Unrecognized(value),
            },
            "assistant" => match serde_json::from_value::<AssistantEvent>(value.clone()) {
                Ok(event) => AgentEvent::Assistant(event),
                Err(_) => AgentEvent::Unrecognized(value),
            },
            "thinking" => match serde_json::from_value::<ThinkingEvent>(value.clone()) {
                Ok(event) => AgentEvent::Thinking(event),
                Err(_) => AgentEvent::Unrecognized(value),
            },
            "result" => match serde_json::from_value::<ResultEvent>(value.clone()) {
                Ok(event) => AgentEvent::Result(event),
                Err(_) => AgentEvent::Unrecognized(value),
            },
            _ => AgentEvent::Unrecognized(value),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentEvent::ToolCall(event) => event.session_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEvent {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_call: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantEvent {
    #[serde(default)]
    pub message: Option<AssistantMessage>,
    /// Present only on incremental (partial) output; final accumulated
    /// messages omit it and must not be re-emitted as deltas.
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
}

impl AssistantEvent {
    /// Text fragments carried by this event, in payload order.
    pub fn text_parts(&self) -> Vec<&str> {
        let Some(message) = &self.message else {
            return Vec::new();
        };
        let Some(parts) = message.content.as_array() else {
            return Vec::new();
        };
        parts
            .iter()
            .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
            .filter(|text| !text.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ThinkingEvent {
    pub fn delta_text(&self) -> Option<&str> {
        if self.subtype.as_deref() != Some("delta") {
            return None;
        }
        self.text.as_deref().filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub result: Option<Value>,
}

impl ResultEvent {
    pub fn text(&self) -> Option<&str> {
        self.result.as_ref().and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_call_event() {
        let event = AgentEvent::from_value(json!({
            "type": "tool_call",
            "call_id": "call_1",
            "tool_call": { "readToolCall": { "args": { "path": "foo.txt" } } },
        }));
        match event {
            AgentEvent::ToolCall(event) => {
                assert_eq!(event.call_id.as_deref(), Some("call_1"));
                assert!(event.tool_call.contains_key("readToolCall"));
            }
            other => panic!("expected tool_call event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_becomes_unrecognized() {
        let event = AgentEvent::from_value(json!({ "type": "telemetry", "x": 1 }));
        assert!(matches!(event, AgentEvent::Unrecognized(_)));
    }

    #[test]
    fn assistant_text_parts_skip_non_text_content() {
        let event = AgentEvent::from_value(json!({
            "type": "assistant",
            "timestamp_ms": 17,
            "message": { "content": [
                { "type": "text", "text": "hello" },
                { "type": "image", "url": "x" },
                { "type": "text", "text": "" },
            ]},
        }));
        let AgentEvent::Assistant(event) = event else {
            panic!("expected assistant event");
        };
        assert_eq!(event.text_parts(), vec!["hello"]);
    }

    #[test]
    fn thinking_delta_requires_subtype() {
        let full = ThinkingEvent {
            subtype: None,
            text: Some("hmm".to_string()),
        };
        assert_eq!(full.delta_text(), None);
        let delta = ThinkingEvent {
            subtype: Some("delta".to_string()),
            text: Some("hmm".to_string()),
        };
        assert_eq!(delta.delta_text(), Some("hmm"));
    }
}
