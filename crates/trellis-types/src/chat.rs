use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical OpenAI-style tool call. Arguments stay serialized JSON text so
/// the record survives transport unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: String) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn generated_id() -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }
}

/// One prior conversation message as the client sends it. Only the fields
/// the pipeline reads are modeled; everything else is ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// One entry of the request's `tools` array. Accepts both the nested
/// `{function: {name, parameters}}` and the bare `{name}` conventions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolDeclaration {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunctionDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolFunctionDeclaration {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDeclaration {
    pub fn tool_name(&self) -> Option<&str> {
        if let Some(function) = &self.function {
            let name = function.name.trim();
            if !name.is_empty() {
                return Some(name);
            }
        }
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }

    pub fn tool_parameters(&self) -> Option<&Value> {
        if let Some(function) = &self.function {
            if let Some(parameters) = &function.parameters {
                return Some(parameters);
            }
        }
        self.parameters.as_ref()
    }
}

/// Identity of one chat-completion response; a converter or router holds
/// exactly one of these for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub id: String,
    pub created: u64,
    pub model: String,
}

/// Session-facing progress record produced by an event mapper for events
/// that were not intercepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolUpdate {
    pub tool_call_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_declaration_prefers_function_name() {
        let decl: ToolDeclaration = serde_json::from_value(json!({
            "type": "function",
            "function": { "name": "read", "parameters": { "type": "object" } },
            "name": "legacy_read",
        }))
        .unwrap();
        assert_eq!(decl.tool_name(), Some("read"));
        assert!(decl.tool_parameters().is_some());
    }

    #[test]
    fn tool_declaration_accepts_bare_name() {
        let decl: ToolDeclaration = serde_json::from_value(json!({ "name": "grep" })).unwrap();
        assert_eq!(decl.tool_name(), Some("grep"));
        assert_eq!(decl.tool_parameters(), None);
    }

    #[test]
    fn chat_message_decodes_tool_result_shape() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "tool",
            "tool_call_id": "call_1",
            "content": "not found",
        }))
        .unwrap();
        assert_eq!(message.role, "tool");
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
    }
}
