use std::collections::HashSet;

use serde_json::{Map, Value};

use trellis_types::{ResponseMeta, ToolCall, ToolCallEvent, ToolDeclaration};
use trellis_wire::{
    AssistantTurn, ChatCompletion, ChatCompletionChunk, CompletionChoice, Delta, ToolCallDelta,
};

/// Agent-specific verbs mapped to the canonical tool vocabulary. Keys are
/// lowercased with punctuation stripped; lookup happens after a `ToolCall`
/// suffix has been removed from the raw identifier.
const TOOL_NAME_ALIASES: &[(&str, &str)] = &[
    ("executecommand", "bash"),
    ("runcommand", "bash"),
    ("shell", "bash"),
    ("createdirectory", "mkdir"),
    ("deletefile", "rm"),
    ("findfiles", "glob"),
    ("updatetodos", "todowrite"),
    ("delegatetask", "task"),
    ("runskill", "skill"),
    ("callomoagent", "call_omo_agent"),
    ("skillmcp", "skill_mcp"),
];

/// The extractor's verdict for one upstream tool-call event. Exactly one
/// variant per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Intercept(ToolCall),
    Passthrough { name: String },
    Skip { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoAllowedTools,
    NoName,
    EventSkipped,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoAllowedTools => "no_allowed_tools",
            SkipReason::NoName => "no_name",
            SkipReason::EventSkipped => "event_skipped",
        }
    }
}

/// Collects every declared tool name from the request's `tools` array.
pub fn allowed_tool_names(tools: &[ToolDeclaration]) -> HashSet<String> {
    tools
        .iter()
        .filter_map(|tool| tool.tool_name())
        .map(str::to_string)
        .collect()
}

/// Resolves a raw upstream identifier into the canonical tool name.
pub fn canonical_tool_name(raw: &str) -> String {
    let stripped = raw.strip_suffix("ToolCall").unwrap_or(raw);
    let token = alias_token(stripped);
    for (alias, canonical) in TOOL_NAME_ALIASES {
        if *alias == token {
            return (*canonical).to_string();
        }
    }
    stripped.to_string()
}

fn alias_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Decides intercept / passthrough / skip for one tool-call event. Pure
/// function of its inputs.
pub fn extract_tool_call(event: &ToolCallEvent, allowed: &HashSet<String>) -> Extraction {
    if allowed.is_empty() {
        return Extraction::Skip {
            reason: SkipReason::NoAllowedTools,
        };
    }

    let raw_name = event
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .or_else(|| event.tool_call.keys().next().map(String::as_str));
    let Some(raw_name) = raw_name else {
        return Extraction::Skip {
            reason: SkipReason::NoName,
        };
    };

    let canonical = canonical_tool_name(raw_name);
    if !allowed.contains(&canonical) {
        return Extraction::Passthrough {
            name: raw_name.to_string(),
        };
    }

    let payload = event
        .tool_call
        .get(raw_name)
        .or_else(|| event.tool_call.values().next());
    let args = match extract_arguments(payload) {
        Some(args) => args,
        None => {
            return Extraction::Skip {
                reason: SkipReason::EventSkipped,
            }
        }
    };

    let id = event
        .call_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(ToolCall::generated_id);

    let arguments = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
    Extraction::Intercept(ToolCall::new(id, canonical, arguments))
}

/// `args` sub-object when present, otherwise the flat-payload convention:
/// every sibling key except `result`. Payloads carrying only a `result` are
/// completion echoes and yield `None`.
fn extract_arguments(payload: Option<&Value>) -> Option<Map<String, Value>> {
    let Some(payload) = payload.and_then(|v| v.as_object()) else {
        return Some(Map::new());
    };

    if let Some(args) = payload.get("args") {
        return match args {
            Value::Object(map) => Some(map.clone()),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                Some(map)
            }
        };
    }

    let mut flat = Map::new();
    for (key, value) in payload {
        if key != "result" {
            flat.insert(key.clone(), value.clone());
        }
    }
    if flat.is_empty() && payload.contains_key("result") {
        return None;
    }
    Some(flat)
}

/// Non-streamed reply announcing an intercepted call to the client.
pub fn tool_call_completion_response(meta: &ResponseMeta, call: &ToolCall) -> ChatCompletion {
    ChatCompletion {
        id: meta.id.clone(),
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantTurn {
                role: "assistant".to_string(),
                content: String::new(),
                reasoning_content: None,
                tool_calls: Some(vec![call.clone()]),
            },
            finish_reason: "tool_calls".to_string(),
        }],
    }
}

/// Streamed reply announcing an intercepted call: one delta chunk carrying
/// the call, then the terminal `tool_calls` chunk.
pub fn tool_call_stream_chunks(meta: &ResponseMeta, call: &ToolCall) -> Vec<ChatCompletionChunk> {
    vec![
        ChatCompletionChunk::new(
            meta,
            Delta {
                role: Some("assistant".to_string()),
                tool_calls: Some(vec![ToolCallDelta::from_call(call)]),
                ..Delta::default()
            },
            None,
        ),
        ChatCompletionChunk::terminal(meta, "tool_calls"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_call_event(value: Value) -> ToolCallEvent {
        serde_json::from_value(value).expect("tool call event")
    }

    fn allowed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn expect_intercept(extraction: Extraction) -> ToolCall {
        match extraction {
            Extraction::Intercept(call) => call,
            other => panic!("expected intercept, got {other:?}"),
        }
    }

    #[test]
    fn extracts_allowed_names_from_tools_array() {
        let tools: Vec<ToolDeclaration> = serde_json::from_value(json!([
            { "type": "function", "function": { "name": "oc_read", "parameters": {} } },
            { "function": { "name": "oc_write" } },
            { "name": "oc_misc" },
            {},
        ]))
        .unwrap();
        let names = allowed_tool_names(&tools);
        assert!(names.contains("oc_read"));
        assert!(names.contains("oc_write"));
        assert!(names.contains("oc_misc"));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn extracts_allowed_tool_call_with_args_object() {
        let event = tool_call_event(json!({
            "call_id": "call_1",
            "name": "oc_read",
            "tool_call": { "oc_read": { "args": { "path": "/tmp/hello.txt" } } },
        }));
        let call = expect_intercept(extract_tool_call(&event, &allowed(&["oc_read"])));
        assert_eq!(call.id, "call_1");
        assert_eq!(call.function.name, "oc_read");
        assert_eq!(call.function.arguments, "{\"path\":\"/tmp/hello.txt\"}");
    }

    #[test]
    fn normalizes_tool_call_suffixed_names() {
        let event = tool_call_event(json!({
            "call_id": "call_2",
            "tool_call": { "readToolCall": { "args": { "path": "foo.txt" } } },
        }));
        let call = expect_intercept(extract_tool_call(&event, &allowed(&["read"])));
        assert_eq!(call.function.name, "read");
        assert_eq!(call.function.arguments, "{\"path\":\"foo.txt\"}");
    }

    #[test]
    fn extracts_flat_payload_without_args_wrapper() {
        let event = tool_call_event(json!({
            "call_id": "call_flat",
            "tool_call": { "editToolCall": { "path": "test.md", "streamContent": "hello" } },
        }));
        let call = expect_intercept(extract_tool_call(&event, &allowed(&["edit"])));
        assert_eq!(call.function.name, "edit");
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["path"], "test.md");
        assert_eq!(args["streamContent"], "hello");
    }

    #[test]
    fn skips_result_only_payloads() {
        let event = tool_call_event(json!({
            "call_id": "call_completed",
            "subtype": "completed",
            "tool_call": { "editToolCall": { "result": { "success": true } } },
        }));
        assert_eq!(
            extract_tool_call(&event, &allowed(&["edit"])),
            Extraction::Skip {
                reason: SkipReason::EventSkipped
            }
        );
    }

    #[test]
    fn passes_through_unrecognized_tools_with_raw_name() {
        let event = tool_call_event(json!({
            "call_id": "call_3",
            "name": "browser_navigate",
            "tool_call": { "browser_navigate": { "args": { "url": "https://example.com" } } },
        }));
        assert_eq!(
            extract_tool_call(&event, &allowed(&["bash", "read"])),
            Extraction::Passthrough {
                name: "browser_navigate".to_string()
            }
        );
    }

    #[test]
    fn skips_when_no_tools_are_allowed() {
        let event = tool_call_event(json!({
            "call_id": "c",
            "tool_call": { "bash": { "args": { "command": "ls" } } },
        }));
        assert_eq!(
            extract_tool_call(&event, &HashSet::new()),
            Extraction::Skip {
                reason: SkipReason::NoAllowedTools
            }
        );
    }

    #[test]
    fn skips_when_no_name_can_be_derived() {
        let event = tool_call_event(json!({ "tool_call": {} }));
        assert_eq!(
            extract_tool_call(&event, &allowed(&["bash"])),
            Extraction::Skip {
                reason: SkipReason::NoName
            }
        );
    }

    #[test]
    fn resolves_command_aliases_to_bash() {
        for raw in ["executeCommand", "runcommand", "shell"] {
            let event = tool_call_event(json!({
                "call_id": "c",
                "name": raw,
                "tool_call": { raw: { "args": { "command": "pwd" } } },
            }));
            let call = expect_intercept(extract_tool_call(&event, &allowed(&["bash"])));
            assert_eq!(call.function.name, "bash", "alias {raw}");
        }
    }

    #[test]
    fn resolves_remaining_alias_table_entries() {
        let cases = [
            ("createDirectory", "mkdir"),
            ("deleteFile", "rm"),
            ("findFiles", "glob"),
            ("updateTodos", "todowrite"),
            ("delegateTask", "task"),
            ("runSkill", "skill"),
            ("callOmoAgent", "call_omo_agent"),
            ("skillMcp", "skill_mcp"),
        ];
        for (raw, canonical) in cases {
            let event = tool_call_event(json!({
                "call_id": "c",
                "name": raw,
                "tool_call": { raw: { "args": {} } },
            }));
            let call = expect_intercept(extract_tool_call(&event, &allowed(&[canonical])));
            assert_eq!(call.function.name, canonical, "alias {raw}");
        }
    }

    #[test]
    fn synthesizes_an_id_when_call_id_is_absent() {
        let event = tool_call_event(json!({
            "tool_call": { "readToolCall": { "args": { "path": "a" } } },
        }));
        let call = expect_intercept(extract_tool_call(&event, &allowed(&["read"])));
        assert!(call.id.starts_with("call_"));
        assert!(!call.id.trim_start_matches("call_").is_empty());
    }

    #[test]
    fn builds_non_stream_tool_call_response() {
        let meta = ResponseMeta {
            id: "resp-1".to_string(),
            created: 123,
            model: "trellis/auto".to_string(),
        };
        let call = ToolCall::new("call_9", "oc_read", "{\"path\":\"a.txt\"}".to_string());
        let response = tool_call_completion_response(&meta, &call);
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.choices[0].finish_reason, "tool_calls");
        assert_eq!(response.choices[0].message.role, "assistant");
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "oc_read");
    }

    #[test]
    fn builds_stream_chunks_with_tool_calls_finish_reason() {
        let meta = ResponseMeta {
            id: "resp-2".to_string(),
            created: 456,
            model: "trellis/auto".to_string(),
        };
        let call = ToolCall::new(
            "call_10",
            "oc_write",
            "{\"path\":\"b.txt\",\"content\":\"x\"}".to_string(),
        );
        let chunks = tool_call_stream_chunks(&meta, &call);
        assert_eq!(chunks.len(), 2);
        let first = chunks[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(first[0].function.name, "oc_write");
        assert_eq!(chunks[0].choices[0].finish_reason, None);
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }
}
