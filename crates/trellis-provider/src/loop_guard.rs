use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use trellis_types::{ChatMessage, ToolCall};

pub const DEFAULT_MAX_REPEAT: u32 = 3;

/// Coarse classification of a tool result, derived from its rendered text.
/// The cue lists and their precedence are a compatibility surface; see the
/// ordered checks in `classify_tool_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Permission,
    Timeout,
    ToolError,
    Success,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Permission => "permission",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ToolError => "tool_error",
            ErrorClass::Success => "success",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub fingerprint: String,
    pub repeat_count: u32,
    pub max_repeat: u32,
    pub error_class: ErrorClass,
    pub triggered: bool,
    pub tracked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxRepeat {
    pub value: u32,
    pub valid: bool,
}

/// Parses the max-repeat setting. Anything non-numeric, zero, or negative
/// degrades to the default and is flagged invalid so the caller can log a
/// configuration warning instead of failing the request.
pub fn parse_max_repeat(raw: Option<&str>) -> MaxRepeat {
    let Some(raw) = raw else {
        return MaxRepeat {
            value: DEFAULT_MAX_REPEAT,
            valid: true,
        };
    };
    match raw.trim().parse::<f64>() {
        Ok(parsed) if parsed.is_finite() && parsed >= 1.0 => MaxRepeat {
            value: parsed.floor() as u32,
            valid: true,
        },
        _ => MaxRepeat {
            value: DEFAULT_MAX_REPEAT,
            valid: false,
        },
    }
}

/// Detects a tool being called repeatedly with the same argument structure
/// while failing the same way. One instance per conversation; never shared
/// across sessions.
#[derive(Debug)]
pub struct ToolLoopGuard {
    by_call_id: HashMap<String, ErrorClass>,
    latest: Option<ErrorClass>,
    counts: HashMap<String, u32>,
    max_repeat: u32,
}

impl ToolLoopGuard {
    /// Seeds guard state from the conversation so far: result classes per
    /// call id, the most recent class, and repeat counters for every prior
    /// assistant call whose outcome was not a success.
    pub fn from_history(messages: &[ChatMessage], max_repeat: u32) -> Self {
        let mut by_call_id = HashMap::new();
        let mut latest = None;
        for message in messages {
            if message.role != "tool" {
                continue;
            }
            let class = classify_tool_result(&message.content);
            latest = Some(class);
            if let Some(call_id) = message
                .tool_call_id
                .as_deref()
                .filter(|id| !id.is_empty())
            {
                by_call_id.insert(call_id.to_string(), class);
            }
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        for (id, name, shape) in assistant_tool_calls(messages) {
            let class = by_call_id
                .get(&id)
                .copied()
                .or(latest)
                .unwrap_or(ErrorClass::Unknown);
            if class == ErrorClass::Success {
                continue;
            }
            let fingerprint = format!("{name}|{shape}|{class}");
            *counts.entry(fingerprint).or_insert(0) += 1;
        }

        Self {
            by_call_id,
            latest,
            counts,
            max_repeat,
        }
    }

    /// Counts this call against its fingerprint. Successful calls are never
    /// tracked and never touch any counter.
    pub fn evaluate(&mut self, call: &ToolCall) -> GuardDecision {
        let error_class = self
            .by_call_id
            .get(&call.id)
            .copied()
            .or(self.latest)
            .unwrap_or(ErrorClass::Unknown);
        let shape = derive_argument_shape(&call.function.arguments);
        let fingerprint = format!("{}|{shape}|{error_class}", call.function.name);

        if error_class == ErrorClass::Success {
            return GuardDecision {
                fingerprint,
                repeat_count: 0,
                max_repeat: self.max_repeat,
                error_class,
                triggered: false,
                tracked: false,
            };
        }

        let repeat_count = self
            .counts
            .entry(fingerprint.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
        GuardDecision {
            triggered: *repeat_count > self.max_repeat,
            repeat_count: *repeat_count,
            max_repeat: self.max_repeat,
            error_class,
            tracked: true,
            fingerprint,
        }
    }

    /// Forgives a fingerprint by deleting its counter. The only way a
    /// counter ever decreases.
    pub fn reset_fingerprint(&mut self, fingerprint: &str) {
        self.counts.remove(fingerprint);
    }

    pub fn max_repeat(&self) -> u32 {
        self.max_repeat
    }
}

fn assistant_tool_calls(messages: &[ChatMessage]) -> Vec<(String, String, String)> {
    let mut calls = Vec::new();
    for message in messages {
        if message.role != "assistant" {
            continue;
        }
        let Some(tool_calls) = &message.tool_calls else {
            continue;
        };
        for call in tool_calls {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if id.is_empty() || name.is_empty() {
                continue;
            }
            let raw_arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            calls.push((
                id.to_string(),
                name.to_string(),
                derive_argument_shape(&raw_arguments),
            ));
        }
    }
    calls
}

/// Value-erased structural summary of an argument payload: scalars become
/// their JSON type names, arrays keep only their first element's shape,
/// object keys are sorted. Malformed JSON collapses to `invalid_json`.
pub fn derive_argument_shape(raw_arguments: &str) -> String {
    match serde_json::from_str::<Value>(raw_arguments) {
        Ok(parsed) => shape_of(&parsed).to_string(),
        Err(_) => "invalid_json".to_string(),
    }
}

fn shape_of(value: &Value) -> Value {
    match value {
        Value::Array(items) => match items.first() {
            Some(first) => Value::Array(vec![shape_of(first)]),
            None => Value::Array(vec![Value::String("empty".to_string())]),
        },
        Value::Object(map) => {
            // serde_json's default map is ordered by key, which makes the
            // rendered shape deterministic.
            let shaped = map
                .iter()
                .map(|(key, value)| (key.clone(), shape_of(value)))
                .collect();
            Value::Object(shaped)
        }
        Value::Null => Value::String("null".to_string()),
        Value::Bool(_) => Value::String("boolean".to_string()),
        Value::Number(_) => Value::String("number".to_string()),
        Value::String(_) => Value::String("string".to_string()),
    }
}

/// Ordered substring heuristics over the rendered result text. Precedence:
/// validation > not_found > permission > timeout > success > tool_error.
pub fn classify_tool_result(content: &Value) -> ErrorClass {
    let text = render_content(content).trim().to_lowercase();
    if text.is_empty() {
        return ErrorClass::Unknown;
    }

    const VALIDATION: &[&str] = &[
        "missing required",
        "missing",
        "invalid",
        "schema",
        "unexpected",
        "type error",
    ];
    const NOT_FOUND: &[&str] = &["enoent", "not found", "no such file"];
    const PERMISSION: &[&str] = &["permission denied", "eacces", "forbidden"];
    const TIMEOUT: &[&str] = &["timeout", "timed out"];
    const SUCCESS: &[&str] = &["success", "completed", "\"ok\":true", "\"success\":true"];
    const TOOL_ERROR: &[&str] = &["error", "failed", "\"is_error\":true", "\"success\":false"];

    if contains_any(&text, VALIDATION) {
        ErrorClass::Validation
    } else if contains_any(&text, NOT_FOUND) {
        ErrorClass::NotFound
    } else if contains_any(&text, PERMISSION) {
        ErrorClass::Permission
    } else if contains_any(&text, TIMEOUT) {
        ErrorClass::Timeout
    } else if contains_any(&text, SUCCESS) {
        ErrorClass::Success
    } else if contains_any(&text, TOOL_ERROR) {
        ErrorClass::ToolError
    } else {
        ErrorClass::Unknown
    }
}

fn render_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => text.clone(),
                Value::Object(map) => match map.get("text").and_then(|v| v.as_str()) {
                    Some(text) => text.to_string(),
                    None => part.to_string(),
                },
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn contains_any(text: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| text.contains(cue))
}
