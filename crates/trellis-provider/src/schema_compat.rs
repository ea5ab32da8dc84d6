use std::collections::HashMap;

use serde_json::{Map, Value};

use trellis_types::{ToolCall, ToolDeclaration};

/// Surface argument keys mapped to the canonical vocabulary. Lookup keys
/// are lowercased with punctuation stripped, so `filePath`, `file_path`
/// and `FILE-PATH` all resolve the same way.
const ARG_KEY_ALIASES: &[(&str, &str)] = &[
    ("filepath", "path"),
    ("file", "path"),
    ("targetfile", "path"),
    ("contents", "content"),
    ("text", "content"),
    ("streamcontent", "content"),
    ("oldstring", "old_string"),
    ("newstring", "new_string"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidation {
    pub has_schema: bool,
    pub ok: bool,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub type_errors: Vec<String>,
    pub repair_hint: Option<String>,
}

impl SchemaValidation {
    fn vacuous() -> Self {
        Self {
            has_schema: false,
            ok: true,
            missing: Vec::new(),
            unexpected: Vec::new(),
            type_errors: Vec::new(),
            repair_hint: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaCompat {
    pub tool_call: ToolCall,
    pub normalized_args: Map<String, Value>,
    pub original_arg_keys: Vec<String>,
    pub normalized_arg_keys: Vec<String>,
    pub collision_keys: Vec<String>,
    pub validation: SchemaValidation,
}

/// Builds the per-request tool-name → parameters lookup from the caller's
/// tool declarations. Tools without parameters are omitted.
pub fn build_tool_schema_map(tools: &[ToolDeclaration]) -> HashMap<String, Value> {
    let mut schemas = HashMap::new();
    for tool in tools {
        let Some(name) = tool.tool_name() else {
            continue;
        };
        if let Some(parameters) = tool.tool_parameters() {
            schemas.insert(name.to_string(), parameters.clone());
        }
    }
    schemas
}

/// Reconciles argument drift between what the agent emitted and what the
/// declared schema expects. Annotates, never rejects: callers decide what to
/// do with a failed validation.
pub fn apply_tool_schema_compat(
    call: &ToolCall,
    schemas: &HashMap<String, Value>,
) -> SchemaCompat {
    let parsed = parse_arguments(&call.function.arguments);
    let original_arg_keys: Vec<String> = parsed.keys().cloned().collect();
    let (normalized, collision_keys) = normalize_argument_keys(&parsed);
    let normalized = normalize_tool_specific_args(&call.function.name, normalized);
    let validation = validate_tool_arguments(
        &call.function.name,
        &normalized,
        schemas.get(&call.function.name),
    );

    let arguments =
        serde_json::to_string(&normalized).unwrap_or_else(|_| call.function.arguments.clone());
    let tool_call = ToolCall::new(call.id.clone(), call.function.name.clone(), arguments);

    SchemaCompat {
        tool_call,
        normalized_arg_keys: normalized.keys().cloned().collect(),
        normalized_args: normalized,
        original_arg_keys,
        collision_keys,
        validation,
    }
}

fn parse_arguments(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
        Err(_) => {
            let mut map = Map::new();
            map.insert("value".to_string(), Value::String(raw.to_string()));
            map
        }
    }
}

fn normalize_argument_keys(args: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut normalized = args.clone();
    let mut collision_keys = Vec::new();

    for (raw_key, raw_value) in args {
        let Some(canonical) = resolve_canonical_arg_key(raw_key) else {
            continue;
        };
        if canonical == raw_key.as_str() {
            continue;
        }
        if args.contains_key(canonical) || normalized.contains_key(canonical) {
            // Canonical key wins; the alias is dropped and reported.
            collision_keys.push(raw_key.clone());
            normalized.remove(raw_key);
            continue;
        }
        normalized.insert(canonical.to_string(), raw_value.clone());
        normalized.remove(raw_key);
    }

    (normalized, collision_keys)
}

fn resolve_canonical_arg_key(raw_key: &str) -> Option<&'static str> {
    let token: String = raw_key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    ARG_KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map(|(_, canonical)| *canonical)
}

fn normalize_tool_specific_args(tool_name: &str, args: Map<String, Value>) -> Map<String, Value> {
    if !tool_name.eq_ignore_ascii_case("todowrite") {
        return args;
    }
    let Some(Value::Array(todos)) = args.get("todos") else {
        return args;
    };

    let todos: Vec<Value> = todos
        .iter()
        .map(|entry| {
            let Some(entry) = entry.as_object() else {
                return entry.clone();
            };
            let mut todo = entry.clone();
            if let Some(status) = todo.get("status").and_then(|v| v.as_str()) {
                todo.insert(
                    "status".to_string(),
                    Value::String(normalize_todo_status(status)),
                );
            }
            let blank_priority = match todo.get("priority") {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            if blank_priority {
                todo.insert("priority".to_string(), Value::String("medium".to_string()));
            }
            Value::Object(todo)
        })
        .collect();

    let mut normalized = args;
    normalized.insert("todos".to_string(), Value::Array(todos));
    normalized
}

fn normalize_todo_status(status: &str) -> String {
    let token: String = status
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect();
    let token = token
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    match token.as_str() {
        "todo" | "pending" => "pending".to_string(),
        "inprogress" | "in_progress" => "in_progress".to_string(),
        "done" | "complete" | "completed" => "completed".to_string(),
        _ => status.to_string(),
    }
}

fn validate_tool_arguments(
    tool_name: &str,
    args: &Map<String, Value>,
    schema: Option<&Value>,
) -> SchemaValidation {
    let Some(schema) = schema.and_then(|v| v.as_object()) else {
        return SchemaValidation::vacuous();
    };

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|entries| entries.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let missing: Vec<String> = required
        .iter()
        .filter(|key| !args.contains_key(**key))
        .map(|key| key.to_string())
        .collect();

    let allow_additional = schema.get("additionalProperties") != Some(&Value::Bool(false));
    let unexpected: Vec<String> = if allow_additional {
        Vec::new()
    } else {
        args.keys()
            .filter(|key| !properties.contains_key(*key))
            .cloned()
            .collect()
    };

    let mut type_errors = Vec::new();
    for (key, value) in args {
        let Some(property) = properties.get(key).and_then(|v| v.as_object()) else {
            continue;
        };
        let schema_type = property.get("type");
        if !matches_type(value, schema_type) {
            if let Some(schema_type) = schema_type {
                type_errors.push(format!("{key}: expected {}", render_type(schema_type)));
            }
            continue;
        }
        if let Some(candidates) = property.get("enum").and_then(|v| v.as_array()) {
            if !candidates.iter().any(|candidate| candidate == value) {
                type_errors.push(format!(
                    "{key}: expected enum {}",
                    serde_json::to_string(candidates).unwrap_or_default()
                ));
            }
        }
    }

    let ok = missing.is_empty() && unexpected.is_empty() && type_errors.is_empty();
    let repair_hint = if ok {
        None
    } else {
        Some(build_repair_hint(tool_name, &missing, &unexpected, &type_errors))
    };
    SchemaValidation {
        has_schema: true,
        ok,
        missing,
        unexpected,
        type_errors,
        repair_hint,
    }
}

fn build_repair_hint(
    tool_name: &str,
    missing: &[String],
    unexpected: &[String],
    type_errors: &[String],
) -> String {
    let mut hints = Vec::new();
    if !missing.is_empty() {
        hints.push(format!("missing required: {}", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        hints.push(format!("remove unsupported fields: {}", unexpected.join(", ")));
    }
    if !type_errors.is_empty() {
        hints.push(format!("fix type errors: {}", type_errors.join("; ")));
    }
    if tool_name.eq_ignore_ascii_case("edit")
        && (missing.iter().any(|k| k == "old_string") || missing.iter().any(|k| k == "new_string"))
    {
        hints.push("edit requires path, old_string, and new_string".to_string());
    }
    hints.join(" | ")
}

fn matches_type(value: &Value, schema_type: Option<&Value>) -> bool {
    let Some(schema_type) = schema_type else {
        return true;
    };
    match schema_type {
        Value::Array(entries) => entries.iter().any(|entry| matches_type(value, Some(entry))),
        Value::String(name) => match name.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.as_f64().is_some_and(|n| n.fract() == 0.0),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            "null" => value.is_null(),
            _ => true,
        },
        _ => true,
    }
}

fn render_type(schema_type: &Value) -> String {
    match schema_type {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}
