use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use trellis_provider::{
    canonical_tool_name, extract_tool_call, Extraction, ToolResultRouter,
};
use trellis_types::{ResponseMeta, ToolCallEvent, ToolDeclaration, ToolUpdate};
use trellis_wire::{ChatCompletionChunk, Delta, ToolCallDelta};

/// Declared shape of one locally-routable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            kind: Some("function".to_string()),
            function: Some(trellis_types::ToolFunctionDeclaration {
                name: self.name.clone(),
                description: Some(self.description.clone()),
                parameters: Some(self.parameters.clone()),
            }),
            name: None,
            parameters: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExecuteResult {
    Success { output: String },
    Error { error: String },
}

impl ToolExecuteResult {
    /// Text embedded in the synthetic tool-result delta. Errors are rendered
    /// too; the client relays them back so the agent can self-correct.
    pub fn render(&self) -> &str {
        match self {
            ToolExecuteResult::Success { output } => output,
            ToolExecuteResult::Error { error } => error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolExecuteResult::Error { .. })
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> anyhow::Result<ToolExecuteResult>;
}

/// Shells out to `<bin> tool run <name> --json <arguments>` with a timeout.
/// Output is ANSI-stripped before it reaches the wire.
pub struct CliToolExecutor {
    bin: String,
    timeout: Duration,
}

impl CliToolExecutor {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ToolExecutor for CliToolExecutor {
    async fn execute(&self, name: &str, arguments: &Value) -> anyhow::Result<ToolExecuteResult> {
        let args_json = arguments.to_string();
        let output = Command::new(&self.bin)
            .args(["tool", "run", name, "--json", &args_json])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(tool = name, timeout_ms = self.timeout.as_millis() as u64, "tool execution timeout");
                return Ok(ToolExecuteResult::Error {
                    error: "tool execution timeout".to_string(),
                });
            }
        };

        let stdout = strip_ansi(&String::from_utf8_lossy(&output.stdout));
        let stderr = strip_ansi(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            let text = if stdout.trim().is_empty() {
                "(no output)".to_string()
            } else {
                stdout
            };
            return Ok(ToolExecuteResult::Success { output: text });
        }

        let error = [stderr, stdout]
            .into_iter()
            .find(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("exit code {}", output.status.code().unwrap_or(-1)));
        Ok(ToolExecuteResult::Error { error })
    }
}

/// Removes terminal escape sequences from CLI output.
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*(?:\x07|\x1b\\)")
            .unwrap_or_else(|_| Regex::new(r"\x1b").unwrap())
    });
    re.replace_all(text, "").into_owned()
}

struct RegisteredTool {
    definition: ToolDefinition,
    executor: Arc<dyn ToolExecutor>,
}

/// Name-keyed lookup of locally-routable tools. Built once at startup and
/// read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                executor,
            },
        );
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn executor(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).map(|tool| tool.executor.clone())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Dispatches a tool-call event to a registered executor and wraps the
/// output as a synthetic completion chunk. Unroutable events are a no-op,
/// never an error.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn route(
        &self,
        event: &ToolCallEvent,
        meta: &ResponseMeta,
    ) -> anyhow::Result<Option<ChatCompletionChunk>> {
        let raw_name = event
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or_else(|| event.tool_call.keys().next().map(String::as_str));
        let Some(raw_name) = raw_name else {
            return Ok(None);
        };

        let canonical = canonical_tool_name(raw_name);
        let Some(executor) = self.registry.executor(&canonical) else {
            return Ok(None);
        };

        let routable: HashSet<String> = [canonical.clone()].into();
        let Extraction::Intercept(call) = extract_tool_call(event, &routable) else {
            return Ok(None);
        };

        let arguments: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
        let result = executor.execute(&canonical, &arguments).await?;
        debug!(
            tool = %canonical,
            call_id = %call.id,
            is_error = result.is_error(),
            "routed tool call"
        );

        let mut delta = ToolCallDelta::from_call(&call);
        delta.output = Some(result.render().to_string());
        Ok(Some(ChatCompletionChunk::new(
            meta,
            Delta {
                tool_calls: Some(vec![delta]),
                ..Delta::default()
            },
            None,
        )))
    }
}

#[async_trait]
impl ToolResultRouter for ToolRouter {
    async fn handle_tool_call(
        &self,
        event: &ToolCallEvent,
        meta: &ResponseMeta,
    ) -> anyhow::Result<Option<ChatCompletionChunk>> {
        self.route(event, meta).await
    }
}

/// Maps non-intercepted tool events to session-facing progress updates.
#[derive(Debug, Default)]
pub struct StatusEventMapper;

impl StatusEventMapper {
    fn status_for(subtype: Option<&str>) -> &'static str {
        match subtype {
            Some("started") => "pending",
            Some("completed") | Some("finished") => "completed",
            Some("failed") | Some("error") => "failed",
            _ => "in_progress",
        }
    }
}

#[async_trait]
impl trellis_provider::EventMapper for StatusEventMapper {
    async fn map_event(
        &self,
        event: &ToolCallEvent,
        _session_id: &str,
    ) -> anyhow::Result<Vec<ToolUpdate>> {
        let Some(call_id) = event
            .call_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Ok(Vec::new());
        };

        let title = event
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or_else(|| event.tool_call.keys().next().map(String::as_str))
            .map(canonical_tool_name);

        Ok(vec![ToolUpdate {
            tool_call_id: call_id.to_string(),
            status: Self::status_for(event.subtype.as_deref()).to_string(),
            title,
        }])
    }
}
