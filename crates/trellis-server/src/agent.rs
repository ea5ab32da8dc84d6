use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use trellis_tools::strip_ansi;
use trellis_types::ChatMessage;
use trellis_wire::ModelEntry;

use crate::config::Config;

pub const MODELS_TIMEOUT: Duration = Duration::from_secs(30);

/// Renders the conversation as the agent's plain-text prompt: one
/// `ROLE: text` line per message, array content reduced to its text parts.
pub fn build_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    for message in messages {
        let role = if message.role.is_empty() {
            "user"
        } else {
            &message.role
        };
        match &message.content {
            serde_json::Value::String(text) => {
                lines.push(format!("{}: {}", role.to_uppercase(), text));
            }
            serde_json::Value::Array(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("text"))
                    .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                    .filter(|text| !text.is_empty())
                    .collect();
                if !texts.is_empty() {
                    lines.push(format!("{}: {}", role.to_uppercase(), texts.join("\n")));
                }
            }
            _ => {}
        }
    }
    lines.join("\n\n")
}

/// Parses `<agent> models` output lines of the form
/// `id - description [(current|default)]` into model-list entries.
pub fn parse_models_output(output: &str) -> Vec<ModelEntry> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let re = LINE.get_or_init(|| {
        Regex::new(r"(?i)^([a-z0-9.-]+)\s+-\s+(.+?)(?:\s+\((?:current|default)\))*\s*$")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    });

    let created = chrono::Utc::now().timestamp().max(0) as u64;
    strip_ansi(output)
        .lines()
        .filter_map(|line| re.captures(line))
        .map(|captures| ModelEntry {
            id: captures[1].to_string(),
            object: "model".to_string(),
            created,
            owned_by: "agent".to_string(),
        })
        .collect()
}

/// Runs `<agent> models` with a hard timeout and parses its stdout.
pub async fn fetch_models(agent_bin: &str) -> anyhow::Result<Vec<ModelEntry>> {
    let output = Command::new(agent_bin)
        .arg("models")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(MODELS_TIMEOUT, output)
        .await
        .with_context(|| {
            format!(
                "{agent_bin} models timed out after {}ms",
                MODELS_TIMEOUT.as_millis()
            )
        })?
        .with_context(|| format!("failed to run {agent_bin} models"))?;

    if !output.status.success() {
        let stderr = strip_ansi(&String::from_utf8_lossy(&output.stderr));
        let stderr = stderr.trim();
        anyhow::bail!(
            "{agent_bin} models exited with {}: {}",
            output.status,
            if stderr.is_empty() { "(no output)" } else { stderr }
        );
    }

    Ok(parse_models_output(&String::from_utf8_lossy(&output.stdout)))
}

/// One running agent turn. Dropping it kills the subprocess, so an early
/// client disconnect cannot leak children.
pub struct AgentTurn {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: tokio::task::JoinHandle<String>,
}

impl AgentTurn {
    /// Spawns the agent in stream-json mode and writes the prompt to stdin.
    /// The prompt goes over stdin rather than argv to sidestep argument
    /// length limits.
    pub async fn spawn(config: &Config, model: &str, prompt: &str) -> anyhow::Result<Self> {
        let mut child = Command::new(&config.agent_bin)
            .args([
                "--print",
                "--output-format",
                "stream-json",
                "--stream-partial-output",
                "--workspace",
            ])
            .arg(&config.workspace)
            .args(["--model", model])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", config.agent_bin))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            // Dropping stdin closes the pipe so the agent sees EOF.
        }

        let stdout = child
            .stdout
            .take()
            .context("agent stdout was not captured")?;
        let stderr_pipe = child
            .stderr
            .take()
            .context("agent stderr was not captured")?;
        let stderr = tokio::spawn(async move {
            let mut text = String::new();
            let mut reader = BufReader::new(stderr_pipe);
            use tokio::io::AsyncReadExt;
            let _ = reader.read_to_string(&mut text).await;
            text
        });

        debug!(bin = %config.agent_bin, model, "spawned agent turn");
        Ok(Self {
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr,
        })
    }

    /// Next stdout line, `None` at EOF. Read failures end the stream rather
    /// than surfacing mid-response.
    pub async fn next_line(&mut self) -> Option<String> {
        match self.stdout.next_line().await {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "agent stdout read failed");
                None
            }
        }
    }

    /// Waits for exit and returns `(success, stderr)` with ANSI stripped.
    pub async fn finish(mut self) -> (bool, String) {
        let status = self.child.wait().await;
        let stderr = match self.stderr.await {
            Ok(text) => strip_ansi(text.trim()),
            Err(_) => String::new(),
        };
        let success = status.map(|s| s.success()).unwrap_or(false);
        (success, stderr)
    }

    /// Kills the subprocess early. Safe to call after exit; a dead child is
    /// a no-op.
    pub async fn terminate(&mut self) {
        let _ = self.child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_renders_roles_and_string_content() {
        let messages: Vec<ChatMessage> = serde_json::from_value(json!([
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": "hello" },
        ]))
        .unwrap();
        assert_eq!(build_prompt(&messages), "SYSTEM: be brief\n\nUSER: hello");
    }

    #[test]
    fn prompt_flattens_text_parts_and_skips_other_content() {
        let messages: Vec<ChatMessage> = serde_json::from_value(json!([
            { "role": "user", "content": [
                { "type": "text", "text": "first" },
                { "type": "image_url", "image_url": { "url": "x" } },
                { "type": "text", "text": "second" },
            ]},
            { "role": "user", "content": [{ "type": "image_url", "image_url": { "url": "y" } }] },
        ]))
        .unwrap();
        assert_eq!(build_prompt(&messages), "USER: first\nsecond");
    }

    #[test]
    fn parses_model_listing_lines() {
        let output = "\
auto - picks the best model (default)
gpt-5.2 - frontier coding model (current)
sonnet-4 - balanced model
Usage: agent models [options]
";
        let models = parse_models_output(output);
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["auto", "gpt-5.2", "sonnet-4"]);
        assert!(models.iter().all(|m| m.object == "model"));
    }

    #[test]
    fn model_parsing_strips_ansi_sequences() {
        let output = "\x1b[1mauto\x1b[0m - default model\n";
        let models = parse_models_output(output);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "auto");
    }

    #[test]
    fn model_parsing_ignores_prose_lines() {
        let output = "Listing available models:\n\nnot a model line\n";
        assert!(parse_models_output(output).is_empty());
    }
}
