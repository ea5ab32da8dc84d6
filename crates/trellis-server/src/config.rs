use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use trellis_provider::{parse_max_repeat, BoundaryMode};

pub const DEFAULT_PORT: u16 = 32124;

/// Server configuration, read once from the environment at startup. Invalid
/// values degrade to defaults with a logged warning; startup never fails on
/// configuration alone.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workspace: PathBuf,
    pub agent_bin: String,
    pub tool_loop_max_repeat: u32,
    pub boundary_mode: BoundaryMode,
    pub auto_fallback: bool,
    pub proxy_exec_tools: bool,
    pub proxy_tools: Vec<String>,
    pub tool_timeout: Duration,
    pub logs_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let host = env_or("TRELLIS_HOST", "0.0.0.0");
        let port = match env::var("TRELLIS_PORT") {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(raw, "invalid TRELLIS_PORT, using default");
                DEFAULT_PORT
            }),
            Err(_) => DEFAULT_PORT,
        };
        let workspace = PathBuf::from(env_or("TRELLIS_WORKSPACE", "/workspace"));
        let agent_bin = env_or("TRELLIS_AGENT_BIN", "coder-agent");

        let raw_max_repeat = env::var("TRELLIS_TOOL_LOOP_MAX_REPEAT").ok();
        let max_repeat = parse_max_repeat(raw_max_repeat.as_deref());
        if !max_repeat.valid {
            warn!(
                raw = raw_max_repeat.as_deref().unwrap_or(""),
                default = max_repeat.value,
                "invalid TRELLIS_TOOL_LOOP_MAX_REPEAT, using default"
            );
        }

        let boundary_mode = match env::var("TRELLIS_BOUNDARY_MODE") {
            Ok(raw) => BoundaryMode::parse(&raw).unwrap_or_else(|| {
                warn!(raw, "invalid TRELLIS_BOUNDARY_MODE, using v1");
                BoundaryMode::V1
            }),
            Err(_) => BoundaryMode::V1,
        };

        let tool_timeout_ms = match env::var("TRELLIS_TOOL_TIMEOUT_MS") {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(raw, "invalid TRELLIS_TOOL_TIMEOUT_MS, using default");
                30_000
            }),
            Err(_) => 30_000u64,
        };

        let proxy_tools = env::var("TRELLIS_PROXY_TOOLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let logs_dir = env::var("TRELLIS_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                trellis_observability::default_logs_dir(std::path::Path::new("."))
            });

        Self {
            host,
            port,
            workspace,
            agent_bin,
            tool_loop_max_repeat: max_repeat.value,
            boundary_mode,
            auto_fallback: env_flag("TRELLIS_AUTO_FALLBACK", true),
            proxy_exec_tools: env_flag("TRELLIS_PROXY_EXEC_TOOLS", false),
            proxy_tools,
            tool_timeout: Duration::from_millis(tool_timeout_ms),
            logs_dir,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_accepts_common_truthy_forms() {
        env::set_var("TRELLIS_TEST_FLAG_A", "TRUE");
        env::set_var("TRELLIS_TEST_FLAG_B", "0");
        assert!(env_flag("TRELLIS_TEST_FLAG_A", false));
        assert!(!env_flag("TRELLIS_TEST_FLAG_B", true));
        assert!(env_flag("TRELLIS_TEST_FLAG_MISSING", true));
        env::remove_var("TRELLIS_TEST_FLAG_A");
        env::remove_var("TRELLIS_TEST_FLAG_B");
    }

    #[test]
    fn env_or_falls_back_on_blank_values() {
        env::set_var("TRELLIS_TEST_BLANK", "   ");
        assert_eq!(env_or("TRELLIS_TEST_BLANK", "fallback"), "fallback");
        env::remove_var("TRELLIS_TEST_BLANK");
    }
}
