use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use trellis_server::{serve, AppState, Config};
use trellis_tools::{CliToolExecutor, ToolDefinition, ToolRegistry};

const LOG_RETENTION_DAYS: u64 = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let (_log_guard, log_info) =
        trellis_observability::init_logging(&config.logs_dir, LOG_RETENTION_DAYS)?;

    info!(
        host = %config.host,
        port = config.port,
        workspace = %config.workspace.display(),
        agent_bin = %config.agent_bin,
        boundary_mode = ?config.boundary_mode,
        auto_fallback = config.auto_fallback,
        proxy_exec_tools = config.proxy_exec_tools,
        logs_dir = %log_info.logs_dir,
        "starting trellis proxy"
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Tool results are only routed locally when proxy execution is on, so the
    // registry stays empty otherwise and every tool call reaches the client.
    let mut registry = ToolRegistry::new();
    if config.proxy_exec_tools {
        let executor = Arc::new(CliToolExecutor::new(
            config.agent_bin.clone(),
            config.tool_timeout,
        ));
        for name in &config.proxy_tools {
            info!(tool = %name, "registering locally-routed tool");
            registry.register(
                ToolDefinition {
                    name: name.clone(),
                    description: format!("Locally executed {name} tool"),
                    parameters: serde_json::json!({"type": "object"}),
                },
                executor.clone(),
            );
        }
    }

    let state = AppState {
        config: Arc::new(config),
        registry: Arc::new(registry),
    };

    serve(addr, state).await
}
