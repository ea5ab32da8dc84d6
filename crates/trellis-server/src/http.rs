use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use trellis_provider::{
    allowed_tool_names, boundary_for, build_tool_schema_map, handle_tool_loop_event_with_fallback,
    tool_call_completion_response, tool_call_stream_chunks, Emission, EventOutcome,
    InterceptionContext, ToolLoopGuard, ToolLoopMode,
};
use trellis_stream::{parse_stream_line, SseConverter, TurnAccumulator};
use trellis_tools::{StatusEventMapper, ToolRegistry, ToolRouter};
use trellis_types::{AgentEvent, ChatMessage, ResponseMeta, ToolDeclaration};
use trellis_wire::{ChatCompletion, ChatCompletionChunk, ModelList};

use crate::agent::{build_prompt, fetch_models, AgentTurn};
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "trellis proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/v1/models", get(list_models))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn list_models(State(state): State<AppState>) -> Response {
    match fetch_models(&state.config.agent_bin).await {
        Ok(models) => Json(ModelList::new(models)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to list models");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch models" })),
            )
                .into_response()
        }
    }
}

fn response_meta(model: &str) -> ResponseMeta {
    let now = chrono::Utc::now();
    ResponseMeta {
        id: format!("trellis-{}", now.timestamp_millis()),
        created: now.timestamp().max(0) as u64,
        model: model.to_string(),
    }
}

/// Per-request interception state: everything the tool-loop handlers need,
/// created at request start and discarded with the response.
struct RequestPipeline {
    guard: ToolLoopGuard,
    allowed: std::collections::HashSet<String>,
    schemas: std::collections::HashMap<String, Value>,
    mapper: StatusEventMapper,
    router: ToolRouter,
    meta: ResponseMeta,
    emitter: mpsc::UnboundedSender<Emission>,
    emissions: mpsc::UnboundedReceiver<Emission>,
}

impl RequestPipeline {
    fn new(state: &AppState, request: &ChatCompletionRequest, meta: ResponseMeta) -> Self {
        let (emitter, emissions) = mpsc::unbounded_channel();
        Self {
            guard: ToolLoopGuard::from_history(
                &request.messages,
                state.config.tool_loop_max_repeat,
            ),
            allowed: allowed_tool_names(&request.tools),
            schemas: build_tool_schema_map(&request.tools),
            mapper: StatusEventMapper,
            router: ToolRouter::new(state.registry.clone()),
            meta,
            emitter,
            emissions,
        }
    }

    async fn handle_tool_event(
        &mut self,
        state: &AppState,
        event: &trellis_types::ToolCallEvent,
    ) -> anyhow::Result<EventOutcome> {
        let config = &state.config;
        let boundary = boundary_for(config.boundary_mode);
        let mut ctx = InterceptionContext {
            tool_loop_mode: if config.proxy_exec_tools {
                ToolLoopMode::ProxyExec
            } else {
                ToolLoopMode::Intercept
            },
            allowed_tool_names: &self.allowed,
            tool_schema_map: &self.schemas,
            guard: &mut self.guard,
            mapper: &self.mapper,
            session_id: &self.meta.id,
            emit_tool_updates: true,
            proxy_execute_tool_calls: config.proxy_exec_tools,
            suppress_converter_tool_events: config.proxy_exec_tools,
            router: Some(&self.router),
            meta: &self.meta,
            emitter: &self.emitter,
        };
        handle_tool_loop_event_with_fallback(
            boundary.as_ref(),
            config.boundary_mode,
            config.auto_fallback,
            &mut ctx,
            event,
        )
        .await
    }

    /// Emissions produced by the last handler call, in order. The handlers
    /// send synchronously, so everything is already buffered.
    fn drain_emissions(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        while let Ok(emission) = self.emissions.try_recv() {
            out.push(emission);
        }
        out
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let model = request.model.clone().unwrap_or_else(|| "auto".to_string());
    let meta = response_meta(&model);
    let prompt = build_prompt(&request.messages);
    debug!(
        model = %model,
        stream = request.stream,
        tools = request.tools.len(),
        prompt = %trellis_observability::redact_text(&prompt),
        "chat completion request"
    );

    let turn = match AgentTurn::spawn(&state.config, &model, &prompt).await {
        Ok(turn) => turn,
        Err(err) => {
            tracing::error!(error = %err, "failed to start agent");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let pipeline = RequestPipeline::new(&state, &request, meta.clone());
    if request.stream {
        stream_response(state, pipeline, turn, meta)
    } else {
        blocking_response(state, pipeline, turn, meta).await
    }
}

/// Non-streamed path: consume the whole turn, accumulate text and
/// reasoning, answer with one `chat.completion` body. An intercepted tool
/// call short-circuits into a `tool_calls` response.
async fn blocking_response(
    state: AppState,
    mut pipeline: RequestPipeline,
    mut turn: AgentTurn,
    meta: ResponseMeta,
) -> Response {
    let mut accumulator = TurnAccumulator::new();

    while let Some(line) = turn.next_line().await {
        let Some(event) = parse_stream_line(&line) else {
            continue;
        };
        match &event {
            AgentEvent::ToolCall(tool_event) => {
                let outcome = match pipeline.handle_tool_event(&state, tool_event).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(error = %err, "tool event handling failed");
                        turn.terminate().await;
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({ "error": err.to_string() })),
                        )
                            .into_response();
                    }
                };
                for emission in pipeline.drain_emissions() {
                    match emission {
                        Emission::InterceptedToolCall(call) => {
                            turn.terminate().await;
                            return Json(tool_call_completion_response(&meta, &call))
                                .into_response();
                        }
                        other => log_emission(&other),
                    }
                }
                if let Some(termination) = outcome.terminate {
                    turn.terminate().await;
                    let body =
                        ChatCompletion::text(&meta, termination.message.clone(), None);
                    return Json(body).into_response();
                }
            }
            other => accumulator.push(other),
        }
    }

    let (success, stderr) = turn.finish().await;
    if !success && !stderr.is_empty() {
        warn!(stderr = %stderr, "agent exited with an error");
        if accumulator.content().is_empty() {
            return Json(ChatCompletion::text(&meta, stderr, None)).into_response();
        }
    }
    Json(accumulator.into_completion(&meta)).into_response()
}

/// Streamed path: SSE frames produced as agent lines arrive. Dropping the
/// response body (client disconnect) drops the generator, which kills the
/// subprocess.
fn stream_response(
    state: AppState,
    mut pipeline: RequestPipeline,
    mut turn: AgentTurn,
    meta: ResponseMeta,
) -> Response {
    let frames = async_stream::stream! {
        let mut converter = SseConverter::new(meta.clone());

        while let Some(line) = turn.next_line().await {
            let Some(event) = parse_stream_line(&line) else {
                continue;
            };
            let tool_event = match &event {
                AgentEvent::ToolCall(tool_event) => Some(tool_event),
                _ => None,
            };

            if let Some(tool_event) = tool_event {
                let outcome = match pipeline.handle_tool_event(&state, tool_event).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(error = %err, "tool event handling failed");
                        let notice = ChatCompletionChunk::content(
                            &meta,
                            format!("Error: {err}"),
                        );
                        yield Ok::<_, Infallible>(notice.frame());
                        for frame in converter.finish("stop") {
                            yield Ok(frame);
                        }
                        turn.terminate().await;
                        return;
                    }
                };

                let mut intercepted = None;
                for emission in pipeline.drain_emissions() {
                    match emission {
                        Emission::InterceptedToolCall(call) => intercepted = Some(call),
                        Emission::ToolResult(chunk) => yield Ok(chunk.frame()),
                        other => log_emission(&other),
                    }
                }

                if let Some(call) = intercepted {
                    for chunk in tool_call_stream_chunks(&meta, &call) {
                        yield Ok(chunk.frame());
                    }
                    yield Ok(trellis_wire::DONE_FRAME.to_string());
                    turn.terminate().await;
                    return;
                }

                if let Some(termination) = outcome.terminate {
                    let notice =
                        ChatCompletionChunk::content(&meta, termination.message.clone());
                    yield Ok(notice.frame());
                    for frame in converter.finish("stop") {
                        yield Ok(frame);
                    }
                    turn.terminate().await;
                    return;
                }

                if outcome.skip_converter {
                    continue;
                }
            }

            for chunk in converter.handle_event(&event) {
                yield Ok(chunk.frame());
            }
        }

        let (success, stderr) = turn.finish().await;
        if !success && !stderr.is_empty() {
            let mut error_chunk =
                ChatCompletionChunk::content(&meta, format!("Error: {stderr}"));
            error_chunk.choices[0].finish_reason = Some("stop".to_string());
            yield Ok(error_chunk.frame());
        }
        for frame in converter.finish("stop") {
            yield Ok(frame);
        }
    };

    let mut response = Body::from_stream(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

fn log_emission(emission: &Emission) {
    match emission {
        Emission::ToolUpdate(update) => debug!(
            tool_call_id = %update.tool_call_id,
            status = %update.status,
            title = update.title.as_deref().unwrap_or(""),
            "tool update"
        ),
        Emission::FallbackToLegacy { cause } => {
            warn!(cause = %cause, "fell back to legacy tool extraction")
        }
        Emission::InterceptedToolCall(_) | Emission::ToolResult(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            config: Arc::new(Config {
                host: "127.0.0.1".to_string(),
                port: 0,
                workspace: std::path::PathBuf::from("/tmp"),
                agent_bin: "true".to_string(),
                tool_loop_max_repeat: 3,
                boundary_mode: trellis_provider::BoundaryMode::V1,
                auto_fallback: true,
                proxy_exec_tools: false,
                proxy_tools: Vec::new(),
                tool_timeout: std::time::Duration::from_secs(30),
                logs_dir: std::path::PathBuf::from("logs"),
            }),
            registry: Arc::new(ToolRegistry::new()),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = app_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v2/other")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn request_body_defaults_are_tolerant() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }],
        }))
        .unwrap();
        assert_eq!(request.model, None);
        assert!(!request.stream);
        assert!(request.tools.is_empty());

        let full: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-5.2",
            "stream": true,
            "messages": [],
            "tools": [{ "type": "function", "function": { "name": "read" } }],
        }))
        .unwrap();
        assert_eq!(full.model.as_deref(), Some("gpt-5.2"));
        assert!(full.stream);
        assert_eq!(full.tools.len(), 1);
    }

    #[test]
    fn response_meta_uses_the_requested_model() {
        let meta = response_meta("gpt-5.2");
        assert!(meta.id.starts_with("trellis-"));
        assert_eq!(meta.model, "gpt-5.2");
        assert!(meta.created > 0);
    }
}
