use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use trellis_types::{ResponseMeta, ToolCall, ToolCallEvent, ToolUpdate};
use trellis_wire::ChatCompletionChunk;

use crate::extract::{extract_tool_call, Extraction};
use crate::loop_guard::ToolLoopGuard;
use crate::schema_compat::apply_tool_schema_compat;

/// Which extraction algorithm runs for a request. Caller-supplied
/// configuration, never inferred from the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryMode {
    Legacy,
    V1,
}

impl BoundaryMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "legacy" => Some(BoundaryMode::Legacy),
            "v1" => Some(BoundaryMode::V1),
            _ => None,
        }
    }
}

/// Whether tool calls are intercepted for the client to execute, or left in
/// the event stream for local proxy execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolLoopMode {
    Intercept,
    ProxyExec,
}

/// Extraction failure raised inside a boundary. Only this error class is
/// eligible for automatic legacy fallback; anything else propagates.
#[derive(Debug)]
pub struct BoundaryExtractionError {
    message: String,
    cause: Option<anyhow::Error>,
}

impl BoundaryExtractionError {
    pub fn new(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            cause,
        }
    }

    pub fn cause_text(&self) -> String {
        match &self.cause {
            Some(cause) => cause.to_string(),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for BoundaryExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BoundaryExtractionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|cause| {
            let err: &(dyn std::error::Error + 'static) = cause.as_ref();
            err
        })
    }
}

/// Pluggable tool-call extraction. `Ok(None)` means nothing to intercept;
/// `Err` is wrapped into [`BoundaryExtractionError`] by the v1 handler.
pub trait ToolCallBoundary: Send + Sync {
    fn maybe_extract_tool_call(
        &self,
        event: &ToolCallEvent,
        allowed_tool_names: &HashSet<String>,
        tool_loop_mode: ToolLoopMode,
    ) -> anyhow::Result<Option<ToolCall>>;
}

#[derive(Debug, Default)]
pub struct LegacyBoundary;

impl ToolCallBoundary for LegacyBoundary {
    fn maybe_extract_tool_call(
        &self,
        event: &ToolCallEvent,
        allowed_tool_names: &HashSet<String>,
        tool_loop_mode: ToolLoopMode,
    ) -> anyhow::Result<Option<ToolCall>> {
        Ok(extract_intercepted(event, allowed_tool_names, tool_loop_mode))
    }
}

#[derive(Debug, Default)]
pub struct V1Boundary;

impl ToolCallBoundary for V1Boundary {
    fn maybe_extract_tool_call(
        &self,
        event: &ToolCallEvent,
        allowed_tool_names: &HashSet<String>,
        tool_loop_mode: ToolLoopMode,
    ) -> anyhow::Result<Option<ToolCall>> {
        Ok(extract_intercepted(event, allowed_tool_names, tool_loop_mode))
    }
}

pub fn boundary_for(mode: BoundaryMode) -> Box<dyn ToolCallBoundary> {
    match mode {
        BoundaryMode::Legacy => Box::new(LegacyBoundary),
        BoundaryMode::V1 => Box::new(V1Boundary),
    }
}

fn extract_intercepted(
    event: &ToolCallEvent,
    allowed_tool_names: &HashSet<String>,
    tool_loop_mode: ToolLoopMode,
) -> Option<ToolCall> {
    if tool_loop_mode != ToolLoopMode::Intercept {
        return None;
    }
    match extract_tool_call(event, allowed_tool_names) {
        Extraction::Intercept(call) => Some(call),
        Extraction::Passthrough { .. } | Extraction::Skip { .. } => None,
    }
}

/// Everything the pipeline produces besides the converter's own chunks.
/// Delivery is the transport layer's problem; the handlers only send.
#[derive(Debug)]
pub enum Emission {
    ToolUpdate(ToolUpdate),
    ToolResult(ChatCompletionChunk),
    InterceptedToolCall(ToolCall),
    FallbackToLegacy { cause: String },
}

/// Maps a non-intercepted tool event to zero or more session-facing
/// progress updates.
#[async_trait]
pub trait EventMapper: Send + Sync {
    async fn map_event(
        &self,
        event: &ToolCallEvent,
        session_id: &str,
    ) -> anyhow::Result<Vec<ToolUpdate>>;
}

/// Executes a locally-dispatchable tool call and wraps its output as a
/// synthetic completion chunk. `Ok(None)` when the tool is not routable.
#[async_trait]
pub trait ToolResultRouter: Send + Sync {
    async fn handle_tool_call(
        &self,
        event: &ToolCallEvent,
        meta: &ResponseMeta,
    ) -> anyhow::Result<Option<ChatCompletionChunk>>;
}

/// Per-request state and collaborators for the tool-loop handlers. Built
/// once per inbound request; the guard and schema map are owned by exactly
/// one session.
pub struct InterceptionContext<'a> {
    pub tool_loop_mode: ToolLoopMode,
    pub allowed_tool_names: &'a HashSet<String>,
    pub tool_schema_map: &'a HashMap<String, Value>,
    pub guard: &'a mut ToolLoopGuard,
    pub mapper: &'a dyn EventMapper,
    pub session_id: &'a str,
    pub emit_tool_updates: bool,
    pub proxy_execute_tool_calls: bool,
    pub suppress_converter_tool_events: bool,
    pub router: Option<&'a dyn ToolResultRouter>,
    pub meta: &'a ResponseMeta,
    pub emitter: &'a UnboundedSender<Emission>,
}

impl InterceptionContext<'_> {
    fn emit(&self, emission: Emission) {
        // A closed channel means the client is gone; nothing left to deliver.
        let _ = self.emitter.send(emission);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLoopTermination {
    pub reason: String,
    pub message: String,
    pub tool: String,
    pub fingerprint: String,
    pub repeat_count: u32,
    pub max_repeat: u32,
    pub error_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub intercepted: bool,
    pub skip_converter: bool,
    pub terminate: Option<ToolLoopTermination>,
}

impl EventOutcome {
    fn intercepted() -> Self {
        Self {
            intercepted: true,
            skip_converter: true,
            terminate: None,
        }
    }

    fn terminated(termination: ToolLoopTermination) -> Self {
        Self {
            intercepted: false,
            skip_converter: true,
            terminate: Some(termination),
        }
    }

    fn passthrough(skip_converter: bool) -> Self {
        Self {
            intercepted: false,
            skip_converter,
            terminate: None,
        }
    }
}

pub async fn handle_tool_loop_event_legacy(
    ctx: &mut InterceptionContext<'_>,
    event: &ToolCallEvent,
) -> anyhow::Result<EventOutcome> {
    let intercepted = extract_intercepted(event, ctx.allowed_tool_names, ctx.tool_loop_mode);
    if let Some(call) = intercepted {
        if let Some(termination) = evaluate_guard(ctx.guard, &call) {
            return Ok(EventOutcome::terminated(termination));
        }
        ctx.emit(Emission::InterceptedToolCall(call));
        return Ok(EventOutcome::intercepted());
    }
    map_and_route(ctx, event).await
}

pub async fn handle_tool_loop_event_v1(
    boundary: &dyn ToolCallBoundary,
    ctx: &mut InterceptionContext<'_>,
    event: &ToolCallEvent,
) -> anyhow::Result<EventOutcome> {
    let extracted = boundary
        .maybe_extract_tool_call(event, ctx.allowed_tool_names, ctx.tool_loop_mode)
        .map_err(|cause| {
            BoundaryExtractionError::new("boundary tool extraction failed", Some(cause))
        })?;

    if let Some(call) = extracted {
        let compat = apply_tool_schema_compat(&call, ctx.tool_schema_map);
        debug!(
            tool = %compat.tool_call.function.name,
            original_arg_keys = ?compat.original_arg_keys,
            normalized_arg_keys = ?compat.normalized_arg_keys,
            collision_keys = ?compat.collision_keys,
            validation_ok = compat.validation.ok,
            "applied tool schema compatibility"
        );
        if compat.validation.has_schema && !compat.validation.ok {
            warn!(
                tool = %compat.tool_call.function.name,
                missing = ?compat.validation.missing,
                unexpected = ?compat.validation.unexpected,
                type_errors = ?compat.validation.type_errors,
                repair_hint = compat.validation.repair_hint.as_deref().unwrap_or(""),
                "tool schema validation failed"
            );
        }

        let call = compat.tool_call;
        if let Some(termination) = evaluate_guard(ctx.guard, &call) {
            return Ok(EventOutcome::terminated(termination));
        }
        ctx.emit(Emission::InterceptedToolCall(call));
        return Ok(EventOutcome::intercepted());
    }

    map_and_route(ctx, event).await
}

/// Top-level orchestrator. Legacy mode always runs legacy; v1 falls back to
/// legacy on extraction failure or a guard trigger when auto-fallback is
/// enabled, re-running the event through the legacy path from scratch.
pub async fn handle_tool_loop_event_with_fallback(
    boundary: &dyn ToolCallBoundary,
    boundary_mode: BoundaryMode,
    auto_fallback_to_legacy: bool,
    ctx: &mut InterceptionContext<'_>,
    event: &ToolCallEvent,
) -> anyhow::Result<EventOutcome> {
    if boundary_mode == BoundaryMode::Legacy {
        return handle_tool_loop_event_legacy(ctx, event).await;
    }

    match handle_tool_loop_event_v1(boundary, ctx, event).await {
        Ok(outcome) => {
            if let Some(termination) = &outcome.terminate {
                if auto_fallback_to_legacy {
                    // Clear the v1-derived counter so legacy's possibly
                    // different fingerprint does not trip immediately.
                    ctx.guard.reset_fingerprint(&termination.fingerprint);
                    ctx.emit(Emission::FallbackToLegacy {
                        cause: format!("loop guard: {}", termination.fingerprint),
                    });
                    return handle_tool_loop_event_legacy(ctx, event).await;
                }
            }
            Ok(outcome)
        }
        Err(err) => {
            if !auto_fallback_to_legacy {
                return Err(err);
            }
            let Some(extraction_err) = err.downcast_ref::<BoundaryExtractionError>() else {
                return Err(err);
            };
            ctx.emit(Emission::FallbackToLegacy {
                cause: extraction_err.cause_text(),
            });
            handle_tool_loop_event_legacy(ctx, event).await
        }
    }
}

async fn map_and_route(
    ctx: &mut InterceptionContext<'_>,
    event: &ToolCallEvent,
) -> anyhow::Result<EventOutcome> {
    let session_id = event
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(ctx.session_id);
    let updates = ctx.mapper.map_event(event, session_id).await?;
    if ctx.emit_tool_updates {
        for update in updates {
            ctx.emit(Emission::ToolUpdate(update));
        }
    }

    if ctx.proxy_execute_tool_calls {
        if let Some(router) = ctx.router {
            if let Some(tool_result) = router.handle_tool_call(event, ctx.meta).await? {
                ctx.emit(Emission::ToolResult(tool_result));
            }
        }
    }

    Ok(EventOutcome::passthrough(ctx.suppress_converter_tool_events))
}

fn evaluate_guard(guard: &mut ToolLoopGuard, call: &ToolCall) -> Option<ToolLoopTermination> {
    let decision = guard.evaluate(call);
    if !decision.tracked || !decision.triggered {
        return None;
    }

    warn!(
        tool = %call.function.name,
        fingerprint = %decision.fingerprint,
        repeat_count = decision.repeat_count,
        max_repeat = decision.max_repeat,
        error_class = %decision.error_class,
        "tool loop guard triggered"
    );

    Some(ToolLoopTermination {
        reason: "loop_guard".to_string(),
        message: format!(
            "Tool loop guard stopped repeated failing calls to \"{}\" after {} attempts \
             (limit {}). Adjust tool arguments and retry.",
            call.function.name, decision.repeat_count, decision.max_repeat
        ),
        tool: call.function.name.clone(),
        fingerprint: decision.fingerprint,
        repeat_count: decision.repeat_count,
        max_repeat: decision.max_repeat,
        error_class: decision.error_class.as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use trellis_types::ChatMessage;

    struct StaticMapper(Vec<ToolUpdate>);

    #[async_trait]
    impl EventMapper for StaticMapper {
        async fn map_event(
            &self,
            _event: &ToolCallEvent,
            _session_id: &str,
        ) -> anyhow::Result<Vec<ToolUpdate>> {
            Ok(self.0.clone())
        }
    }

    struct FailingMapper;

    #[async_trait]
    impl EventMapper for FailingMapper {
        async fn map_event(
            &self,
            _event: &ToolCallEvent,
            _session_id: &str,
        ) -> anyhow::Result<Vec<ToolUpdate>> {
            anyhow::bail!("mapper failure")
        }
    }

    struct StaticRouter(ChatCompletionChunk);

    #[async_trait]
    impl ToolResultRouter for StaticRouter {
        async fn handle_tool_call(
            &self,
            _event: &ToolCallEvent,
            _meta: &ResponseMeta,
        ) -> anyhow::Result<Option<ChatCompletionChunk>> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FailingBoundary;

    impl ToolCallBoundary for FailingBoundary {
        fn maybe_extract_tool_call(
            &self,
            _event: &ToolCallEvent,
            _allowed_tool_names: &HashSet<String>,
            _tool_loop_mode: ToolLoopMode,
        ) -> anyhow::Result<Option<ToolCall>> {
            anyhow::bail!("boundary extraction failed")
        }
    }

    fn read_event() -> ToolCallEvent {
        serde_json::from_value(json!({
            "call_id": "c1",
            "tool_call": { "readToolCall": { "args": { "path": "foo.txt" } } },
        }))
        .unwrap()
    }

    fn meta() -> ResponseMeta {
        ResponseMeta {
            id: "resp-1".to_string(),
            created: 123,
            model: "auto".to_string(),
        }
    }

    fn allowed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Emission>) -> Vec<Emission> {
        let mut out = Vec::new();
        while let Ok(emission) = rx.try_recv() {
            out.push(emission);
        }
        out
    }

    struct Fixture {
        allowed: HashSet<String>,
        schemas: HashMap<String, Value>,
        guard: ToolLoopGuard,
        meta: ResponseMeta,
    }

    impl Fixture {
        fn new(allowed_names: &[&str]) -> Self {
            Self {
                allowed: allowed(allowed_names),
                schemas: HashMap::new(),
                guard: ToolLoopGuard::from_history(&[], 3),
                meta: meta(),
            }
        }
    }

    macro_rules! ctx {
        ($fixture:expr, $mapper:expr, $emitter:expr) => {
            InterceptionContext {
                tool_loop_mode: ToolLoopMode::Intercept,
                allowed_tool_names: &$fixture.allowed,
                tool_schema_map: &$fixture.schemas,
                guard: &mut $fixture.guard,
                mapper: $mapper,
                session_id: "session-1",
                emit_tool_updates: false,
                proxy_execute_tool_calls: false,
                suppress_converter_tool_events: false,
                router: None,
                meta: &$fixture.meta,
                emitter: $emitter,
            }
        };
    }

    #[tokio::test]
    async fn legacy_and_v1_intercept_equivalently() {
        let mapper = StaticMapper(Vec::new());
        let event = read_event();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        let mut ctx = ctx!(fixture, &mapper, &tx);
        let legacy = handle_tool_loop_event_legacy(&mut ctx, &event)
            .await
            .unwrap();

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut fixture2 = Fixture::new(&["read"]);
        let mut ctx2 = ctx!(fixture2, &mapper, &tx2);
        let v1 = handle_tool_loop_event_v1(&V1Boundary, &mut ctx2, &event)
            .await
            .unwrap();

        assert_eq!(legacy, EventOutcome::intercepted());
        assert_eq!(v1, legacy);
        for emissions in [drain(&mut rx), drain(&mut rx2)] {
            assert_eq!(emissions.len(), 1);
            let Emission::InterceptedToolCall(call) = &emissions[0] else {
                panic!("expected intercepted tool call");
            };
            assert_eq!(call.function.name, "read");
        }
    }

    #[tokio::test]
    async fn proxy_exec_routes_instead_of_intercepting() {
        let event: ToolCallEvent = serde_json::from_value(json!({
            "call_id": "c2",
            "tool_call": { "bashToolCall": { "args": { "command": "echo ok" } } },
        }))
        .unwrap();
        let mapper = StaticMapper(vec![ToolUpdate {
            tool_call_id: "u1".to_string(),
            status: "pending".to_string(),
            title: None,
        }]);
        let tool_result = ChatCompletionChunk::new(&meta(), trellis_wire::Delta::default(), None);
        let router = StaticRouter(tool_result);

        for mode in [BoundaryMode::Legacy, BoundaryMode::V1] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut fixture = Fixture::new(&["read"]);
            let mut ctx = ctx!(fixture, &mapper, &tx);
            ctx.tool_loop_mode = ToolLoopMode::ProxyExec;
            ctx.emit_tool_updates = true;
            ctx.proxy_execute_tool_calls = true;
            ctx.suppress_converter_tool_events = true;
            ctx.router = Some(&router);

            let outcome =
                handle_tool_loop_event_with_fallback(&V1Boundary, mode, true, &mut ctx, &event)
                    .await
                    .unwrap();
            assert_eq!(outcome, EventOutcome::passthrough(true));

            let emissions = drain(&mut rx);
            assert_eq!(emissions.len(), 2);
            assert!(matches!(emissions[0], Emission::ToolUpdate(_)));
            assert!(matches!(emissions[1], Emission::ToolResult(_)));
        }
    }

    #[tokio::test]
    async fn falls_back_to_legacy_when_boundary_extraction_fails() {
        let mapper = StaticMapper(Vec::new());
        let event = read_event();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        let mut ctx = ctx!(fixture, &mapper, &tx);

        let outcome = handle_tool_loop_event_with_fallback(
            &FailingBoundary,
            BoundaryMode::V1,
            true,
            &mut ctx,
            &event,
        )
        .await
        .unwrap();

        assert_eq!(outcome, EventOutcome::intercepted());
        let emissions = drain(&mut rx);
        assert_eq!(emissions.len(), 2);
        let Emission::FallbackToLegacy { cause } = &emissions[0] else {
            panic!("expected fallback notice first");
        };
        assert_eq!(cause, "boundary extraction failed");
        let Emission::InterceptedToolCall(call) = &emissions[1] else {
            panic!("expected intercepted tool call after fallback");
        };
        assert_eq!(call.function.name, "read");
    }

    #[tokio::test]
    async fn mapper_failures_are_never_eligible_for_fallback() {
        let mapper = FailingMapper;
        let event = read_event();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        let mut ctx = ctx!(fixture, &mapper, &tx);
        ctx.tool_loop_mode = ToolLoopMode::ProxyExec;

        let err =
            handle_tool_loop_event_with_fallback(&V1Boundary, BoundaryMode::V1, true, &mut ctx, &event)
                .await
                .unwrap_err();

        assert_eq!(err.to_string(), "mapper failure");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn legacy_mode_skips_the_v1_path_entirely() {
        let mapper = StaticMapper(Vec::new());
        let event = read_event();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        let mut ctx = ctx!(fixture, &mapper, &tx);

        // A broken v1 boundary must not matter in legacy mode.
        let outcome = handle_tool_loop_event_with_fallback(
            &FailingBoundary,
            BoundaryMode::Legacy,
            true,
            &mut ctx,
            &event,
        )
        .await
        .unwrap();
        assert_eq!(outcome, EventOutcome::intercepted());
    }

    #[tokio::test]
    async fn v1_normalizes_arguments_before_intercepting() {
        let event: ToolCallEvent = serde_json::from_value(json!({
            "call_id": "c3",
            "tool_call": {
                "writeToolCall": { "args": { "filePath": "foo.txt", "contents": "hello" } },
            },
        }))
        .unwrap();
        let mapper = StaticMapper(Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["write"]);
        fixture.schemas.insert(
            "write".to_string(),
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                },
                "required": ["path", "content"],
            }),
        );
        let mut ctx = ctx!(fixture, &mapper, &tx);

        let outcome = handle_tool_loop_event_v1(&V1Boundary, &mut ctx, &event)
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::intercepted());

        let emissions = drain(&mut rx);
        let Emission::InterceptedToolCall(call) = &emissions[0] else {
            panic!("expected intercepted tool call");
        };
        assert!(call.function.arguments.contains("\"path\":\"foo.txt\""));
        assert!(call.function.arguments.contains("\"content\":\"hello\""));
        assert!(!call.function.arguments.contains("filePath"));
    }

    fn failing_read_history() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "tool".to_string(),
            content: Value::String("invalid schema: missing path".to_string()),
            tool_call_id: Some("c1".to_string()),
            ..ChatMessage::default()
        }]
    }

    #[tokio::test]
    async fn guard_trigger_terminates_without_fallback() {
        let mapper = StaticMapper(Vec::new());
        let event = read_event();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        fixture.guard = ToolLoopGuard::from_history(&failing_read_history(), 1);
        fixture.guard.evaluate(&ToolCall::new(
            "c1",
            "read",
            "{\"path\":\"foo.txt\"}".to_string(),
        ));
        let mut ctx = ctx!(fixture, &mapper, &tx);

        let outcome =
            handle_tool_loop_event_with_fallback(&V1Boundary, BoundaryMode::V1, false, &mut ctx, &event)
                .await
                .unwrap();

        assert!(!outcome.intercepted);
        assert!(outcome.skip_converter);
        let termination = outcome.terminate.expect("termination record");
        assert_eq!(termination.reason, "loop_guard");
        assert_eq!(termination.tool, "read");
        assert_eq!(termination.error_class, "validation");
        assert!(termination.message.contains("read"));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn guard_trigger_falls_back_to_legacy_when_enabled() {
        let mapper = StaticMapper(Vec::new());
        let event = read_event();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fixture = Fixture::new(&["read"]);
        fixture.guard = ToolLoopGuard::from_history(&failing_read_history(), 1);
        fixture.guard.evaluate(&ToolCall::new(
            "c1",
            "read",
            "{\"path\":\"foo.txt\"}".to_string(),
        ));
        let mut ctx = ctx!(fixture, &mapper, &tx);

        let outcome =
            handle_tool_loop_event_with_fallback(&V1Boundary, BoundaryMode::V1, true, &mut ctx, &event)
                .await
                .unwrap();
        assert_eq!(outcome, EventOutcome::intercepted());

        let emissions = drain(&mut rx);
        assert_eq!(emissions.len(), 2);
        let Emission::FallbackToLegacy { cause } = &emissions[0] else {
            panic!("expected fallback notice");
        };
        assert!(cause.starts_with("loop guard: read|"));
        let Emission::InterceptedToolCall(call) = &emissions[1] else {
            panic!("expected intercepted tool call after fallback");
        };
        assert_eq!(call.function.name, "read");
    }
}
