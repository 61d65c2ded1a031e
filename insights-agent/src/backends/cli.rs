// ABOUTME: CLI backend - spawns claude with --print and stream-json on both stdin and stdout.
// ABOUTME: One subprocess per session, with the stdio control protocol for permissions and mutators.

use crate::backends::cli_events::ClaudeEventMapper;
use crate::channels::SessionChannels;
use crate::content::{joined_text, ContentBlock};
use crate::error::{AgentError, AgentResult, BackendError, ErrorCode, ProcessError};
use crate::event::{EventKind, InsightsEvent, Provider, RawMessage, StatusKind, TextKind};
use crate::options::{
    validate_options, OptionSupportTable, PermissionMode, ReasoningEffort, SessionOptions,
};
use crate::permission::{PermissionDecision, PermissionRequest};
use crate::registry::BackendFactory;
use crate::subscription::{Broadcaster, Subscription};
use crate::tool_kind::{classify, CLAUDE_TOOLS};
use crate::traits::{AgentBackend, AgentSession, BackendFailure, Capabilities, CreateSessionRequest};
use crate::transport::{LineProcess, ProcessLauncher, ProcessSpec, ProcessState, SystemLauncher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const NAME: &str = "cli";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr line the CLI prints when --resume points at a missing session
const ORPHANED_SESSION_MARKER: &str = "No conversation found with session ID";

pub const OPTION_SUPPORT: OptionSupportTable = &[
    ("model", true),
    ("permission_mode", true),
    ("reasoning_effort", true),
    ("resume_session_id", true),
    ("system_prompt", true),
    ("allowed_tools", true),
    ("disallowed_tools", true),
    ("max_turns", true),
    ("include_partial_messages", true),
    ("include_raw_events", true),
    ("env", true),
];

fn default_binary() -> String {
    "claude".to_string()
}

/// Configuration for the CLI backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to the claude binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Appended after the generated flags
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Command-line flags for a session
pub fn build_args(config: &CliConfig, session_id: &str, options: &SessionOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--permission-prompt-tool",
        "stdio",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(mode) = options.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.wire_name().to_string());
    }
    // Only use --resume for existing sessions, not new ones
    match &options.resume_session_id {
        Some(resume) => {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        None => {
            args.push("--session-id".to_string());
            args.push(session_id.to_string());
        }
    }
    if let Some(prompt) = &options.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(options.allowed_tools.join(","));
    }
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(options.disallowed_tools.join(","));
    }
    if let Some(max_turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    if options.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args
}

/// Convert content blocks to Claude message content
fn to_message_content(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Image { data, mime_type } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data}
            }),
            ContentBlock::Resource { uri, text, .. } => json!({
                "type": "text",
                "text": match text {
                    Some(text) => format!("<resource uri=\"{}\">\n{}\n</resource>", uri, text),
                    None => format!("<resource uri=\"{}\" />", uri),
                }
            }),
        })
        .collect()
}

pub struct CliBackend {
    config: CliConfig,
    launcher: Arc<dyn ProcessLauncher>,
    sessions: Mutex<Vec<Weak<CliInner>>>,
    errors: Arc<Broadcaster<BackendFailure>>,
}

impl CliBackend {
    pub fn new(config: CliConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: CliConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            launcher,
            sessions: Mutex::new(Vec::new()),
            errors: Arc::new(Broadcaster::new()),
        }
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: CliConfig = serde_json::from_value(config.clone())?;
            Ok(Arc::new(CliBackend::new(cfg)))
        })
    }

    fn build_spec(&self, session_id: &str, request: &CreateSessionRequest) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.binary)
            .args(build_args(&self.config, session_id, &request.options))
            .cwd(&request.cwd)
            .envs(&self.config.env)
            .envs(&request.options.env);
        if let Some(effort) = request.options.reasoning_effort {
            spec.env.insert(
                "MAX_THINKING_TOKENS".to_string(),
                effort.thinking_tokens().to_string(),
            );
        }
        spec
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn provider(&self) -> Provider {
        Provider::ClaudeCli
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_model_listing: false,
            supports_reasoning_effort: true,
            supports_hooks: true,
            supports_permission_mode_change: true,
            supports_model_change: true,
        }
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> AgentResult<Arc<dyn AgentSession>> {
        validate_options(NAME, OPTION_SUPPORT, &request.options);

        let session_id = uuid::Uuid::new_v4().to_string();
        let resolved = request
            .options
            .resume_session_id
            .clone()
            .unwrap_or_else(|| session_id.clone());
        let spec = self.build_spec(&session_id, &request);

        let launched = self.launcher.launch(&spec).map_err(|e| {
            BackendError::new(
                ErrorCode::SessionCreateError,
                format!("Failed to start {}: {}", self.config.binary, e),
            )
        })?;

        tracing::info!(session_id = %session_id, resolved = %resolved, cwd = %request.cwd.display(), "Starting CLI session");
        let (process, lines) = LineProcess::start(format!("cli:{}", session_id), launched);
        let channels = Arc::new(SessionChannels::new(
            Provider::ClaudeCli,
            session_id,
            resolved,
            request.options.include_raw_events,
        ));
        let session = CliSession::start(channels, process, lines, self.errors.clone());

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&session.inner));

        if let Some(content) = request.initial_content() {
            session.send_with_content(content).await.map_err(|e| {
                BackendError::new(
                    ErrorCode::SessionCreateError,
                    format!("Failed to send initial prompt: {}", e),
                )
            })?;
        }

        Ok(Arc::new(session))
    }

    fn subscribe_errors(&self) -> Subscription<BackendFailure> {
        self.errors.subscribe()
    }

    async fn dispose(&self) {
        let sessions: Vec<Weak<CliInner>> =
            std::mem::take(&mut *self.sessions.lock().unwrap_or_else(|e| e.into_inner()));
        for inner in sessions.iter().filter_map(Weak::upgrade) {
            inner.kill("Backend disposed");
        }
    }
}

type ControlReply = oneshot::Sender<Result<Value, String>>;

struct CliInner {
    channels: Arc<SessionChannels>,
    process: LineProcess,
    alive: AtomicBool,
    turn_active: AtomicBool,
    finished: AtomicBool,
    killed: AtomicBool,
    next_control_id: AtomicU64,
    /// Our control requests awaiting the CLI's control_response
    outbound: Mutex<HashMap<String, ControlReply>>,
    /// The CLI's can_use_tool requests awaiting the user
    inbound: Mutex<HashMap<String, PermissionRequest>>,
    errors: Arc<Broadcaster<BackendFailure>>,
}

impl CliInner {
    fn write(&self, message: &Value) -> Result<(), ProcessError> {
        self.channels.record_outbound(message);
        self.process.write_line(message.to_string())
    }

    fn handle_line(self: &Arc<Self>, line: &str, mapper: &mut ClaudeEventMapper) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(session_id = %self.channels.session_id(), error = %e, line = trimmed, "Non-JSON line from CLI");
                return;
            }
        };
        self.channels.record_inbound(&message);

        match message.get("type").and_then(|t| t.as_str()) {
            Some("control_request") => self.handle_control_request(&message),
            Some("control_response") => self.handle_control_response(&message),
            Some("control_cancel_request") => {
                if let Some(id) = message.get("request_id").and_then(|v| v.as_str()) {
                    let request = self
                        .inbound
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(id);
                    if let Some(request) = request {
                        tracing::debug!(request_id = id, "CLI cancelled permission request");
                        request.deny("Cancelled by agent");
                    }
                }
            }
            _ => {
                let events = mapper.map(&message);
                if events
                    .iter()
                    .any(|e| matches!(e, EventKind::TurnComplete { .. }))
                {
                    self.turn_active.store(false, Ordering::SeqCst);
                }
                self.channels.emit_all(events, Some(&message));
            }
        }
    }

    fn handle_control_request(self: &Arc<Self>, message: &Value) {
        let Some(request_id) = message.get("request_id").and_then(|v| v.as_str()) else {
            tracing::warn!("control_request without request_id");
            return;
        };
        let request = message.get("request").cloned().unwrap_or(Value::Null);
        let subtype = request.get("subtype").and_then(|s| s.as_str()).unwrap_or("");

        if subtype != "can_use_tool" {
            tracing::warn!(subtype, "Unsupported control request from CLI");
            let reply = json!({
                "type": "control_response",
                "response": {
                    "subtype": "error",
                    "request_id": request_id,
                    "error": format!("Unsupported control request: {}", subtype),
                }
            });
            if let Err(e) = self.write(&reply) {
                tracing::warn!(error = %e, "Failed to answer control request");
            }
            return;
        }

        let tool_name = request
            .get("tool_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let input = request.get("input").cloned().unwrap_or(json!({}));
        let reason = request
            .get("decision_reason")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                request
                    .get("blocked_path")
                    .and_then(|v| v.as_str())
                    .map(|p| format!("Access to {}", p))
            });
        let (permission, pending) = PermissionRequest::new(
            self.channels.session_id(),
            tool_name.clone(),
            classify(CLAUDE_TOOLS, &tool_name),
            input.clone(),
        );
        let permission = permission
            .with_tool_use_id(
                request
                    .get("tool_use_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            )
            .with_reason(reason);

        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), permission.clone());
        self.channels.request_permission(permission);

        let weak = Arc::downgrade(self);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let decision = pending.wait().await;
            let Some(inner) = weak.upgrade() else { return };
            let still_pending = inner
                .inbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id)
                .is_some();
            if !still_pending {
                return;
            }
            let response = match decision {
                PermissionDecision::Allow { updated_input } => json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.unwrap_or(input),
                }),
                PermissionDecision::Deny { reason } => json!({
                    "behavior": "deny",
                    "message": reason,
                }),
            };
            let reply = json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": response,
                }
            });
            if let Err(e) = inner.write(&reply) {
                tracing::warn!(error = %e, "Failed to answer permission request");
            }
        });
    }

    fn handle_control_response(&self, message: &Value) {
        let Some(response) = message.get("response") else {
            return;
        };
        let Some(request_id) = response.get("request_id").and_then(|v| v.as_str()) else {
            return;
        };
        let waiter = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        let Some(waiter) = waiter else {
            tracing::warn!(request_id, "control_response for unknown request");
            return;
        };
        let outcome = match response.get("subtype").and_then(|s| s.as_str()) {
            Some("error") => Err(response
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("Control request failed")
                .to_string()),
            _ => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
    }

    async fn send_control(&self, request: Value) -> AgentResult<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BackendError::session_closed().into());
        }
        let n = self.next_control_id.fetch_add(1, Ordering::SeqCst);
        let request_id = format!("req_{}_{}", n, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let (tx, rx) = oneshot::channel();
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);

        let message = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        if let Err(e) = self.write(&message) {
            self.outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(BackendError::new(ErrorCode::SendError, e.to_string()).into());
        }

        match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(BackendError::new(ErrorCode::SendError, message).into()),
            Ok(Err(_)) => Err(BackendError::session_closed().into()),
            Err(_) => {
                self.outbound
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                Err(BackendError::new(ErrorCode::Timeout, "Control request timed out").into())
            }
        }
    }

    fn deny_inbound(&self, reason: &str) {
        let pending: Vec<PermissionRequest> = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, r)| r)
            .collect();
        for request in pending {
            request.deny(reason);
        }
    }

    /// Close the session's streams once, whichever of kill/EOF comes first
    fn finish(&self, closing: Vec<EventKind>, message: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.deny_inbound(message);
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.channels.emit_all(closing, None);
        self.channels.emit(EventKind::SessionStatus {
            status: StatusKind::Exited,
            message: Some(message.to_string()),
        });
        self.channels.close();
    }

    fn kill(&self, reason: &str) {
        tracing::info!(session_id = %self.channels.session_id(), reason, "Killing CLI session");
        self.killed.store(true, Ordering::SeqCst);
        self.process.kill();
        self.finish(Vec::new(), reason);
    }

    fn on_eof(&self, mapper: &mut ClaudeEventMapper) {
        let mut closing = mapper.cancel_open_tools();
        if self.turn_active.swap(false, Ordering::SeqCst) {
            closing.push(EventKind::text(TextKind::Error, "CLI process exited"));
            closing.push(EventKind::turn_complete(Some("process_exited".to_string()), true));
        }
        if !self.killed.load(Ordering::SeqCst) {
            let code = match self.process.state() {
                ProcessState::Exited { code } => code,
                _ => None,
            };
            if code.is_some_and(|c| c != 0) {
                self.errors.send(BackendFailure {
                    fatal: false,
                    error: AgentError::Process(ProcessError::new(format!(
                        "CLI session {} exited with code {:?}",
                        self.channels.session_id(),
                        code
                    ))),
                });
            }
        }
        self.finish(closing, "CLI exited");
    }
}

async fn read_loop(weak: Weak<CliInner>, mut lines: mpsc::UnboundedReceiver<String>) {
    let mut mapper = ClaudeEventMapper::new();
    while let Some(line) = lines.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        inner.handle_line(&line, &mut mapper);
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_eof(&mut mapper);
    }
}

/// Report a missing --resume target as an error event
async fn watch_stderr(weak: Weak<CliInner>, mut logs: tokio::sync::broadcast::Receiver<String>) {
    while let Ok(line) = logs.recv().await {
        if line.contains(ORPHANED_SESSION_MARKER) {
            let Some(inner) = weak.upgrade() else { return };
            tracing::warn!(session_id = %inner.channels.session_id(), "Detected orphaned session");
            inner
                .channels
                .emit(EventKind::text(TextKind::Error, format!("Session not found: {}", line)));
        }
    }
}

/// One CLI subprocess
pub struct CliSession {
    inner: Arc<CliInner>,
}

impl CliSession {
    fn start(
        channels: Arc<SessionChannels>,
        process: LineProcess,
        lines: mpsc::UnboundedReceiver<String>,
        errors: Arc<Broadcaster<BackendFailure>>,
    ) -> Self {
        let logs = process.subscribe_logs();
        let inner = Arc::new(CliInner {
            channels,
            process,
            alive: AtomicBool::new(true),
            turn_active: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            next_control_id: AtomicU64::new(1),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            errors,
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), lines));
        tokio::spawn(watch_stderr(Arc::downgrade(&inner), logs));
        Self { inner }
    }

    fn ensure_alive(&self) -> AgentResult<()> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::session_closed().into())
        }
    }
}

#[async_trait]
impl AgentSession for CliSession {
    fn session_id(&self) -> &str {
        self.inner.channels.session_id()
    }

    fn resolved_session_id(&self) -> String {
        self.inner.channels.resolved_session_id()
    }

    fn provider(&self) -> Provider {
        Provider::ClaudeCli
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> AgentResult<()> {
        self.ensure_alive()?;
        let message = json!({
            "type": "user",
            "message": {"role": "user", "content": to_message_content(&content)},
            "parent_tool_use_id": null,
            "session_id": self.resolved_session_id(),
        });
        self.inner.channels.emit(EventKind::UserInput {
            text: joined_text(&content),
        });
        self.inner
            .write(&message)
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;
        self.inner.turn_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&self) -> AgentResult<()> {
        if !self.is_alive() || !self.inner.turn_active.load(Ordering::SeqCst) {
            tracing::debug!(session_id = %self.session_id(), "Interrupt on idle session ignored");
            return Ok(());
        }
        self.inner
            .send_control(json!({"subtype": "interrupt"}))
            .await
            .map(|_| ())
    }

    async fn kill(&self) -> AgentResult<()> {
        self.inner.kill("Session killed");
        Ok(())
    }

    async fn set_model(&self, model: Option<&str>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner
            .send_control(json!({"subtype": "set_model", "model": model}))
            .await
            .map(|_| ())
    }

    async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()> {
        self.ensure_alive()?;
        let mode = mode.unwrap_or_default();
        self.inner
            .send_control(json!({"subtype": "set_permission_mode", "mode": mode.wire_name()}))
            .await?;
        self.inner.channels.emit(EventKind::SessionStatus {
            status: StatusKind::ModeChanged,
            message: Some(mode.as_str().to_string()),
        });
        Ok(())
    }

    async fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner
            .send_control(json!({
                "subtype": "set_max_thinking_tokens",
                "max_thinking_tokens": effort.map(|e| e.thinking_tokens()),
            }))
            .await
            .map(|_| ())
    }

    fn subscribe_messages(&self) -> Subscription<RawMessage> {
        self.inner.channels.subscribe_messages()
    }

    fn subscribe_events(&self) -> Subscription<InsightsEvent> {
        self.inner.channels.subscribe_events()
    }

    fn subscribe_permission_requests(&self) -> Subscription<PermissionRequest> {
        self.inner.channels.subscribe_permission_requests()
    }
}
