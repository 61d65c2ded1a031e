// ABOUTME: ACP backend - one Agent Client Protocol subprocess shared by many sessions.
// ABOUTME: Serves the agent's fs/terminal/permission requests and turns prompts into events.

use crate::backends::acp_events::{derive_tool_kind, derive_tool_name, AcpEventMapper};
use crate::channels::SessionChannels;
use crate::content::{joined_text, ContentBlock};
use crate::error::{AgentError, AgentResult, BackendError, ErrorCode, ProcessError, RpcError};
use crate::event::{EventKind, InsightsEvent, Provider, RawMessage, StatusKind};
use crate::fs_access::FsMediator;
use crate::options::{validate_options, OptionSupportTable, PermissionMode, ReasoningEffort};
use crate::permission::{PermissionDecision, PermissionRequest};
use crate::registry::BackendFactory;
use crate::subscription::{Broadcaster, Subscription};
use crate::terminal::TerminalManager;
use crate::traits::{AgentBackend, AgentSession, BackendFailure, Capabilities, CreateSessionRequest};
use crate::transport::{
    Notification, ProcessLauncher, ProcessSpec, ProcessState, ServerRequest, SystemLauncher,
    Transport, TransportOptions, DEFAULT_REQUEST_TIMEOUT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "acp";

pub const PROTOCOL_VERSION: u64 = 1;

pub const OPTION_SUPPORT: OptionSupportTable = &[
    ("model", true),
    ("permission_mode", true),
    ("reasoning_effort", false),
    ("resume_session_id", true),
    ("system_prompt", false),
    ("allowed_tools", false),
    ("disallowed_tools", false),
    ("max_turns", false),
    ("include_partial_messages", false),
    ("include_raw_events", true),
    ("env", false),
];

/// Configuration for the ACP backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpConfig {
    /// Path to the ACP agent binary (claude-code-acp, codex-acp, gemini --experimental-acp ...)
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub request_timeout_secs: Option<u64>,
}

impl AcpConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            request_timeout_secs: None,
        }
    }
}

fn to_prompt_blocks(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Image { data, mime_type } => {
                json!({"type": "image", "data": data, "mimeType": mime_type})
            }
            ContentBlock::Resource {
                uri,
                text: Some(text),
                mime_type,
            } => json!({
                "type": "resource",
                "resource": {"uri": uri, "text": text, "mimeType": mime_type},
            }),
            ContentBlock::Resource { uri, .. } => {
                json!({"type": "resource_link", "uri": uri, "name": uri})
            }
        })
        .collect()
}

/// Option id matching the first of `kinds` in preference order
fn pick_option<'a>(options: &'a [Value], kinds: &[&str]) -> Option<&'a str> {
    kinds.iter().find_map(|kind| {
        options
            .iter()
            .find(|o| o.get("kind").and_then(|k| k.as_str()) == Some(kind))
            .and_then(|o| o.get("optionId"))
            .and_then(|id| id.as_str())
    })
}

fn permission_outcome(decision: &PermissionDecision, options: &[Value]) -> Value {
    let chosen = match decision {
        PermissionDecision::Allow { .. } => pick_option(options, &["allow_once", "allow_always"]),
        PermissionDecision::Deny { .. } => pick_option(options, &["reject_once", "reject_always"]),
    };
    match chosen {
        Some(option_id) => json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        None => cancelled_outcome(),
    }
}

fn cancelled_outcome() -> Value {
    json!({"outcome": {"outcome": "cancelled"}})
}

struct Shared {
    config: AcpConfig,
    launcher: Arc<dyn ProcessLauncher>,
    transport: OnceCell<Arc<Transport>>,
    sessions: Mutex<HashMap<String, Weak<AcpInner>>>,
    errors: Broadcaster<BackendFailure>,
    cancel: CancellationToken,
}

impl Shared {
    fn session_for(&self, session_id: &str) -> Option<Arc<AcpInner>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .and_then(Weak::upgrade)
    }

    fn register(&self, inner: &Arc<AcpInner>) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(inner.acp_session_id.clone(), Arc::downgrade(inner));
    }

    fn unregister(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    fn live_sessions(&self) -> Vec<Arc<AcpInner>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub struct AcpBackend {
    shared: Arc<Shared>,
}

impl AcpBackend {
    pub fn new(config: AcpConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: AcpConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                transport: OnceCell::new(),
                sessions: Mutex::new(HashMap::new()),
                errors: Broadcaster::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: AcpConfig = serde_json::from_value(config.clone())?;
            Ok(Arc::new(AcpBackend::new(cfg)))
        })
    }

    async fn connect(&self) -> AgentResult<Arc<Transport>> {
        let shared = &self.shared;
        let transport = shared
            .transport
            .get_or_try_init(|| async {
                let config = &shared.config;
                let spec = ProcessSpec::new(&config.binary)
                    .args(config.args.iter().cloned())
                    .args(config.extra_args.iter().cloned())
                    .envs(&config.env);
                let options = TransportOptions {
                    label: NAME.to_string(),
                    request_timeout: config
                        .request_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                };
                let transport = Arc::new(
                    Transport::spawn(shared.launcher.as_ref(), &spec, options).map_err(|e| {
                        BackendError::new(
                            ErrorCode::SessionCreateError,
                            format!("Failed to start {}: {}", config.binary, e),
                        )
                    })?,
                );

                if let Some(requests) = transport.take_server_requests() {
                    tokio::spawn(route_server_requests(
                        Arc::downgrade(shared),
                        Arc::downgrade(&transport),
                        requests,
                    ));
                }
                tokio::spawn(watch_exit(Arc::downgrade(shared), transport.exit_status()));

                let response = transport
                    .send_request(
                        "initialize",
                        json!({
                            "protocolVersion": PROTOCOL_VERSION,
                            "clientCapabilities": {
                                "fs": {"readTextFile": true, "writeTextFile": true},
                                "terminal": true,
                            },
                        }),
                    )
                    .await
                    .map_err(|e| e.into_agent_error(ErrorCode::SessionCreateError))?;
                tracing::info!(
                    binary = %config.binary,
                    protocol_version = ?response.get("protocolVersion"),
                    "ACP agent initialized"
                );
                Ok::<_, AgentError>(transport)
            })
            .await?;
        Ok(transport.clone())
    }

    fn build_session(
        &self,
        transport: &Arc<Transport>,
        acp_session_id: &str,
        cwd: PathBuf,
        include_raw: bool,
    ) -> (Arc<AcpInner>, mpsc::UnboundedReceiver<TurnSignal>) {
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let fs = FsMediator::new(cwd);
        let terminals = TerminalManager::new(fs.root().to_path_buf());
        let inner = Arc::new(AcpInner {
            channels: Arc::new(SessionChannels::new(
                Provider::Acp,
                uuid::Uuid::new_v4().to_string(),
                acp_session_id.to_string(),
                include_raw,
            )),
            transport: transport.clone(),
            shared: Arc::downgrade(&self.shared),
            acp_session_id: acp_session_id.to_string(),
            fs,
            terminals,
            alive: AtomicBool::new(true),
            prompt_active: AtomicBool::new(false),
            permissions: Mutex::new(HashMap::new()),
            turn_tx,
            cancel: CancellationToken::new(),
        });
        self.shared.register(&inner);
        (inner, turn_rx)
    }
}

#[async_trait]
impl AgentBackend for AcpBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn provider(&self) -> Provider {
        Provider::Acp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_model_listing: false,
            supports_reasoning_effort: false,
            supports_hooks: false,
            supports_permission_mode_change: true,
            supports_model_change: true,
        }
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> AgentResult<Arc<dyn AgentSession>> {
        validate_options(NAME, OPTION_SUPPORT, &request.options);
        let transport = self.connect().await?;
        let notifications = transport.subscribe_notifications();
        let options = &request.options;
        let cwd = request.cwd.display().to_string();

        let inner = match &options.resume_session_id {
            Some(resume_id) => {
                // History replay arrives as session/update before the load response
                let (inner, turns) = self.build_session(
                    &transport,
                    resume_id,
                    request.cwd.clone(),
                    options.include_raw_events,
                );
                inner.emit_init(options.model.clone(), &cwd, options.permission_mode);
                tokio::spawn(pump(Arc::downgrade(&inner), notifications, turns, inner.cancel.clone()));

                if let Err(e) = transport
                    .send_request(
                        "session/load",
                        json!({"sessionId": resume_id, "cwd": cwd, "mcpServers": []}),
                    )
                    .await
                {
                    inner.close("Session load failed");
                    return Err(e.into_agent_error(ErrorCode::SessionCreateError));
                }
                inner
            }
            None => {
                let response = transport
                    .send_request("session/new", json!({"cwd": cwd, "mcpServers": []}))
                    .await
                    .map_err(|e| e.into_agent_error(ErrorCode::SessionCreateError))?;
                let acp_session_id = response
                    .get("sessionId")
                    .and_then(|id| id.as_str())
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| ProcessError::new("Invalid session response"))?;
                let model = options.model.clone().or_else(|| {
                    response
                        .get("models")
                        .and_then(|m| m.get("currentModelId"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                });

                let (inner, turns) = self.build_session(
                    &transport,
                    acp_session_id,
                    request.cwd.clone(),
                    options.include_raw_events,
                );
                inner.emit_init(model, &cwd, options.permission_mode);
                tokio::spawn(pump(Arc::downgrade(&inner), notifications, turns, inner.cancel.clone()));
                inner
            }
        };
        tracing::info!(
            session_id = %inner.channels.session_id(),
            acp_session_id = %inner.acp_session_id,
            "ACP session ready"
        );

        let session = AcpSession { inner };
        if let Some(mode) = options.permission_mode.filter(|m| *m != PermissionMode::Default) {
            if let Err(e) = session.set_permission_mode(Some(mode)).await {
                tracing::warn!(error = %e, mode = %mode, "Failed to apply initial mode");
            }
        }
        if let Some(model) = &options.model {
            if let Err(e) = session.set_model(Some(model)).await {
                tracing::warn!(error = %e, model = %model, "Failed to apply initial model");
            }
        }
        if let Some(content) = request.initial_content() {
            if let Err(e) = session.send_with_content(content).await {
                session.inner.close("Failed to send initial prompt");
                return Err(BackendError::new(
                    ErrorCode::SessionCreateError,
                    format!("Failed to send initial prompt: {}", e),
                )
                .into());
            }
        }
        Ok(Arc::new(session))
    }

    fn subscribe_errors(&self) -> Subscription<BackendFailure> {
        self.shared.errors.subscribe()
    }

    async fn dispose(&self) {
        self.shared.cancel.cancel();
        for session in self.shared.live_sessions() {
            session.close("Backend disposed");
        }
        if let Some(transport) = self.shared.transport.get() {
            transport.close();
        }
    }
}

async fn route_server_requests(
    shared: Weak<Shared>,
    transport: Weak<Transport>,
    mut requests: mpsc::UnboundedReceiver<ServerRequest>,
) {
    while let Some(request) = requests.recv().await {
        let (Some(shared), Some(transport)) = (shared.upgrade(), transport.upgrade()) else {
            return;
        };
        let session = request
            .params
            .get("sessionId")
            .and_then(|id| id.as_str())
            .and_then(|id| shared.session_for(id));
        match session {
            // Permission prompts can block for minutes; never stall the router
            Some(session) => {
                tokio::spawn(async move { session.handle_request(request).await });
            }
            None => {
                tracing::warn!(method = %request.method, "Request for unknown ACP session");
                let _ = transport.respond_error(
                    &request.id,
                    RpcError::invalid_params("Unknown session"),
                );
            }
        }
    }
}

async fn watch_exit(shared: Weak<Shared>, mut exit: watch::Receiver<ProcessState>) {
    let state = match exit.wait_for(|s| *s != ProcessState::Running).await {
        Ok(state) => *state,
        Err(_) => return,
    };
    let Some(shared) = shared.upgrade() else { return };
    if shared.cancel.is_cancelled() {
        return;
    }
    tracing::error!(?state, "ACP agent exited");
    shared.errors.send(BackendFailure {
        fatal: true,
        error: AgentError::Process(ProcessError::new(format!("ACP agent exited: {:?}", state))),
    });
    for session in shared.live_sessions() {
        session.close("Agent process exited");
    }
}

enum TurnSignal {
    Begin,
    End {
        stop_reason: Option<String>,
        error: Option<String>,
    },
}

struct AcpInner {
    channels: Arc<SessionChannels>,
    transport: Arc<Transport>,
    shared: Weak<Shared>,
    acp_session_id: String,
    fs: FsMediator,
    terminals: TerminalManager,
    alive: AtomicBool,
    prompt_active: AtomicBool,
    /// Outstanding session/request_permission calls, by JSON-RPC id
    permissions: Mutex<HashMap<String, (Value, PermissionRequest)>>,
    turn_tx: mpsc::UnboundedSender<TurnSignal>,
    cancel: CancellationToken,
}

impl AcpInner {
    fn emit_init(&self, model: Option<String>, cwd: &str, mode: Option<PermissionMode>) {
        self.channels.emit(EventKind::SessionInit {
            resolved_session_id: self.acp_session_id.clone(),
            model,
            cwd: Some(cwd.to_string()),
            tools: Vec::new(),
            permission_mode: mode,
        });
    }

    fn handle_update(&self, notification: &Notification, mapper: &mut AcpEventMapper) {
        let raw = json!({"method": notification.method, "params": notification.params});
        self.channels.record_inbound(&raw);
        if let Some(update) = notification.params.get("update") {
            let events = mapper.map_update(update);
            self.channels.emit_all(events, Some(&raw));
        }
    }

    async fn handle_request(self: Arc<Self>, request: ServerRequest) {
        if request.method == "session/request_permission" {
            self.request_permission(request);
            return;
        }
        let params = &request.params;
        let result = match request.method.as_str() {
            "fs/read_text_file" => self.fs.read_text_file(params, &self.channels).await,
            "fs/write_text_file" => self.fs.write_text_file(params, &self.channels).await,
            "terminal/create" => self.terminals.create(params),
            "terminal/output" => self.terminals.output(params),
            "terminal/wait_for_exit" => self.terminals.wait_for_exit(params).await,
            "terminal/kill" => self.terminals.kill(params),
            "terminal/release" => self.terminals.release(params),
            other => Err(RpcError::method_not_found(other)),
        };

        let sent = match result {
            Ok(value) => self.transport.respond(&request.id, value),
            Err(error) => {
                tracing::debug!(method = %request.method, code = error.code, message = %error.message, "Agent request failed");
                self.transport.respond_error(&request.id, error)
            }
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, method = %request.method, "Failed to answer agent request");
        }
    }

    fn request_permission(self: &Arc<Self>, request: ServerRequest) {
        let params = &request.params;
        let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
        let options: Vec<Value> = params
            .get("options")
            .and_then(|o| o.as_array())
            .cloned()
            .unwrap_or_default();
        let name = derive_tool_name(&tool_call);
        let kind = derive_tool_kind(&tool_call, &name);
        let (permission, pending) = PermissionRequest::new(
            self.channels.session_id(),
            name,
            kind,
            tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
        );
        let permission = permission.with_tool_use_id(
            tool_call
                .get("toolCallId")
                .and_then(|id| id.as_str())
                .map(str::to_string),
        );

        let key = request.id.to_string();
        self.permissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), (request.id.clone(), permission.clone()));
        self.channels.request_permission(permission);

        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let decision = pending.wait().await;
            let still_pending = weak.upgrade().is_some_and(|inner| {
                inner
                    .permissions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key)
                    .is_some()
            });
            let outcome = if still_pending {
                permission_outcome(&decision, &options)
            } else if weak.strong_count() == 0 {
                cancelled_outcome()
            } else {
                // Already answered as cancelled
                return;
            };
            if let Err(e) = transport.respond(&request.id, outcome) {
                tracing::warn!(error = %e, "Failed to answer permission request");
            }
        });
    }

    /// Answer every outstanding permission prompt as cancelled
    fn cancel_permissions(&self, reason: &str) {
        let pending: Vec<(Value, PermissionRequest)> = self
            .permissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for (id, request) in pending {
            request.deny(reason);
            if let Err(e) = self.transport.respond(&id, cancelled_outcome()) {
                tracing::warn!(error = %e, "Failed to cancel permission request");
            }
        }
    }

    fn close(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(acp_session_id = %self.acp_session_id, reason, "Closing ACP session");
        if self.prompt_active.swap(false, Ordering::SeqCst) {
            let _ = self
                .transport
                .send_notification("session/cancel", json!({"sessionId": self.acp_session_id}));
            self.channels
                .emit(EventKind::turn_complete(Some("session_closed".to_string()), true));
        }
        self.cancel.cancel();
        self.cancel_permissions(reason);
        self.terminals.release_all();
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(&self.acp_session_id);
        }
        self.channels.emit(EventKind::SessionStatus {
            status: StatusKind::Exited,
            message: Some(reason.to_string()),
        });
        self.channels.close();
    }
}

impl Drop for AcpInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.terminals.release_all();
    }
}

async fn pump(
    weak: Weak<AcpInner>,
    mut rx: broadcast::Receiver<Notification>,
    mut turns: mpsc::UnboundedReceiver<TurnSignal>,
    cancel: CancellationToken,
) {
    let mut mapper = AcpEventMapper::new();
    loop {
        // Notifications first: a prompt response never overtakes the updates before it
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Ok(notification) => {
                    if notification.method != "session/update" {
                        continue;
                    }
                    let Some(inner) = weak.upgrade() else { return };
                    let target = notification.params.get("sessionId").and_then(|id| id.as_str());
                    if target != Some(inner.acp_session_id.as_str()) {
                        continue;
                    }
                    inner.handle_update(&notification, &mut mapper);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ACP notification pump lagged");
                }
                Err(RecvError::Closed) => return,
            },
            Some(signal) = turns.recv() => {
                let Some(inner) = weak.upgrade() else { return };
                match signal {
                    TurnSignal::Begin => {
                        mapper.begin_turn();
                        inner.channels.emit(EventKind::status(StatusKind::Working));
                    }
                    TurnSignal::End { stop_reason, error } => {
                        inner.prompt_active.store(false, Ordering::SeqCst);
                        inner.channels.emit_all(mapper.finish_turn(stop_reason, error), None);
                    }
                }
            }
        }
    }
}

/// One ACP session on the shared agent process
pub struct AcpSession {
    inner: Arc<AcpInner>,
}

impl AcpSession {
    pub fn acp_session_id(&self) -> &str {
        &self.inner.acp_session_id
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
impl AgentSession for AcpSession {
    fn session_id(&self) -> &str {
        self.inner.channels.session_id()
    }

    fn resolved_session_id(&self) -> String {
        self.inner.channels.resolved_session_id()
    }

    fn provider(&self) -> Provider {
        Provider::Acp
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> AgentResult<()> {
        self.ensure_alive()?;
        if self.inner.prompt_active.swap(true, Ordering::SeqCst) {
            return Err(BackendError::new(
                ErrorCode::SendError,
                "A prompt is already in progress for this session",
            )
            .into());
        }

        let params = json!({
            "sessionId": self.inner.acp_session_id,
            "prompt": to_prompt_blocks(&content),
        });
        self.inner.channels.emit(EventKind::UserInput {
            text: joined_text(&content),
        });
        self.inner
            .channels
            .record_outbound(&json!({"method": "session/prompt", "params": params}));
        let _ = self.inner.turn_tx.send(TurnSignal::Begin);

        // The prompt response only arrives at the end of the turn
        let transport = self.inner.transport.clone();
        let turn_tx = self.inner.turn_tx.clone();
        tokio::spawn(async move {
            let signal = match transport
                .send_request_with_timeout("session/prompt", params, None)
                .await
            {
                Ok(response) => TurnSignal::End {
                    stop_reason: response
                        .get("stopReason")
                        .and_then(|r| r.as_str())
                        .map(str::to_string),
                    error: None,
                },
                Err(e) => TurnSignal::End {
                    stop_reason: None,
                    error: Some(format!("Prompt failed: {}", e)),
                },
            };
            let _ = turn_tx.send(signal);
        });
        Ok(())
    }

    async fn interrupt(&self) -> AgentResult<()> {
        if !self.is_alive() || !self.inner.prompt_active.load(Ordering::SeqCst) {
            tracing::debug!(session_id = %self.session_id(), "Interrupt on idle session ignored");
            return Ok(());
        }
        self.inner.cancel_permissions("Interrupted by user");
        self.inner
            .transport
            .send_notification(
                "session/cancel",
                json!({"sessionId": self.inner.acp_session_id}),
            )
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;
        Ok(())
    }

    async fn kill(&self) -> AgentResult<()> {
        self.inner.close("Session killed");
        Ok(())
    }

    async fn set_model(&self, model: Option<&str>) -> AgentResult<()> {
        self.ensure_alive()?;
        // session/set_model needs a model id; there is no way to ask for the agent's default.
        let Some(model) = model else {
            return Err(BackendError::unsupported("resetting the model").into());
        };
        self.inner
            .transport
            .send_request(
                "session/set_model",
                json!({"sessionId": self.inner.acp_session_id, "modelId": model}),
            )
            .await
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;
        Ok(())
    }

    async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()> {
        self.ensure_alive()?;
        let mode = mode.unwrap_or_default();
        self.inner
            .transport
            .send_request(
                "session/set_mode",
                json!({"sessionId": self.inner.acp_session_id, "modeId": mode.wire_name()}),
            )
            .await
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;
        self.inner.channels.emit(EventKind::SessionStatus {
            status: StatusKind::ModeChanged,
            message: Some(mode.as_str().to_string()),
        });
        Ok(())
    }

    async fn set_reasoning_effort(&self, _effort: Option<ReasoningEffort>) -> AgentResult<()> {
        Err(BackendError::unsupported("reasoning effort").into())
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
