// ABOUTME: App-server backend - one JSON-RPC subprocess multiplexing threads as sessions.
// ABOUTME: Handles the initialize handshake, thread/turn lifecycle, approvals, model listing and rate limits.

use crate::backends::app_server_events::AppServerEventMapper;
use crate::channels::SessionChannels;
use crate::content::{joined_text, ContentBlock};
use crate::error::{AgentError, AgentResult, BackendError, ErrorCode, ProcessError, RpcError};
use crate::event::{EventKind, InsightsEvent, Provider, RawMessage, StatusKind};
use crate::options::{validate_options, OptionSupportTable, PermissionMode, ReasoningEffort};
use crate::permission::{PermissionDecision, PermissionRequest};
use crate::rate_limits::{parse_rate_limits, RateLimitUpdate, RATE_LIMITS_METHOD};
use crate::registry::BackendFactory;
use crate::subscription::{Broadcaster, Subscription};
use crate::tool_kind::ToolKind;
use crate::traits::{
    AgentBackend, AgentSession, BackendFailure, Capabilities, CreateSessionRequest, ModelInfo,
};
use crate::transport::{
    Notification, ProcessLauncher, ProcessSpec, ProcessState, ServerRequest, SystemLauncher,
    Transport, TransportOptions, DEFAULT_REQUEST_TIMEOUT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "app-server";

pub const COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
pub const FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";

pub const OPTION_SUPPORT: OptionSupportTable = &[
    ("model", true),
    ("permission_mode", true),
    ("reasoning_effort", true),
    ("resume_session_id", true),
    ("system_prompt", false),
    ("allowed_tools", false),
    ("disallowed_tools", false),
    ("max_turns", false),
    ("include_partial_messages", false),
    ("include_raw_events", true),
    ("env", false),
];

fn default_binary() -> String {
    "codex".to_string()
}

fn default_args() -> Vec<String> {
    vec!["app-server".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServerConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub request_timeout_secs: Option<u64>,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            request_timeout_secs: None,
        }
    }
}

/// Approval policy and sandbox mode for a permission mode
pub fn approval_settings(mode: PermissionMode) -> (&'static str, &'static str) {
    match mode {
        PermissionMode::Plan => ("on-request", "read-only"),
        PermissionMode::Default => ("on-request", "workspace-write"),
        PermissionMode::AcceptEdits => ("on-failure", "workspace-write"),
        PermissionMode::BypassPermissions => ("never", "danger-full-access"),
    }
}

fn sandbox_policy(sandbox: &str) -> Value {
    match sandbox {
        "read-only" => json!({"type": "readOnly"}),
        "danger-full-access" => json!({"type": "dangerFullAccess"}),
        _ => json!({"type": "workspaceWrite"}),
    }
}

fn to_input_items(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::Image { data, mime_type } => json!({
                "type": "image",
                "url": format!("data:{};base64,{}", mime_type, data),
            }),
            ContentBlock::Resource { uri, text, .. } => json!({
                "type": "text",
                "text": text.clone().unwrap_or_else(|| uri.clone()),
            }),
        })
        .collect()
}

/// Thread a notification belongs to, wherever the method puts it
fn thread_of(params: &Value) -> Option<&str> {
    params
        .get("threadId")
        .or_else(|| params.get("thread").and_then(|t| t.get("id")))
        .or_else(|| params.get("turn").and_then(|t| t.get("threadId")))
        .and_then(|v| v.as_str())
}

fn parse_model(entry: &Value) -> Option<ModelInfo> {
    let id = entry
        .get("id")
        .or_else(|| entry.get("model"))
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())?;
    let efforts = entry
        .get("supportedReasoningEfforts")
        .and_then(|v| v.as_array())
        .map(|efforts| {
            efforts
                .iter()
                .filter_map(|e| {
                    e.as_str()
                        .or_else(|| e.get("reasoningEffort").and_then(|r| r.as_str()))
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    Some(ModelInfo {
        id: id.to_string(),
        display_name: entry
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        description: entry
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        supported_reasoning_efforts: efforts,
        default_reasoning_effort: entry
            .get("defaultReasoningEffort")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        is_default: entry
            .get("isDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

struct Shared {
    config: AppServerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    transport: OnceCell<Arc<Transport>>,
    sessions: Mutex<HashMap<String, Weak<AppServerInner>>>,
    rate_limits: watch::Sender<Option<RateLimitUpdate>>,
    errors: Broadcaster<BackendFailure>,
    models: tokio::sync::Mutex<Option<Vec<ModelInfo>>>,
    cancel: CancellationToken,
}

impl Shared {
    fn session_for(&self, thread_id: &str) -> Option<Arc<AppServerInner>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(thread_id)
            .and_then(Weak::upgrade)
    }

    fn unregister(&self, thread_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id);
    }

    fn live_sessions(&self) -> Vec<Arc<AppServerInner>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub struct AppServerBackend {
    shared: Arc<Shared>,
}

impl AppServerBackend {
    pub fn new(config: AppServerConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: AppServerConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (rate_limits, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                transport: OnceCell::new(),
                sessions: Mutex::new(HashMap::new()),
                rate_limits,
                errors: Broadcaster::new(),
                models: tokio::sync::Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Threads currently routed to a session
    pub fn thread_count(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: AppServerConfig = serde_json::from_value(config.clone())?;
            Ok(Arc::new(AppServerBackend::new(cfg)))
        })
    }

    /// Spawn the subprocess and run the handshake on first use
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
                tokio::spawn(listen_rate_limits(
                    Arc::downgrade(shared),
                    transport.subscribe_notifications(),
                ));
                tokio::spawn(watch_exit(Arc::downgrade(shared), transport.exit_status()));

                transport
                    .send_request(
                        "initialize",
                        json!({
                            "clientInfo": {
                                "name": "insights",
                                "title": "Insights",
                                "version": env!("CARGO_PKG_VERSION"),
                            }
                        }),
                    )
                    .await
                    .map_err(|e| e.into_agent_error(ErrorCode::SessionCreateError))?;
                transport.send_notification("initialized", json!({}))?;
                tracing::info!(binary = %config.binary, "App server initialized");
                Ok::<_, AgentError>(transport)
            })
            .await?;
        Ok(transport.clone())
    }
}

#[async_trait]
impl AgentBackend for AppServerBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn provider(&self) -> Provider {
        Provider::AppServer
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_model_listing: true,
            supports_reasoning_effort: true,
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
        let mode = options.permission_mode.unwrap_or_default();
        let (approval, sandbox) = approval_settings(mode);
        let cwd = request.cwd.display().to_string();

        let (method, mut params) = match &options.resume_session_id {
            Some(thread_id) => ("thread/resume", json!({"threadId": thread_id})),
            None => ("thread/start", json!({})),
        };
        params["cwd"] = json!(cwd);
        params["approvalPolicy"] = json!(approval);
        params["sandbox"] = json!(sandbox);
        if let Some(model) = &options.model {
            params["model"] = json!(model);
        }

        let response = transport
            .send_request(method, params)
            .await
            .map_err(|e| e.into_agent_error(ErrorCode::SessionCreateError))?;
        let thread_id = response
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProcessError::new("Invalid thread response"))?
            .to_string();
        let model = response
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| options.model.clone());

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, thread_id = %thread_id, method, "App server thread ready");

        let channels = Arc::new(SessionChannels::new(
            Provider::AppServer,
            session_id,
            thread_id.clone(),
            options.include_raw_events,
        ));
        let inner = Arc::new(AppServerInner {
            channels,
            transport: transport.clone(),
            shared: Arc::downgrade(&self.shared),
            thread_id: thread_id.clone(),
            alive: AtomicBool::new(true),
            turn: Mutex::new(TurnState {
                turn_id: None,
                model: None,
                effort: options.reasoning_effort,
                mode: None,
            }),
            approvals: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(thread_id.clone(), Arc::downgrade(&inner));

        inner.channels.emit(EventKind::SessionInit {
            resolved_session_id: thread_id,
            model,
            cwd: Some(cwd),
            tools: Vec::new(),
            permission_mode: Some(mode),
        });
        tokio::spawn(pump(
            Arc::downgrade(&inner),
            notifications,
            inner.cancel.clone(),
        ));

        let session = AppServerSession { inner };
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

    async fn list_models(&self) -> AgentResult<Vec<ModelInfo>> {
        let mut cache = self.shared.models.lock().await;
        if let Some(models) = cache.as_ref() {
            return Ok(models.clone());
        }

        let transport = self.connect().await?;
        let mut models = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let response = transport
                .send_request("model/list", params)
                .await
                .map_err(|e| e.into_agent_error(ErrorCode::ProtocolError))?;

            for entry in response
                .get("data")
                .and_then(|d| d.as_array())
                .map(|d| d.as_slice())
                .unwrap_or_default()
            {
                if let Some(model) = parse_model(entry) {
                    if seen_ids.insert(model.id.to_lowercase()) {
                        models.push(model);
                    }
                }
            }

            match response
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
            {
                Some(next) if seen_cursors.insert(next.to_string()) => cursor = Some(next.to_string()),
                _ => break,
            }
        }

        tracing::debug!(count = models.len(), "Listed app server models");
        *cache = Some(models.clone());
        Ok(models)
    }

    fn subscribe_errors(&self) -> Subscription<BackendFailure> {
        self.shared.errors.subscribe()
    }

    fn rate_limits(&self) -> Option<watch::Receiver<Option<RateLimitUpdate>>> {
        Some(self.shared.rate_limits.subscribe())
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
        match request.method.as_str() {
            COMMAND_APPROVAL | FILE_CHANGE_APPROVAL => {
                let session = thread_of(&request.params).and_then(|t| shared.session_for(t));
                match session {
                    Some(session) => session.handle_approval(request),
                    None => {
                        tracing::warn!(method = %request.method, "Approval for unknown thread, declining");
                        if let Err(e) = transport.respond(&request.id, json!({"decision": "decline"})) {
                            tracing::warn!(error = %e, "Failed to decline approval");
                        }
                    }
                }
            }
            other => {
                tracing::warn!(method = other, "Unhandled app server request");
                let _ = transport.respond_error(&request.id, RpcError::method_not_found(other));
            }
        }
    }
}

async fn listen_rate_limits(shared: Weak<Shared>, mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) if notification.method == RATE_LIMITS_METHOD => {
                let Some(shared) = shared.upgrade() else { return };
                if let Some(update) = parse_rate_limits(&notification.params) {
                    tracing::debug!(?update, "Rate limits updated");
                    shared.rate_limits.send_replace(Some(update));
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Rate limit listener lagged");
            }
            Err(RecvError::Closed) => return,
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
    tracing::error!(?state, "App server exited");
    shared.errors.send(BackendFailure {
        fatal: true,
        error: AgentError::Process(ProcessError::new(format!("App server exited: {:?}", state))),
    });
    for session in shared.live_sessions() {
        session.close("App server exited");
    }
}

struct TurnState {
    turn_id: Option<String>,
    /// Overrides applied to the next turn/start
    model: Option<String>,
    effort: Option<ReasoningEffort>,
    mode: Option<PermissionMode>,
}

struct AppServerInner {
    channels: Arc<SessionChannels>,
    transport: Arc<Transport>,
    shared: Weak<Shared>,
    thread_id: String,
    alive: AtomicBool,
    turn: Mutex<TurnState>,
    /// Approval requests awaiting the user, by item id
    approvals: Mutex<HashMap<String, PermissionRequest>>,
    cancel: CancellationToken,
}

impl AppServerInner {
    fn handle_notification(&self, notification: &Notification, mapper: &mut AppServerEventMapper) {
        let raw = json!({"method": notification.method, "params": notification.params});
        self.channels.record_inbound(&raw);

        match notification.method.as_str() {
            "turn/started" => {
                let turn_id = notification
                    .params
                    .get("turn")
                    .and_then(|t| t.get("id"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string);
                if turn_id.is_some() {
                    self.turn.lock().unwrap_or_else(|e| e.into_inner()).turn_id = turn_id;
                }
            }
            "turn/completed" => {
                self.turn.lock().unwrap_or_else(|e| e.into_inner()).turn_id = None;
            }
            _ => {}
        }

        let events = mapper.map(&notification.method, &notification.params);
        self.channels.emit_all(events, Some(&raw));
    }

    fn handle_approval(self: &Arc<Self>, request: ServerRequest) {
        let params = &request.params;
        let item_id = params
            .get("itemId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let (tool_name, kind, input) = if request.method == COMMAND_APPROVAL {
            (
                "commandExecution",
                ToolKind::Execute,
                json!({"command": params.get("command"), "cwd": params.get("cwd")}),
            )
        } else {
            (
                "fileChange",
                ToolKind::Edit,
                json!({"changes": params.get("changes"), "grantRoot": params.get("grantRoot")}),
            )
        };
        let (permission, pending) =
            PermissionRequest::new(self.channels.session_id(), tool_name, kind, input);
        let permission = permission
            .with_tool_use_id(item_id.clone())
            .with_reason(
                params
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            );

        let key = item_id.unwrap_or_else(|| request.id.to_string());
        self.approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), permission.clone());
        self.channels.request_permission(permission);

        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let decision = pending.wait().await;
            if let Some(inner) = weak.upgrade() {
                inner
                    .approvals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            }
            let answer = match decision {
                PermissionDecision::Allow { .. } => "accept",
                PermissionDecision::Deny { .. } => "decline",
            };
            if let Err(e) = transport.respond(&request.id, json!({"decision": answer})) {
                tracing::warn!(error = %e, "Failed to answer approval request");
            }
        });
    }

    fn deny_approvals(&self, reason: &str) {
        let pending: Vec<PermissionRequest> = self
            .approvals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, r)| r)
            .collect();
        for request in pending {
            request.deny(reason);
        }
    }

    /// End the session locally: deny approvals, stop the pump, close streams
    fn close(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(thread_id = %self.thread_id, reason, "Closing app server session");
        self.cancel.cancel();
        self.deny_approvals(reason);
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(&self.thread_id);
        }
        let turn_open = self
            .turn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .turn_id
            .take()
            .is_some();
        if turn_open {
            self.channels
                .emit(EventKind::turn_complete(Some("session_closed".to_string()), true));
        }
        self.channels.emit(EventKind::SessionStatus {
            status: StatusKind::Exited,
            message: Some(reason.to_string()),
        });
        self.channels.close();
    }
}

async fn pump(
    weak: Weak<AppServerInner>,
    mut rx: broadcast::Receiver<Notification>,
    cancel: CancellationToken,
) {
    let mut mapper = AppServerEventMapper::new();
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => received,
        };
        match received {
            Ok(notification) => {
                let Some(inner) = weak.upgrade() else { return };
                if thread_of(&notification.params) != Some(inner.thread_id.as_str()) {
                    continue;
                }
                inner.handle_notification(&notification, &mut mapper);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session notification pump lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// One app-server thread
pub struct AppServerSession {
    inner: Arc<AppServerInner>,
}

impl AppServerSession {
    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
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
impl AgentSession for AppServerSession {
    fn session_id(&self) -> &str {
        self.inner.channels.session_id()
    }

    fn resolved_session_id(&self) -> String {
        self.inner.channels.resolved_session_id()
    }

    fn provider(&self) -> Provider {
        Provider::AppServer
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> AgentResult<()> {
        self.ensure_alive()?;
        let mut params = json!({
            "threadId": self.inner.thread_id,
            "input": to_input_items(&content),
        });
        {
            let mut turn = self.inner.turn.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(model) = turn.model.take() {
                params["model"] = json!(model);
            }
            if let Some(effort) = turn.effort {
                params["effort"] = json!(effort.as_str());
            }
            if let Some(mode) = turn.mode.take() {
                let (approval, sandbox) = approval_settings(mode);
                params["approvalPolicy"] = json!(approval);
                params["sandboxPolicy"] = sandbox_policy(sandbox);
            }
        }

        self.inner.channels.emit(EventKind::UserInput {
            text: joined_text(&content),
        });
        self.inner
            .channels
            .record_outbound(&json!({"method": "turn/start", "params": params}));
        let response = self
            .inner
            .transport
            .send_request("turn/start", params)
            .await
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;

        if let Some(turn_id) = response
            .get("turn")
            .and_then(|t| t.get("id"))
            .and_then(|id| id.as_str())
        {
            self.inner
                .turn
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .turn_id = Some(turn_id.to_string());
        }
        Ok(())
    }

    async fn interrupt(&self) -> AgentResult<()> {
        let turn_id = self
            .inner
            .turn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .turn_id
            .clone();
        let Some(turn_id) = turn_id.filter(|_| self.is_alive()) else {
            tracing::debug!(session_id = %self.session_id(), "Interrupt on idle thread ignored");
            return Ok(());
        };
        self.inner
            .transport
            .send_request(
                "turn/interrupt",
                json!({"threadId": self.inner.thread_id, "turnId": turn_id}),
            )
            .await
            .map_err(|e| BackendError::new(ErrorCode::SendError, e.to_string()))?;
        Ok(())
    }

    async fn kill(&self) -> AgentResult<()> {
        self.inner.close("Session killed");
        Ok(())
    }

    async fn set_model(&self, model: Option<&str>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.turn.lock().unwrap_or_else(|e| e.into_inner()).model = model.map(str::to_string);
        Ok(())
    }

    async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.turn.lock().unwrap_or_else(|e| e.into_inner()).mode = mode;
        self.inner.channels.emit(EventKind::SessionStatus {
            status: StatusKind::ModeChanged,
            message: Some(mode.unwrap_or_default().as_str().to_string()),
        });
        Ok(())
    }

    async fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.turn.lock().unwrap_or_else(|e| e.into_inner()).effort = effort;
        Ok(())
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
