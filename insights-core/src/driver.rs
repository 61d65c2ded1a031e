// ABOUTME: Drives one conversation against a backend session: start, send, interrupt, permissions.
// ABOUTME: Pump tasks fold session events into the Conversation and re-broadcast them to the UI.

use crate::conversation::{Conversation, ConversationState};
use insights_agent::{
    AgentBackend, AgentResult, AgentSession, BackendError, Broadcaster, CreateSessionRequest,
    InsightsEvent, ModelInfo, PermissionMode, ReasoningEffort, SessionOptions, Subscription,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Text that asks for a fresh session instead of being sent to the agent
pub const CLEAR_COMMAND: &str = "/clear";

struct ActiveSession {
    session: Arc<dyn AgentSession>,
    pumps: CancellationToken,
}

/// How the last session was started, reused when a fresh one is needed
#[derive(Clone)]
struct StartParams {
    backend: Arc<dyn AgentBackend>,
    cwd: PathBuf,
    options: SessionOptions,
}

pub struct ConversationDriver {
    conversation: Arc<Mutex<Conversation>>,
    active: Mutex<Option<ActiveSession>>,
    params: Mutex<Option<StartParams>>,
    events: Arc<Broadcaster<InsightsEvent>>,
}

impl Default for ConversationDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationDriver {
    pub fn new() -> Self {
        Self {
            conversation: Arc::new(Mutex::new(Conversation::new())),
            active: Mutex::new(None),
            params: Mutex::new(None),
            events: Arc::new(Broadcaster::new()),
        }
    }

    /// Lock the conversation state for reading or direct manipulation
    pub fn conversation(&self) -> MutexGuard<'_, Conversation> {
        self.conversation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConversationState {
        self.conversation().state()
    }

    /// Session events after they were applied to the conversation
    pub fn subscribe_events(&self) -> Subscription<InsightsEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> Option<Arc<dyn AgentSession>> {
        self.lock_active().as_ref().map(|a| a.session.clone())
    }

    /// Create a session on the backend, optionally with a first prompt.
    /// Failures are logged to the conversation and returned.
    pub async fn start(
        &self,
        backend: Arc<dyn AgentBackend>,
        prompt: Option<&str>,
        cwd: impl Into<PathBuf>,
        options: SessionOptions,
    ) -> AgentResult<()> {
        let params = StartParams {
            backend,
            cwd: cwd.into(),
            options,
        };
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = Some(params.clone());
        self.start_with(params, prompt).await
    }

    async fn start_with(&self, params: StartParams, prompt: Option<&str>) -> AgentResult<()> {
        self.stop_current().await;

        let mut request = CreateSessionRequest::new(params.cwd).with_options(params.options);
        if let Some(prompt) = prompt {
            request = request.with_prompt(prompt);
            self.conversation().begin_turn();
        }

        tracing::info!(backend = %params.backend.name(), "Starting session");
        match params.backend.create_session(request).await {
            Ok(session) => {
                tracing::info!(
                    session_id = %session.session_id(),
                    resolved_session_id = %session.resolved_session_id(),
                    "Session started"
                );
                let pumps = CancellationToken::new();
                self.spawn_pumps(session.as_ref(), pumps.clone());
                *self.lock_active() = Some(ActiveSession { session, pumps });
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start session");
                self.conversation()
                    .fail(format!("Failed to start session: {}", e));
                Err(e)
            }
        }
    }

    /// Send user text. "/clear" resets the conversation instead of reaching the agent.
    pub async fn send(&self, text: &str) -> AgentResult<()> {
        if text.trim() == CLEAR_COMMAND {
            self.clear().await;
            return Ok(());
        }

        let session = self.session().filter(|s| s.is_alive());
        let Some(session) = session else {
            let params = self.params.lock().unwrap_or_else(|e| e.into_inner()).clone();
            return match params {
                Some(params) => self.start_with(params, Some(text)).await,
                None => {
                    let error = BackendError::session_closed();
                    self.conversation()
                        .fail(format!("Failed to send message: {}", error));
                    Err(error.into())
                }
            };
        };

        self.conversation().begin_turn();
        if let Err(e) = session.send(text).await {
            tracing::error!(session_id = %session.session_id(), error = %e, "Failed to send message");
            self.conversation()
                .fail(format!("Failed to send message: {}", e));
            return Err(e);
        }
        Ok(())
    }

    /// Drop the current session and start the conversation afresh on the next send
    pub async fn clear(&self) {
        self.stop_current().await;
        self.conversation().reset_session();
        tracing::info!("Conversation cleared");
    }

    /// Stop the running turn. Local state changes first, then the backend is told best-effort.
    pub async fn interrupt(&self) -> bool {
        if !self.conversation().interrupt() {
            return false;
        }
        if let Some(session) = self.session() {
            if let Err(e) = session.interrupt().await {
                tracing::warn!(session_id = %session.session_id(), error = %e, "Interrupt failed");
            }
        }
        true
    }

    pub fn allow_permission(&self, updated_input: Option<Value>) -> bool {
        self.conversation().allow_permission(updated_input)
    }

    pub fn deny_permission(&self, reason: &str) -> bool {
        self.conversation().deny_permission(reason)
    }

    /// `None` returns to the backend default
    pub async fn set_model(&self, model: Option<&str>) -> AgentResult<()> {
        self.require_session()?.set_model(model).await
    }

    pub async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()> {
        self.require_session()?.set_permission_mode(mode).await
    }

    pub async fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> AgentResult<()> {
        self.require_session()?.set_reasoning_effort(effort).await
    }

    pub async fn list_models(&self) -> AgentResult<Vec<ModelInfo>> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match params {
            Some(params) => params.backend.list_models().await,
            None => Err(BackendError::session_closed().into()),
        }
    }

    /// Kill the session and stop forwarding its events
    pub async fn shutdown(&self) {
        self.stop_current().await;
        self.events.close();
    }

    fn require_session(&self) -> AgentResult<Arc<dyn AgentSession>> {
        self.session()
            .ok_or_else(|| BackendError::session_closed().into())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn stop_current(&self) {
        let previous = self.lock_active().take();
        if let Some(previous) = previous {
            previous.pumps.cancel();
            if let Err(e) = previous.session.kill().await {
                tracing::warn!(
                    session_id = %previous.session.session_id(),
                    error = %e,
                    "Failed to kill previous session"
                );
            }
        }
    }

    fn spawn_pumps(&self, session: &dyn AgentSession, cancel: CancellationToken) {
        let mut events = session.subscribe_events();
        let conversation = self.conversation.clone();
        let forward = self.events.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                conversation
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply_event(&event);
                forward.send(event);
            }
            tracing::debug!("Event pump stopped");
        });

        let mut permissions = session.subscribe_permission_requests();
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = permissions.recv() => request,
                };
                let Some(request) = request else { break };
                conversation
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .add_pending_permission(request.clone());

                // The backend can resolve a request on its own (agent-side cancel).
                let conversation = conversation.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = request.resolved() => {
                            conversation
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .prune_resolved_permissions();
                        }
                    }
                });
            }
            tracing::debug!("Permission pump stopped");
        });
    }
}
