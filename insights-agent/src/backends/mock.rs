// ABOUTME: Mock backend for testing - replays scripted events and permission prompts per prompt.
// ABOUTME: Allows deterministic tests of the conversation layer without spawning agent processes.
//!
//! # Example
//!
//! ```no_run
//! use insights_agent::backends::mock::{MockBackend, MockStep};
//! use insights_agent::{AgentBackend, CreateSessionRequest, EventKind, ToolKind};
//! use serde_json::json;
//!
//! # async fn example() {
//! let mock = MockBackend::new()
//!     .on_prompt("hello").respond_text("Hi there!")
//!     .on_prompt("delete").respond_steps(vec![
//!         MockStep::permission("Bash", ToolKind::Execute, json!({"command": "rm -rf build"})),
//!         MockStep::Event(EventKind::turn_complete(Some("end_turn".into()), false)),
//!     ]);
//!
//! let session = mock.create_session(CreateSessionRequest::new("/tmp")).await.unwrap();
//! let mut events = session.subscribe_events();
//! session.send("hello").await.unwrap();
//! while let Some(event) = events.recv().await {
//!     if let EventKind::Text { text, .. } = event.kind {
//!         assert_eq!(text, "Hi there!");
//!         break;
//!     }
//! }
//! # }
//! ```

use crate::channels::SessionChannels;
use crate::content::{joined_text, ContentBlock};
use crate::error::{AgentError, AgentResult, BackendError, ErrorCode};
use crate::event::{EventKind, InsightsEvent, Provider, RawMessage, StatusKind, TextKind};
use crate::options::{PermissionMode, ReasoningEffort};
use crate::permission::{PermissionDecision, PermissionRequest};
use crate::registry::BackendFactory;
use crate::subscription::{Broadcaster, Subscription};
use crate::tool_kind::ToolKind;
use crate::traits::{
    AgentBackend, AgentSession, BackendFailure, Capabilities, CreateSessionRequest, ModelInfo,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted action of a mock turn
#[derive(Debug, Clone)]
pub enum MockStep {
    Event(EventKind),
    /// Ask for permission and wait for the decision before continuing
    Permission {
        tool_name: String,
        tool_kind: ToolKind,
        input: Value,
        tool_use_id: Option<String>,
    },
    Delay(Duration),
}

impl MockStep {
    pub fn permission(tool_name: &str, tool_kind: ToolKind, input: Value) -> Self {
        MockStep::Permission {
            tool_name: tool_name.to_string(),
            tool_kind,
            input,
            tool_use_id: None,
        }
    }
}

/// Everything sessions of a mock backend were asked to do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockRecord {
    pub prompts: Vec<String>,
    pub interrupts: usize,
    pub kills: usize,
    pub models: Vec<Option<String>>,
    pub modes: Vec<Option<PermissionMode>>,
    pub efforts: Vec<Option<ReasoningEffort>>,
    pub decisions: Vec<PermissionDecision>,
}

struct Expectation {
    pattern: String,
    steps: Vec<MockStep>,
}

#[derive(Default)]
struct MockState {
    expectations: Mutex<VecDeque<Expectation>>,
    record: Mutex<MockRecord>,
    create_error: Mutex<Option<String>>,
    session_counter: AtomicU64,
    sessions: Mutex<Vec<Weak<MockInner>>>,
}

impl MockState {
    /// FIFO preference: the front expectation if it matches, else the first match anywhere
    fn take_steps(&self, text: &str) -> Option<Vec<MockStep>> {
        let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        if exp.front().is_some_and(|front| text.contains(&front.pattern)) {
            return exp.pop_front().map(|e| e.steps);
        }
        exp.iter()
            .position(|e| text.contains(&e.pattern))
            .and_then(|i| exp.remove(i))
            .map(|e| e.steps)
    }

    fn record(&self, f: impl FnOnce(&mut MockRecord)) {
        f(&mut self.record.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Mock backend for testing
pub struct MockBackend {
    state: Arc<MockState>,
    models: Option<Vec<ModelInfo>>,
    errors: Broadcaster<BackendFailure>,
}

#[derive(Debug, Default, Deserialize)]
struct MockConfig {
    #[serde(default)]
    responses: Vec<MockResponse>,
    #[serde(default)]
    models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MockResponse {
    pattern: String,
    text: String,
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            models: None,
            errors: Broadcaster::new(),
        }
    }

    /// Set up an expectation for a prompt containing `pattern`
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Enable model listing with these models
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = Some(models);
        self
    }

    /// Make the next create_session fail with SESSION_CREATE_ERROR
    pub fn fail_next_create(self, message: &str) -> Self {
        *self
            .state
            .create_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
        self
    }

    /// Snapshot of what sessions were asked to do
    pub fn record(&self) -> MockRecord {
        self.state
            .record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish a backend-level failure to error subscribers
    pub fn fail(&self, fatal: bool, error: AgentError) {
        self.errors.send(BackendFailure { fatal, error });
    }

    /// Factory function for the registry
    pub fn factory() -> BackendFactory {
        Box::new(|config| {
            let cfg: MockConfig = if config.is_null() {
                MockConfig::default()
            } else {
                serde_json::from_value(config.clone())?
            };
            let mut backend = MockBackend::new();
            for response in cfg.responses {
                backend = backend.on_prompt(&response.pattern).respond_text(&response.text);
            }
            if !cfg.models.is_empty() {
                backend = backend.with_models(
                    cfg.models
                        .into_iter()
                        .map(|id| ModelInfo {
                            id,
                            ..ModelInfo::default()
                        })
                        .collect(),
                );
            }
            Ok(Arc::new(backend))
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Play back scripted steps
    pub fn respond_steps(self, steps: Vec<MockStep>) -> MockBackend {
        self.backend
            .state
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                steps,
            });
        self.backend
    }

    /// Respond with a list of events
    pub fn respond_with(self, events: Vec<EventKind>) -> MockBackend {
        self.respond_steps(events.into_iter().map(MockStep::Event).collect())
    }

    /// Respond with a simple text result
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![
            EventKind::text(TextKind::Text, text),
            EventKind::turn_complete(Some("end_turn".to_string()), false),
        ])
    }

    /// Respond with an error
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockBackend {
        self.respond_with(vec![
            EventKind::text(TextKind::Error, message),
            EventKind::turn_complete(Some(code.as_str().to_string()), true),
        ])
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn provider(&self) -> Provider {
        Provider::Mock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_model_listing: self.models.is_some(),
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
        let create_error = self
            .state
            .create_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(message) = create_error {
            return Err(BackendError::new(ErrorCode::SessionCreateError, message).into());
        }

        let n = self.state.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let resolved = request
            .options
            .resume_session_id
            .clone()
            .unwrap_or_else(|| format!("mock-session-{}", n));
        let inner = Arc::new(MockInner {
            channels: SessionChannels::new(
                Provider::Mock,
                uuid::Uuid::new_v4().to_string(),
                resolved.clone(),
                request.options.include_raw_events,
            ),
            state: self.state.clone(),
            alive: AtomicBool::new(true),
            turn: Mutex::new(None),
            turn_counter: AtomicU64::new(0),
        });
        self.state
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&inner));

        inner.channels.emit(EventKind::SessionInit {
            resolved_session_id: resolved,
            model: request.options.model.clone(),
            cwd: Some(request.cwd.display().to_string()),
            tools: Vec::new(),
            permission_mode: request.options.permission_mode,
        });

        let session = MockSession { inner };
        if let Some(content) = request.initial_content() {
            session.send_with_content(content).await?;
        }
        Ok(Arc::new(session))
    }

    async fn list_models(&self) -> AgentResult<Vec<ModelInfo>> {
        self.models
            .clone()
            .ok_or_else(|| BackendError::unsupported("model listing").into())
    }

    fn subscribe_errors(&self) -> Subscription<BackendFailure> {
        self.errors.subscribe()
    }

    async fn dispose(&self) {
        let sessions: Vec<Arc<MockInner>> = self
            .state
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter_map(|s| s.upgrade())
            .collect();
        for session in sessions {
            session.close("Backend disposed");
        }
        self.errors.close();
    }
}

struct MockInner {
    channels: SessionChannels,
    state: Arc<MockState>,
    alive: AtomicBool,
    /// Id and cancel token of the running scripted turn
    turn: Mutex<Option<(u64, CancellationToken)>>,
    turn_counter: AtomicU64,
}

impl MockInner {
    fn close(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((_, token)) = self.turn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        self.channels.emit(EventKind::SessionStatus {
            status: StatusKind::Exited,
            message: Some(reason.to_string()),
        });
        self.channels.close();
    }

    async fn play(self: Arc<Self>, turn_id: u64, steps: Vec<MockStep>, cancel: CancellationToken) {
        for step in steps {
            if cancel.is_cancelled() {
                return;
            }
            match step {
                MockStep::Event(kind) => {
                    let ends_turn = matches!(kind, EventKind::TurnComplete { .. });
                    self.channels.emit(kind);
                    if ends_turn {
                        self.finish_turn(turn_id);
                    }
                }
                MockStep::Permission {
                    tool_name,
                    tool_kind,
                    input,
                    tool_use_id,
                } => {
                    let (request, pending) = PermissionRequest::new(
                        self.channels.session_id(),
                        tool_name,
                        tool_kind,
                        input,
                    );
                    self.channels
                        .request_permission(request.with_tool_use_id(tool_use_id));
                    let decision = tokio::select! {
                        _ = cancel.cancelled() => return,
                        decision = pending.wait() => decision,
                    };
                    self.state.record(|r| r.decisions.push(decision));
                }
                MockStep::Delay(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
            }
        }
    }

    fn finish_turn(&self, turn_id: u64) {
        let mut turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        if turn.as_ref().is_some_and(|(id, _)| *id == turn_id) {
            *turn = None;
        }
    }
}

pub struct MockSession {
    inner: Arc<MockInner>,
}

impl MockSession {
    fn ensure_alive(&self) -> AgentResult<()> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::session_closed().into())
        }
    }
}

#[async_trait]
impl AgentSession for MockSession {
    fn session_id(&self) -> &str {
        self.inner.channels.session_id()
    }

    fn resolved_session_id(&self) -> String {
        self.inner.channels.resolved_session_id()
    }

    fn provider(&self) -> Provider {
        Provider::Mock
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> AgentResult<()> {
        self.ensure_alive()?;
        let text = joined_text(&content);
        self.inner.state.record(|r| r.prompts.push(text.clone()));
        self.inner.channels.emit(EventKind::UserInput { text: text.clone() });
        self.inner.channels.emit(EventKind::status(StatusKind::Working));

        let steps = self.inner.state.take_steps(&text).unwrap_or_else(|| {
            vec![
                MockStep::Event(EventKind::text(
                    TextKind::Text,
                    format!("Mock: no expectation for '{}'", text),
                )),
                MockStep::Event(EventKind::turn_complete(Some("end_turn".to_string()), false)),
            ]
        });

        let turn_id = self.inner.turn_counter.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self
            .inner
            .turn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((turn_id, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        tokio::spawn(self.inner.clone().play(turn_id, steps, token));
        Ok(())
    }

    async fn interrupt(&self) -> AgentResult<()> {
        self.inner.state.record(|r| r.interrupts += 1);
        let running = self.inner.turn.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((_, token)) = running {
            token.cancel();
            self.inner
                .channels
                .emit(EventKind::turn_complete(Some("cancelled".to_string()), false));
        }
        Ok(())
    }

    async fn kill(&self) -> AgentResult<()> {
        self.inner.state.record(|r| r.kills += 1);
        self.inner.close("Session killed");
        Ok(())
    }

    async fn set_model(&self, model: Option<&str>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.state.record(|r| r.models.push(model.map(str::to_string)));
        Ok(())
    }

    async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.state.record(|r| r.modes.push(mode));
        self.inner.channels.emit(EventKind::SessionStatus {
            status: StatusKind::ModeChanged,
            message: Some(mode.unwrap_or_default().as_str().to_string()),
        });
        Ok(())
    }

    async fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> AgentResult<()> {
        self.ensure_alive()?;
        self.inner.state.record(|r| r.efforts.push(effort));
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
