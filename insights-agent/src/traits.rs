// ABOUTME: Core AgentBackend and AgentSession traits that every backend family implements.
// ABOUTME: Defines session creation, mutators, output streams and capability reporting.

use crate::content::ContentBlock;
use crate::error::{AgentError, AgentResult, BackendError};
use crate::event::{InsightsEvent, Provider, RawMessage};
use crate::options::{PermissionMode, ReasoningEffort, SessionOptions};
use crate::permission::PermissionRequest;
use crate::rate_limits::RateLimitUpdate;
use crate::subscription::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// What a backend can do beyond the common contract
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_model_listing: bool,
    pub supports_reasoning_effort: bool,
    pub supports_hooks: bool,
    pub supports_permission_mode_change: bool,
    pub supports_model_change: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub supported_reasoning_efforts: Vec<String>,
    pub default_reasoning_effort: Option<String>,
    pub is_default: bool,
}

/// Everything needed to start (or resume) a session
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    /// First prompt, sent as the first turn when non-empty
    pub prompt: Option<String>,
    pub cwd: PathBuf,
    pub options: SessionOptions,
    /// Extra content blocks sent along with the first prompt
    pub content: Vec<ContentBlock>,
}

impl CreateSessionRequest {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: None,
            cwd: cwd.into(),
            options: SessionOptions::default(),
            content: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    /// The first message as content blocks, or None when there is nothing to send
    pub fn initial_content(&self) -> Option<Vec<ContentBlock>> {
        let mut blocks = Vec::new();
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            blocks.push(ContentBlock::text(prompt));
        }
        blocks.extend(self.content.iter().cloned());
        if blocks.is_empty() {
            None
        } else {
            Some(blocks)
        }
    }
}

/// Backend-level error published on the errors stream
#[derive(Debug, Clone)]
pub struct BackendFailure {
    /// The backend cannot continue (subprocess gone)
    pub fatal: bool,
    pub error: AgentError,
}

/// Core trait that all agent backends implement.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    fn provider(&self) -> Provider;

    fn capabilities(&self) -> Capabilities;

    /// Start or resume a session
    async fn create_session(&self, request: CreateSessionRequest)
        -> AgentResult<Arc<dyn AgentSession>>;

    /// List models the backend offers
    async fn list_models(&self) -> AgentResult<Vec<ModelInfo>> {
        Err(BackendError::unsupported("Model listing").into())
    }

    fn subscribe_errors(&self) -> Subscription<BackendFailure>;

    /// Latest account rate limits, for backends that report them
    fn rate_limits(&self) -> Option<watch::Receiver<Option<RateLimitUpdate>>> {
        None
    }

    /// Kill every session and the subprocess behind them
    async fn dispose(&self);
}

/// One backend conversation.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Client-assigned id
    fn session_id(&self) -> &str;

    /// Backend-assigned id (thread id, ACP session id, CLI session id)
    fn resolved_session_id(&self) -> String;

    fn provider(&self) -> Provider;

    fn is_alive(&self) -> bool;

    /// Send a plain-text message
    async fn send(&self, text: &str) -> AgentResult<()> {
        self.send_with_content(vec![ContentBlock::text(text)]).await
    }

    async fn send_with_content(&self, content: Vec<ContentBlock>) -> AgentResult<()>;

    /// Stop the current turn. A no-op when the session is idle.
    async fn interrupt(&self) -> AgentResult<()>;

    async fn kill(&self) -> AgentResult<()>;

    /// Switch models. `None` returns to the backend's default model.
    async fn set_model(&self, model: Option<&str>) -> AgentResult<()>;

    /// `None` returns to the default permission mode.
    async fn set_permission_mode(&self, mode: Option<PermissionMode>) -> AgentResult<()>;

    /// `None` drops the override and lets the backend pick.
    async fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> AgentResult<()>;

    fn subscribe_messages(&self) -> Subscription<RawMessage>;

    fn subscribe_events(&self) -> Subscription<InsightsEvent>;

    fn subscribe_permission_requests(&self) -> Subscription<PermissionRequest>;
}
