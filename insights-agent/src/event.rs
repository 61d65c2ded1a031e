// ABOUTME: Normalized event model every backend's wire output is translated into.
// ABOUTME: InsightsEvent carries common metadata, EventKind is the closed set of variants.

use crate::options::PermissionMode;
use crate::tool_kind::ToolKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which backend family produced an event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    ClaudeCli,
    AppServer,
    Acp,
    Mock,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ClaudeCli => "claude_cli",
            Provider::AppServer => "app_server",
            Provider::Acp => "acp",
            Provider::Mock => "mock",
        }
    }
}

/// One normalized event, tagged with the session it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsightsEvent {
    /// Unique event id (UUID v4)
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    /// Client-assigned session id
    pub session_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Original wire payload, only when the session asked for raw events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// Backend-specific data with no cross-backend meaning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl InsightsEvent {
    pub fn new(provider: Provider, session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider,
            session_id: session_id.into(),
            kind,
            raw: None,
            extensions: None,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Wire name of the variant, as serialized in the `event` field
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// The closed set of event variants.
///
/// Marked non-exhaustive so consumers keep a wildcard arm when matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventKind {
    /// The backend reported the session is ready
    SessionInit {
        /// Backend-assigned id (thread id, ACP session id, CLI session id)
        resolved_session_id: String,
        model: Option<String>,
        cwd: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        permission_mode: Option<PermissionMode>,
    },

    /// Coarse session state change
    SessionStatus {
        status: StatusKind,
        message: Option<String>,
    },

    /// A finalized block of assistant output
    Text {
        kind: TextKind,
        text: String,
        message_id: Option<String>,
        /// Set when the text belongs to a subagent conversation
        parent_call_id: Option<String>,
    },

    /// Text the user submitted
    UserInput { text: String },

    /// Tool started execution
    ToolInvocation {
        call_id: String,
        /// Native tool name as the backend reported it
        tool_name: String,
        tool_kind: ToolKind,
        input: Value,
        parent_call_id: Option<String>,
    },

    /// Tool finished, failed or was cancelled
    ToolCompletion {
        /// Matches the call_id of the ToolInvocation
        call_id: String,
        tool_name: String,
        tool_kind: ToolKind,
        outcome: ToolOutcome,
        output: Value,
        error: Option<String>,
        duration_ms: Option<u64>,
        parent_call_id: Option<String>,
    },

    /// A delegation tool started a nested conversation
    SubagentSpawn {
        call_id: String,
        agent_type: Option<String>,
        description: Option<String>,
        prompt: Option<String>,
        parent_call_id: Option<String>,
    },

    /// A nested conversation ended
    SubagentComplete {
        call_id: String,
        outcome: ToolOutcome,
        result: Option<String>,
    },

    /// End of a turn
    TurnComplete {
        usage: Option<Usage>,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        num_turns: Option<u32>,
        stop_reason: Option<String>,
        is_error: bool,
        #[serde(default)]
        permission_denials: Vec<PermissionDenial>,
    },

    /// Conversation context was reduced
    ContextCompaction {
        trigger: CompactionTrigger,
        pre_tokens: Option<u64>,
    },

    /// The backend asked for permission to run a tool
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_kind: ToolKind,
        input: Value,
        tool_use_id: Option<String>,
        reason: Option<String>,
    },

    /// Streaming chunk of a message that will later be finalized as Text
    StreamDelta {
        message_id: String,
        kind: TextKind,
        delta: String,
        parent_call_id: Option<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::SessionInit { .. } => "session_init",
            EventKind::SessionStatus { .. } => "session_status",
            EventKind::Text { .. } => "text",
            EventKind::UserInput { .. } => "user_input",
            EventKind::ToolInvocation { .. } => "tool_invocation",
            EventKind::ToolCompletion { .. } => "tool_completion",
            EventKind::SubagentSpawn { .. } => "subagent_spawn",
            EventKind::SubagentComplete { .. } => "subagent_complete",
            EventKind::TurnComplete { .. } => "turn_complete",
            EventKind::ContextCompaction { .. } => "context_compaction",
            EventKind::PermissionRequest { .. } => "permission_request",
            EventKind::StreamDelta { .. } => "stream_delta",
        }
    }

    pub fn text(kind: TextKind, text: impl Into<String>) -> Self {
        EventKind::Text {
            kind,
            text: text.into(),
            message_id: None,
            parent_call_id: None,
        }
    }

    pub fn status(status: StatusKind) -> Self {
        EventKind::SessionStatus {
            status,
            message: None,
        }
    }

    /// A turn end with nothing but a stop reason
    pub fn turn_complete(stop_reason: Option<String>, is_error: bool) -> Self {
        EventKind::TurnComplete {
            usage: None,
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
            stop_reason,
            is_error,
            permission_denials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Working,
    Idle,
    Compacting,
    ModeChanged,
    Exited,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Text,
    Thinking,
    Plan,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    Auto,
    Manual,
    Clear,
}

/// A tool call the backend refused during the turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionDenial {
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Tokens spent on reasoning
    pub reasoning_tokens: Option<u64>,
    /// Size of the model's context window
    pub context_window: Option<u64>,
    /// Total cost in USD, as reported by the backend
    pub cost_usd: Option<f64>,
    /// Backend-specific usage data
    pub extra: Option<Value>,
}

/// Which way a raw wire message travelled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Unparsed wire message, for debugging views
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl RawMessage {
    pub fn inbound(payload: Value) -> Self {
        Self {
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn outbound(payload: Value) -> Self {
        Self {
            direction: Direction::Outbound,
            timestamp: Utc::now(),
            payload,
        }
    }
}
