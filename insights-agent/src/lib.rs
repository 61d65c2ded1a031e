// ABOUTME: Unified session layer over coding-agent backends for insights.
// ABOUTME: Provides transports, backends (CLI, app-server, ACP, mock) and one normalized event model.

pub mod channels;
pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod fs_access;
pub mod options;
pub mod permission;
pub mod rate_limits;
pub mod registry;
pub mod subscription;
pub mod terminal;
pub mod tool_kind;
pub mod traits;
pub mod transport;

pub mod backends;
pub mod testing;

pub use channels::SessionChannels;
pub use config::Config;
pub use content::ContentBlock;
pub use error::{AgentError, AgentResult, BackendError, ErrorCode, ProcessError, RequestError, RpcError};
pub use event::{
    CompactionTrigger, Direction, EventKind, InsightsEvent, PermissionDenial, Provider, RawMessage,
    StatusKind, TextKind, ToolOutcome, Usage,
};
pub use options::{PermissionMode, ReasoningEffort, SessionOptions, ValidationWarning};
pub use permission::{PendingDecision, PermissionDecision, PermissionRequest};
pub use rate_limits::{RateLimitUpdate, RateLimitWindow};
pub use registry::{BackendFactory, BackendRegistry};
pub use subscription::{Broadcaster, Subscription};
pub use tool_kind::ToolKind;
pub use traits::{
    AgentBackend, AgentSession, BackendFailure, Capabilities, CreateSessionRequest, ModelInfo,
};
