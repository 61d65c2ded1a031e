// ABOUTME: Conversation layer on top of insights-agent sessions.
// ABOUTME: Permission queue, working timer, agent status, conversation log and the driver tying them to a session.

pub mod agents;
pub mod commands;
pub mod conversation;
pub mod driver;
pub mod log;
pub mod permission_queue;
pub mod work_timer;

pub use agents::{AgentRecord, AgentStatus, AgentTracker, INTERRUPTED_RESULT};
pub use commands::{parse_input, Command, LocalCommand, ParseResult};
pub use conversation::{Conversation, ConversationState};
pub use driver::ConversationDriver;
pub use log::{ConversationLog, LogEntry, LogEntryKind};
pub use permission_queue::{PermissionQueue, TIMEOUT_REASON};
pub use work_timer::WorkTimer;
