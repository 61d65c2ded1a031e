// ABOUTME: Per-conversation state derived from normalized events: turn, permissions, agents, log.
// ABOUTME: Owns the permission queue and the working timer so both stay in lockstep.

use crate::agents::{AgentStatus, AgentTracker, INTERRUPTED_RESULT};
use crate::log::{ConversationLog, LogEntryKind};
use crate::permission_queue::PermissionQueue;
use crate::work_timer::WorkTimer;
use insights_agent::{
    CompactionTrigger, EventKind, InsightsEvent, PermissionMode, PermissionRequest, StatusKind,
    TextKind, Usage,
};
use serde_json::Value;
use std::time::Duration;

const TURN_ENDED_REASON: &str = "Turn ended";
const SESSION_EXITED_REASON: &str = "Session exited";
const SESSION_RESET_REASON: &str = "Session reset";

/// Coarse state a front-end shows for the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Working,
    WaitingForPermission,
    Error,
}

#[derive(Default)]
pub struct Conversation {
    session_active: bool,
    resolved_session_id: Option<String>,
    model: Option<String>,
    permission_mode: Option<PermissionMode>,
    working: bool,
    compacting: bool,
    failed: bool,
    permissions: PermissionQueue,
    timer: WorkTimer,
    last_elapsed: Option<Duration>,
    last_usage: Option<Usage>,
    last_cost_usd: Option<f64>,
    agents: AgentTracker,
    log: ConversationLog,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversationState {
        if self.working && !self.permissions.is_empty() {
            ConversationState::WaitingForPermission
        } else if self.working {
            ConversationState::Working
        } else if self.failed {
            ConversationState::Error
        } else {
            ConversationState::Idle
        }
    }

    pub fn has_active_session(&self) -> bool {
        self.session_active
    }

    pub fn resolved_session_id(&self) -> Option<&str> {
        self.resolved_session_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn permission_mode(&self) -> Option<PermissionMode> {
        self.permission_mode
    }

    pub fn is_working(&self) -> bool {
        self.working
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    pub fn pending_permission_count(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_waiting_for_permission(&self) -> bool {
        !self.permissions.is_empty()
    }

    pub fn current_permission(&self) -> Option<&PermissionRequest> {
        self.permissions.current()
    }

    pub fn timer(&self) -> &WorkTimer {
        &self.timer
    }

    /// Working time of the running turn, excluding time spent waiting on permissions
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    /// Working time of the last turn that finished normally
    pub fn last_elapsed(&self) -> Option<Duration> {
        self.last_elapsed
    }

    pub fn last_usage(&self) -> Option<&Usage> {
        self.last_usage.as_ref()
    }

    pub fn last_cost_usd(&self) -> Option<f64> {
        self.last_cost_usd
    }

    pub fn agents(&self) -> &AgentTracker {
        &self.agents
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    /// A prompt went out; the turn is running from now on
    pub fn begin_turn(&mut self) {
        if !self.working {
            self.working = true;
            self.failed = false;
            self.timer.start();
            if !self.permissions.is_empty() {
                self.timer.pause();
            }
        }
    }

    /// Record a failure that ended (or prevented) a turn
    pub fn fail(&mut self, message: impl Into<String>) {
        self.log.error(message);
        self.working = false;
        self.compacting = false;
        self.failed = true;
        self.timer.reset();
    }

    pub fn add_pending_permission(&mut self, request: PermissionRequest) {
        self.prune_resolved_permissions();
        tracing::debug!(
            request_id = %request.id,
            tool = %request.tool_name,
            pending = self.permissions.len() + 1,
            "Permission request queued"
        );
        if let Some(tool_use_id) = request.tool_use_id.as_deref() {
            self.agents.set_status(tool_use_id, AgentStatus::WaitingUser);
        }
        if self.permissions.push(request) && self.working {
            self.timer.pause();
        }
    }

    /// Allow the current request. Returns false when nothing was pending.
    pub fn allow_permission(&mut self, updated_input: Option<Value>) -> bool {
        self.prune_resolved_permissions();
        let Some(request) = self.permissions.allow_current(updated_input) else {
            return false;
        };
        if let Some(tool_use_id) = request.tool_use_id.as_deref() {
            if self.agents.get(tool_use_id).map(|a| a.status) == Some(AgentStatus::WaitingUser) {
                self.agents.set_status(tool_use_id, AgentStatus::Working);
            }
        }
        self.after_permission_removed();
        true
    }

    /// Deny the current request. Returns false when nothing was pending.
    pub fn deny_permission(&mut self, reason: &str) -> bool {
        self.prune_resolved_permissions();
        if self.permissions.deny_current(reason).is_none() {
            return false;
        }
        self.after_permission_removed();
        true
    }

    pub fn remove_pending_permission_by_tool_use_id(&mut self, tool_use_id: &str) -> bool {
        if self.permissions.remove_by_tool_use_id(tool_use_id).is_none() {
            return false;
        }
        tracing::debug!(tool_use_id = %tool_use_id, "Permission request withdrawn");
        self.after_permission_removed();
        true
    }

    /// Drop requests the backend already resolved on its own (agent-side cancel).
    /// Returns how many were dropped.
    pub fn prune_resolved_permissions(&mut self) -> usize {
        let dropped = self.permissions.prune_resolved();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped permission requests resolved by the backend");
            self.after_permission_removed();
        }
        dropped
    }

    fn after_permission_removed(&mut self) {
        if self.permissions.is_empty() && self.working {
            self.timer.resume();
        }
    }

    /// Stop the running turn locally. Returns false when there is no session to interrupt.
    pub fn interrupt(&mut self) -> bool {
        if !self.session_active {
            return false;
        }
        let denied = self.permissions.deny_all(INTERRUPTED_RESULT);
        let failed = self.agents.fail_active(INTERRUPTED_RESULT);
        tracing::info!(denied, agents = failed, "Conversation interrupted");
        self.working = false;
        self.compacting = false;
        if let Some(elapsed) = self.timer.finish() {
            self.last_elapsed = Some(elapsed);
        }
        true
    }

    /// Forget the current backend session and start the log afresh
    pub fn reset_session(&mut self) {
        self.session_active = false;
        self.resolved_session_id = None;
        self.agents.clear();
        self.working = false;
        self.compacting = false;
        self.failed = false;
        self.permissions.deny_all(SESSION_RESET_REASON);
        self.timer.reset();
        self.log.push(LogEntryKind::ContextCleared);
    }

    pub fn apply_event(&mut self, event: &InsightsEvent) {
        self.prune_resolved_permissions();
        match &event.kind {
            EventKind::SessionInit {
                resolved_session_id,
                model,
                permission_mode,
                ..
            } => {
                self.session_active = true;
                self.resolved_session_id = Some(resolved_session_id.clone());
                if model.is_some() {
                    self.model = model.clone();
                }
                if permission_mode.is_some() {
                    self.permission_mode = *permission_mode;
                }
            }
            EventKind::SessionStatus { status, message } => match status {
                StatusKind::Working => self.begin_turn(),
                StatusKind::Compacting => self.compacting = true,
                StatusKind::Idle => self.compacting = false,
                StatusKind::ModeChanged => {
                    if let Some(mode) = message.as_deref().and_then(|m| m.parse().ok()) {
                        self.permission_mode = Some(mode);
                    }
                }
                StatusKind::Exited => self.session_exited(message.as_deref()),
            },
            EventKind::Text {
                kind,
                text,
                parent_call_id,
                ..
            } => match kind {
                TextKind::Error => self.log.error(text.clone()),
                _ => self.log.push(LogEntryKind::Assistant {
                    kind: *kind,
                    text: text.clone(),
                    parent_call_id: parent_call_id.clone(),
                }),
            },
            EventKind::UserInput { text } => {
                self.log.push(LogEntryKind::User { text: text.clone() });
            }
            EventKind::ToolInvocation {
                call_id,
                tool_name,
                tool_kind,
                parent_call_id,
                ..
            } => {
                self.agents
                    .start_tool(call_id, tool_name, *tool_kind, parent_call_id.as_deref());
                self.log.push(LogEntryKind::Tool {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    outcome: None,
                });
            }
            EventKind::ToolCompletion {
                call_id,
                tool_name,
                outcome,
                output,
                error,
                ..
            } => {
                let result = error.clone().or_else(|| match output {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                });
                self.agents.finish(call_id, *outcome, result);
                self.log.finish_tool(call_id, tool_name, *outcome);
                // A finished call no longer needs its prompt answered.
                self.remove_pending_permission_by_tool_use_id(call_id);
            }
            EventKind::SubagentSpawn {
                call_id,
                agent_type,
                description,
                parent_call_id,
                ..
            } => {
                self.agents.start_subagent(
                    call_id,
                    agent_type.as_deref(),
                    description.as_deref(),
                    parent_call_id.as_deref(),
                );
            }
            EventKind::SubagentComplete {
                call_id,
                outcome,
                result,
            } => {
                self.agents.finish(call_id, *outcome, result.clone());
            }
            EventKind::TurnComplete {
                usage,
                cost_usd,
                stop_reason,
                is_error,
                ..
            } => {
                self.permissions.deny_all(TURN_ENDED_REASON);
                let elapsed = self.timer.finish();
                if elapsed.is_some() {
                    self.last_elapsed = elapsed;
                }
                self.working = false;
                self.compacting = false;
                self.failed = *is_error;
                if usage.is_some() {
                    self.last_usage = usage.clone();
                }
                self.last_cost_usd = (*cost_usd).or(self.last_cost_usd);
                self.log.push(LogEntryKind::TurnEnded {
                    stop_reason: stop_reason.clone(),
                    elapsed_ms: elapsed.map(|d| d.as_millis() as u64),
                });
            }
            EventKind::ContextCompaction {
                trigger,
                pre_tokens,
            } => {
                self.compacting = false;
                if *trigger == CompactionTrigger::Clear {
                    self.reset_session();
                } else {
                    self.log.push(LogEntryKind::Compaction {
                        trigger: *trigger,
                        pre_tokens: *pre_tokens,
                    });
                }
            }
            EventKind::PermissionRequest { tool_use_id, .. } => {
                if let Some(tool_use_id) = tool_use_id.as_deref() {
                    self.agents.set_status(tool_use_id, AgentStatus::WaitingUser);
                }
            }
            _ => {}
        }
    }

    fn session_exited(&mut self, message: Option<&str>) {
        tracing::info!(
            session_id = ?self.resolved_session_id,
            message = ?message,
            "Session exited"
        );
        self.session_active = false;
        self.permissions.deny_all(SESSION_EXITED_REASON);
        if self.working {
            self.working = false;
            self.timer.reset();
        }
        self.compacting = false;
    }
}
