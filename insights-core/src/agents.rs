// ABOUTME: Status tracking for tool calls and subagents running inside a turn.
// ABOUTME: Records keep insertion order so a front-end can list them as they started.

use chrono::{DateTime, Utc};
use insights_agent::{ToolKind, ToolOutcome};
use serde::Serialize;

/// Result recorded on agents cut short by an interrupt
pub const INTERRUPTED_RESULT: &str = "Interrupted by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Working,
    /// Waiting on a nested tool call
    WaitingTool,
    /// Waiting on a permission decision
    WaitingUser,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Working => "working",
            AgentStatus::WaitingTool => "waiting_tool",
            AgentStatus::WaitingUser => "waiting_user",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        }
    }
}

/// One tool call or subagent seen during the conversation
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub call_id: String,
    /// Native tool name, or the subagent type
    pub name: String,
    pub tool_kind: Option<ToolKind>,
    pub is_subagent: bool,
    pub description: Option<String>,
    pub parent_call_id: Option<String>,
    pub status: AgentStatus,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct AgentTracker {
    records: Vec<AgentRecord>,
}

impl AgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<&AgentRecord> {
        self.records.iter().find(|r| r.call_id == call_id)
    }

    fn get_mut(&mut self, call_id: &str) -> Option<&mut AgentRecord> {
        self.records.iter_mut().find(|r| r.call_id == call_id)
    }

    pub fn all(&self) -> &[AgentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn start_tool(
        &mut self,
        call_id: &str,
        tool_name: &str,
        tool_kind: ToolKind,
        parent_call_id: Option<&str>,
    ) {
        self.insert(AgentRecord {
            call_id: call_id.to_string(),
            name: tool_name.to_string(),
            tool_kind: Some(tool_kind),
            is_subagent: false,
            description: None,
            parent_call_id: parent_call_id.map(str::to_string),
            status: AgentStatus::Working,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        if let Some(parent) = parent_call_id {
            self.set_status(parent, AgentStatus::WaitingTool);
        }
    }

    pub fn start_subagent(
        &mut self,
        call_id: &str,
        agent_type: Option<&str>,
        description: Option<&str>,
        parent_call_id: Option<&str>,
    ) {
        let existing = self.get_mut(call_id);
        // The delegation tool call usually registers first; promote it in place.
        if let Some(record) = existing {
            record.is_subagent = true;
            if let Some(agent_type) = agent_type {
                record.name = agent_type.to_string();
            }
            record.description = description.map(str::to_string);
            record.status = AgentStatus::Working;
            return;
        }
        self.insert(AgentRecord {
            call_id: call_id.to_string(),
            name: agent_type.unwrap_or("agent").to_string(),
            tool_kind: None,
            is_subagent: true,
            description: description.map(str::to_string),
            parent_call_id: parent_call_id.map(str::to_string),
            status: AgentStatus::Working,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// Finish a call. Returns false for unknown or already finished calls.
    pub fn finish(&mut self, call_id: &str, outcome: ToolOutcome, result: Option<String>) -> bool {
        let parent = {
            let Some(record) = self.get_mut(call_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.status = match outcome {
                ToolOutcome::Success => AgentStatus::Completed,
                ToolOutcome::Failure | ToolOutcome::Cancelled => AgentStatus::Error,
            };
            record.result = result;
            record.finished_at = Some(Utc::now());
            record.parent_call_id.clone()
        };
        if let Some(parent) = parent {
            let nested_running = self.records.iter().any(|r| {
                r.parent_call_id.as_deref() == Some(parent.as_str()) && !r.status.is_terminal()
            });
            if !nested_running
                && self
                    .get(&parent)
                    .is_some_and(|p| p.status == AgentStatus::WaitingTool)
            {
                self.set_status(&parent, AgentStatus::Working);
            }
        }
        true
    }

    /// Change a non-terminal record's status. Returns false if nothing changed.
    pub fn set_status(&mut self, call_id: &str, status: AgentStatus) -> bool {
        match self.get_mut(call_id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Mark every non-terminal record as errored with the given result
    pub fn fail_active(&mut self, result: &str) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for record in self.records.iter_mut().filter(|r| !r.status.is_terminal()) {
            record.status = AgentStatus::Error;
            record.result = Some(result.to_string());
            record.finished_at = Some(now);
            count += 1;
        }
        count
    }

    fn insert(&mut self, record: AgentRecord) {
        match self.get_mut(&record.call_id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }
}
