// ABOUTME: Append-only conversation log built from normalized session events.
// ABOUTME: Holds user/assistant text, tool activity, errors and context markers.

use chrono::{DateTime, Utc};
use insights_agent::{CompactionTrigger, TextKind, ToolOutcome};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntryKind {
    User {
        text: String,
    },
    Assistant {
        kind: TextKind,
        text: String,
        parent_call_id: Option<String>,
    },
    Tool {
        call_id: String,
        tool_name: String,
        outcome: Option<ToolOutcome>,
    },
    Error {
        message: String,
    },
    Compaction {
        trigger: CompactionTrigger,
        pre_tokens: Option<u64>,
    },
    /// Everything before this marker belongs to a previous session
    ContextCleared,
    TurnEnded {
        stop_reason: Option<String>,
        elapsed_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LogEntryKind,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConversationLog {
    entries: Vec<LogEntry>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: LogEntryKind) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogEntryKind::Error {
            message: message.into(),
        });
    }

    /// Record a tool outcome on its existing entry, or add one if the invocation was not seen
    pub fn finish_tool(&mut self, call_id: &str, tool_name: &str, outcome: ToolOutcome) {
        let existing = self.entries.iter_mut().rev().find_map(|e| match &mut e.kind {
            LogEntryKind::Tool {
                call_id: id,
                outcome: slot,
                ..
            } if id == call_id => Some(slot),
            _ => None,
        });
        match existing {
            Some(slot) => *slot = Some(outcome),
            None => self.push(LogEntryKind::Tool {
                call_id: call_id.to_string(),
                tool_name: tool_name.to_string(),
                outcome: Some(outcome),
            }),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries after the most recent context-cleared marker
    pub fn current_context(&self) -> &[LogEntry] {
        let start = self
            .entries
            .iter()
            .rposition(|e| e.kind == LogEntryKind::ContextCleared)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.entries[start..]
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match &e.kind {
            LogEntryKind::Error { message } => Some(message.as_str()),
            _ => None,
        })
    }
}
