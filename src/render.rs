// ABOUTME: Plain-text rendering of normalized events for the terminal.
// ABOUTME: A pure function so the output format can be tested without a session.

use insights_agent::{EventKind, InsightsEvent, StatusKind, TextKind, ToolOutcome};
use serde_json::Value;

const MAX_INPUT_CHARS: usize = 120;

fn compact_json(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.chars().count() <= MAX_INPUT_CHARS {
        return text;
    }
    format!("{}…", text.chars().take(MAX_INPUT_CHARS).collect::<String>())
}

/// A line for an event, or None for events not worth printing
pub fn render_event(event: &InsightsEvent) -> Option<String> {
    let line = match &event.kind {
        EventKind::SessionInit {
            resolved_session_id,
            ..
        } => format!("[session {}]", resolved_session_id),
        EventKind::SessionStatus {
            status: StatusKind::ModeChanged,
            message,
        } => format!("[mode: {}]", message.as_deref().unwrap_or("unknown")),
        EventKind::SessionStatus {
            status: StatusKind::Exited,
            message,
        } => format!("[session exited: {}]", message.as_deref().unwrap_or("-")),
        EventKind::Text { kind, text, .. } => match kind {
            TextKind::Error => format!("error: {}", text),
            TextKind::Thinking => format!("(thinking) {}", text),
            TextKind::Text | TextKind::Plan => text.clone(),
        },
        EventKind::ToolInvocation {
            tool_name,
            input,
            parent_call_id,
            ..
        } => format!(
            "{}→ {} {}",
            if parent_call_id.is_some() { "    " } else { "" },
            tool_name,
            compact_json(input)
        ),
        EventKind::ToolCompletion {
            tool_name,
            outcome: ToolOutcome::Failure,
            error,
            ..
        } => format!("← {} failed: {}", tool_name, error.as_deref().unwrap_or("-")),
        EventKind::TurnComplete { is_error: true, .. } => "[turn failed]".to_string(),
        EventKind::TurnComplete { .. } => "[turn complete]".to_string(),
        EventKind::PermissionRequest { tool_name, input, .. } => format!(
            "? allow {} {}  /allow or /deny [reason]",
            tool_name,
            compact_json(input)
        ),
        _ => return None,
    };
    Some(line)
}
