// ABOUTME: Maps ACP session/update notifications onto normalized events.
// ABOUTME: Buffers message chunks into deltas plus a final text, pairs tool_call with tool_call_update.

use crate::event::{EventKind, StatusKind, TextKind, ToolOutcome};
use crate::tool_kind::{classify, ToolKind, ACP_KINDS, MCP_PREFIX};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

struct OpenTool {
    name: String,
    kind: ToolKind,
    started: Instant,
}

struct TextBuffer {
    kind: TextKind,
    message_id: String,
    text: String,
}

#[derive(Default)]
pub struct AcpEventMapper {
    open_tools: HashMap<String, OpenTool>,
    open_order: Vec<String>,
    buffer: Option<TextBuffer>,
    turn_started: Option<Instant>,
}

/// Text carried by an ACP content block; non-text blocks become a placeholder
fn content_text(content: &Value) -> Option<String> {
    match content.get("type").and_then(|t| t.as_str())? {
        "text" => content
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        "resource_link" => content
            .get("uri")
            .and_then(|u| u.as_str())
            .map(str::to_string),
        "image" => Some("<image>".to_string()),
        "audio" => Some("<audio>".to_string()),
        "resource" => Some("<resource>".to_string()),
        _ => None,
    }
}

/// Human-facing tool name: title, then the raw input's name or tool, then the kind
pub fn derive_tool_name(update: &Value) -> String {
    let raw_input = update.get("rawInput");
    [
        update.get("title"),
        raw_input.and_then(|r| r.get("name")),
        raw_input.and_then(|r| r.get("tool")),
        update.get("kind"),
    ]
    .into_iter()
    .flatten()
    .filter_map(|v| v.as_str())
    .find(|s| !s.is_empty())
    .unwrap_or("Tool")
    .to_string()
}

/// Kind from an explicit mcp__ name, else the ACP `kind` field
pub fn derive_tool_kind(update: &Value, name: &str) -> ToolKind {
    if name.starts_with(MCP_PREFIX) {
        return ToolKind::Mcp;
    }
    update
        .get("kind")
        .and_then(|k| k.as_str())
        .map(|k| classify(ACP_KINDS, k))
        .unwrap_or(ToolKind::Other)
}

/// rawOutput when present, otherwise the text of the content entries
fn tool_output(update: &Value) -> Value {
    if let Some(raw) = update.get("rawOutput").filter(|v| !v.is_null()) {
        return raw.clone();
    }
    let text = content_entries_text(update);
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    }
}

fn content_entries_text(update: &Value) -> String {
    update
        .get("content")
        .and_then(|c| c.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry.get("type").and_then(|t| t.as_str()) {
                    Some("content") => entry.get("content").and_then(content_text),
                    Some("diff") => entry
                        .get("path")
                        .and_then(|p| p.as_str())
                        .map(|p| format!("diff: {}", p)),
                    Some("terminal") => entry
                        .get("terminalId")
                        .and_then(|t| t.as_str())
                        .map(|t| format!("terminal: {}", t)),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn render_plan(update: &Value) -> Option<String> {
    let entries = update.get("entries").and_then(|e| e.as_array())?;
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| {
            let marker = match entry.get("status").and_then(|s| s.as_str()) {
                Some("completed") => "[x]",
                Some("in_progress") => "[~]",
                _ => "[ ]",
            };
            let text = entry.get("content").and_then(|c| c.as_str()).unwrap_or("");
            format!("- {} {}", marker, text)
        })
        .collect();
    Some(lines.join("\n"))
}

impl AcpEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_turn(&mut self) {
        self.turn_started = Some(Instant::now());
    }

    /// Translate the `update` object of one session/update notification
    pub fn map_update(&mut self, update: &Value) -> Vec<EventKind> {
        let Some(kind) = update.get("sessionUpdate").and_then(|k| k.as_str()) else {
            return Vec::new();
        };
        match kind {
            "agent_message_chunk" => self.chunk(TextKind::Text, update),
            "agent_thought_chunk" => self.chunk(TextKind::Thinking, update),
            "user_message_chunk" => {
                let mut events = self.flush();
                if let Some(text) = update.get("content").and_then(content_text) {
                    events.push(EventKind::UserInput { text });
                }
                events
            }
            "tool_call" => {
                let mut events = self.flush();
                events.extend(self.tool_call(update));
                events
            }
            "tool_call_update" => {
                let mut events = self.flush();
                events.extend(self.tool_call_update(update));
                events
            }
            "plan" => {
                let mut events = self.flush();
                if let Some(text) = render_plan(update) {
                    events.push(EventKind::text(TextKind::Plan, text));
                }
                events
            }
            "current_mode_update" => {
                let mut events = self.flush();
                events.push(EventKind::SessionStatus {
                    status: StatusKind::ModeChanged,
                    message: update
                        .get("currentModeId")
                        .and_then(|m| m.as_str())
                        .map(str::to_string),
                });
                events
            }
            other => {
                tracing::debug!(update = other, "Ignoring session update");
                Vec::new()
            }
        }
    }

    fn chunk(&mut self, kind: TextKind, update: &Value) -> Vec<EventKind> {
        let Some(delta) = update
            .get("content")
            .and_then(content_text)
            .filter(|t| !t.is_empty())
        else {
            return Vec::new();
        };

        let mut events = match &self.buffer {
            Some(buffer) if buffer.kind != kind => self.flush(),
            _ => Vec::new(),
        };
        let buffer = self.buffer.get_or_insert_with(|| TextBuffer {
            kind,
            message_id: uuid::Uuid::new_v4().to_string(),
            text: String::new(),
        });
        buffer.text.push_str(&delta);
        events.push(EventKind::StreamDelta {
            message_id: buffer.message_id.clone(),
            kind,
            delta,
            parent_call_id: None,
        });
        events
    }

    /// Finalize any buffered text into a single text event
    pub fn flush(&mut self) -> Vec<EventKind> {
        match self.buffer.take() {
            Some(buffer) if !buffer.text.is_empty() => vec![EventKind::Text {
                kind: buffer.kind,
                text: buffer.text,
                message_id: Some(buffer.message_id),
                parent_call_id: None,
            }],
            _ => Vec::new(),
        }
    }

    fn tool_call(&mut self, update: &Value) -> Vec<EventKind> {
        let Some(call_id) = update.get("toolCallId").and_then(|id| id.as_str()) else {
            tracing::warn!("tool_call without toolCallId dropped");
            return Vec::new();
        };
        let mut events = vec![self.open(call_id, update)];
        if matches!(
            update.get("status").and_then(|s| s.as_str()),
            Some("completed") | Some("failed")
        ) {
            events.extend(self.complete(call_id, update));
        }
        events
    }

    fn open(&mut self, call_id: &str, update: &Value) -> EventKind {
        let name = derive_tool_name(update);
        let kind = derive_tool_kind(update, &name);
        self.open_tools.insert(
            call_id.to_string(),
            OpenTool {
                name: name.clone(),
                kind,
                started: Instant::now(),
            },
        );
        self.open_order.push(call_id.to_string());
        EventKind::ToolInvocation {
            call_id: call_id.to_string(),
            tool_name: name,
            tool_kind: kind,
            input: update.get("rawInput").cloned().unwrap_or(Value::Null),
            parent_call_id: None,
        }
    }

    fn tool_call_update(&mut self, update: &Value) -> Vec<EventKind> {
        let Some(call_id) = update.get("toolCallId").and_then(|id| id.as_str()) else {
            return Vec::new();
        };
        if !matches!(
            update.get("status").and_then(|s| s.as_str()),
            Some("completed") | Some("failed")
        ) {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.open_tools.contains_key(call_id) {
            if update.get("title").is_none() && update.get("kind").is_none() {
                tracing::warn!(call_id, "Completion for unknown tool call dropped");
                return events;
            }
            events.push(self.open(call_id, update));
        }
        events.extend(self.complete(call_id, update));
        events
    }

    fn complete(&mut self, call_id: &str, update: &Value) -> Vec<EventKind> {
        let Some(tool) = self.take_open(call_id) else {
            return Vec::new();
        };
        let failed = update.get("status").and_then(|s| s.as_str()) == Some("failed");
        let error = failed.then(|| {
            let text = content_entries_text(update);
            if text.is_empty() {
                "Tool call failed".to_string()
            } else {
                text
            }
        });
        vec![EventKind::ToolCompletion {
            call_id: call_id.to_string(),
            tool_name: tool.name,
            tool_kind: tool.kind,
            outcome: if failed {
                ToolOutcome::Failure
            } else {
                ToolOutcome::Success
            },
            output: tool_output(update),
            error,
            duration_ms: Some(tool.started.elapsed().as_millis() as u64),
            parent_call_id: None,
        }]
    }

    fn take_open(&mut self, call_id: &str) -> Option<OpenTool> {
        self.open_order.retain(|id| id != call_id);
        self.open_tools.remove(call_id)
    }

    /// Close every open tool call as cancelled, oldest first
    pub fn cancel_open_tools(&mut self) -> Vec<EventKind> {
        let order = std::mem::take(&mut self.open_order);
        order
            .into_iter()
            .filter_map(|id| {
                let tool = self.open_tools.remove(&id)?;
                Some(EventKind::ToolCompletion {
                    call_id: id,
                    tool_name: tool.name,
                    tool_kind: tool.kind,
                    outcome: ToolOutcome::Cancelled,
                    output: Value::Null,
                    error: None,
                    duration_ms: Some(tool.started.elapsed().as_millis() as u64),
                    parent_call_id: None,
                })
            })
            .collect()
    }

    /// Events closing a turn once the prompt response (or its failure) arrives
    pub fn finish_turn(&mut self, stop_reason: Option<String>, error: Option<String>) -> Vec<EventKind> {
        let mut events = self.flush();
        events.extend(self.cancel_open_tools());
        let is_error = error.is_some();
        if let Some(message) = error {
            events.push(EventKind::text(TextKind::Error, message));
        }
        events.push(EventKind::TurnComplete {
            usage: None,
            cost_usd: None,
            duration_ms: self
                .turn_started
                .take()
                .map(|started| started.elapsed().as_millis() as u64),
            num_turns: Some(1),
            stop_reason,
            is_error,
            permission_denials: Vec::new(),
        });
        events
    }
}
