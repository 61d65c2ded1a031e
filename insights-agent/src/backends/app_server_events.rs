// ABOUTME: Maps app-server thread/turn/item notifications onto normalized events.
// ABOUTME: Streams agent text as deltas, pairs item start/complete, accumulates token usage.

use crate::event::{CompactionTrigger, EventKind, StatusKind, TextKind, ToolOutcome, Usage};
use crate::tool_kind::{classify, ToolKind, APP_SERVER_ITEMS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

struct OpenItem {
    name: String,
    kind: ToolKind,
    started: Instant,
}

#[derive(Default)]
pub struct AppServerEventMapper {
    open_items: HashMap<String, OpenItem>,
    open_order: Vec<String>,
    turn_started: Option<Instant>,
    last_usage: Option<Usage>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Native tool name and input for an item, or None when the item is not a tool call
fn tool_identity(item: &Value) -> Option<(String, Value)> {
    let item_type = item.get("type").and_then(|t| t.as_str())?;
    match item_type {
        "commandExecution" => Some((
            item_type.to_string(),
            json!({"command": item.get("command"), "cwd": item.get("cwd")}),
        )),
        "fileChange" => Some((
            item_type.to_string(),
            json!({"changes": item.get("changes").cloned().unwrap_or(Value::Null)}),
        )),
        "mcpToolCall" => {
            let server = item.get("server").and_then(|s| s.as_str()).unwrap_or("unknown");
            let tool = item.get("tool").and_then(|s| s.as_str()).unwrap_or("unknown");
            Some((
                format!("mcp__{}__{}", server, tool),
                item.get("arguments").cloned().unwrap_or(Value::Null),
            ))
        }
        "webSearch" => Some((item_type.to_string(), json!({"query": item.get("query")}))),
        "imageView" => Some((item_type.to_string(), json!({"path": item.get("path")}))),
        _ => None,
    }
}

fn tool_output(item: &Value) -> Value {
    match item.get("type").and_then(|t| t.as_str()) {
        Some("commandExecution") => json!({
            "output": item.get("aggregatedOutput").cloned().unwrap_or(Value::Null),
            "exitCode": item.get("exitCode").cloned().unwrap_or(Value::Null),
        }),
        Some("mcpToolCall") => item
            .get("result")
            .cloned()
            .unwrap_or(Value::Null),
        _ => item.get("changes").cloned().unwrap_or(Value::Null),
    }
}

fn render_plan(params: &Value) -> Option<String> {
    let steps = params.get("plan").and_then(|p| p.as_array())?;
    let mut lines = Vec::new();
    if let Some(explanation) = params.get("explanation").and_then(|e| e.as_str()) {
        lines.push(explanation.to_string());
    }
    for step in steps {
        let text = step.get("step").and_then(|s| s.as_str()).unwrap_or("");
        let marker = match step.get("status").and_then(|s| s.as_str()) {
            Some("completed") => "[x]",
            Some("inProgress") => "[~]",
            _ => "[ ]",
        };
        lines.push(format!("- {} {}", marker, text));
    }
    Some(lines.join("\n"))
}

fn parse_token_usage(params: &Value) -> Option<Usage> {
    let usage = params.get("tokenUsage")?;
    let breakdown = usage.get("last").or_else(|| usage.get("total"))?;
    Some(Usage {
        input_tokens: breakdown
            .get("inputTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: breakdown
            .get("outputTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_tokens: breakdown.get("cachedInputTokens").and_then(|v| v.as_u64()),
        cache_write_tokens: None,
        reasoning_tokens: breakdown
            .get("reasoningOutputTokens")
            .and_then(|v| v.as_u64()),
        context_window: usage.get("modelContextWindow").and_then(|v| v.as_u64()),
        cost_usd: None,
        extra: Some(usage.clone()),
    })
}

impl AppServerEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one notification. Unknown methods yield nothing.
    pub fn map(&mut self, method: &str, params: &Value) -> Vec<EventKind> {
        match method {
            "turn/started" => {
                self.turn_started = Some(Instant::now());
                vec![EventKind::status(StatusKind::Working)]
            }
            "item/started" => params
                .get("item")
                .map(|item| self.item_started(item))
                .unwrap_or_default(),
            "item/completed" => params
                .get("item")
                .map(|item| self.item_completed(item))
                .unwrap_or_default(),
            "item/agentMessage/delta" => delta_event(params, TextKind::Text),
            "item/reasoning/textDelta" | "item/reasoning/summaryTextDelta" => {
                delta_event(params, TextKind::Thinking)
            }
            "turn/plan/updated" => render_plan(params)
                .map(|text| vec![EventKind::text(TextKind::Plan, text)])
                .unwrap_or_default(),
            "thread/tokenUsage/updated" => {
                if let Some(usage) = parse_token_usage(params) {
                    self.last_usage = Some(usage);
                }
                Vec::new()
            }
            "turn/completed" => self.turn_completed(params),
            "thread/compacted" => vec![EventKind::ContextCompaction {
                trigger: CompactionTrigger::Auto,
                pre_tokens: None,
            }],
            "error" => {
                let message = params
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error");
                vec![EventKind::text(TextKind::Error, message)]
            }
            _ => Vec::new(),
        }
    }

    fn item_started(&mut self, item: &Value) -> Vec<EventKind> {
        if item.get("type").and_then(|t| t.as_str()) == Some("contextCompaction") {
            return vec![EventKind::status(StatusKind::Compacting)];
        }
        let Some(id) = str_field(item, "id") else {
            return Vec::new();
        };
        match tool_identity(item) {
            Some((name, input)) => vec![self.open(id, name, input)],
            None => Vec::new(),
        }
    }

    fn open(&mut self, id: String, name: String, input: Value) -> EventKind {
        let kind = classify(APP_SERVER_ITEMS, &name);
        self.open_order.push(id.clone());
        self.open_items.insert(
            id.clone(),
            OpenItem {
                name: name.clone(),
                kind,
                started: Instant::now(),
            },
        );
        EventKind::ToolInvocation {
            call_id: id,
            tool_name: name,
            tool_kind: kind,
            input,
            parent_call_id: None,
        }
    }

    fn item_completed(&mut self, item: &Value) -> Vec<EventKind> {
        let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let id = str_field(item, "id");
        match item_type {
            "agentMessage" => {
                let text = str_field(item, "text").unwrap_or_default();
                if text.is_empty() {
                    return Vec::new();
                }
                return vec![EventKind::Text {
                    kind: TextKind::Text,
                    text,
                    message_id: id,
                    parent_call_id: None,
                }];
            }
            "reasoning" => {
                let text = item
                    .get("summary")
                    .and_then(|s| s.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .filter(|t| !t.is_empty())
                    .or_else(|| str_field(item, "text"))
                    .unwrap_or_default();
                if text.is_empty() {
                    return Vec::new();
                }
                return vec![EventKind::Text {
                    kind: TextKind::Thinking,
                    text,
                    message_id: id,
                    parent_call_id: None,
                }];
            }
            "contextCompaction" => {
                return vec![EventKind::ContextCompaction {
                    trigger: CompactionTrigger::Auto,
                    pre_tokens: None,
                }];
            }
            _ => {}
        }

        let Some(id) = id else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if !self.open_items.contains_key(&id) {
            match tool_identity(item) {
                Some((name, input)) => events.push(self.open(id.clone(), name, input)),
                None => return Vec::new(),
            }
        }
        let Some(open) = self.take_open(&id) else {
            return events;
        };

        let status = item.get("status").and_then(|s| s.as_str()).unwrap_or("completed");
        let (outcome, error) = match status {
            "failed" => (
                ToolOutcome::Failure,
                Some(
                    item.get("error")
                        .and_then(|e| e.get("message").or(Some(e)))
                        .and_then(|m| m.as_str())
                        .unwrap_or("Tool failed")
                        .to_string(),
                ),
            ),
            "declined" => (ToolOutcome::Failure, Some("Declined".to_string())),
            _ => (ToolOutcome::Success, None),
        };
        let duration_ms = item
            .get("durationMs")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| open.started.elapsed().as_millis() as u64);

        events.push(EventKind::ToolCompletion {
            call_id: id,
            tool_name: open.name,
            tool_kind: open.kind,
            outcome,
            output: tool_output(item),
            error,
            duration_ms: Some(duration_ms),
            parent_call_id: None,
        });
        events
    }

    fn turn_completed(&mut self, params: &Value) -> Vec<EventKind> {
        let mut events = self.cancel_open_items();
        let turn = params.get("turn");
        let status = turn.and_then(|t| str_field(t, "status"));
        let is_error = status.as_deref() == Some("failed");
        if is_error {
            let message = turn
                .and_then(|t| t.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Turn failed");
            events.push(EventKind::text(TextKind::Error, message));
        }
        events.push(EventKind::TurnComplete {
            usage: self.last_usage.take(),
            cost_usd: None,
            duration_ms: self
                .turn_started
                .take()
                .map(|started| started.elapsed().as_millis() as u64),
            num_turns: Some(1),
            stop_reason: status,
            is_error,
            permission_denials: Vec::new(),
        });
        events
    }

    fn take_open(&mut self, id: &str) -> Option<OpenItem> {
        let item = self.open_items.remove(id)?;
        self.open_order.retain(|open| open != id);
        Some(item)
    }

    /// Close every open item as cancelled, oldest first
    pub fn cancel_open_items(&mut self) -> Vec<EventKind> {
        let mut events = Vec::new();
        for id in std::mem::take(&mut self.open_order) {
            if let Some(open) = self.open_items.remove(&id) {
                events.push(EventKind::ToolCompletion {
                    call_id: id,
                    tool_name: open.name,
                    tool_kind: open.kind,
                    outcome: ToolOutcome::Cancelled,
                    output: Value::Null,
                    error: None,
                    duration_ms: Some(open.started.elapsed().as_millis() as u64),
                    parent_call_id: None,
                });
            }
        }
        events
    }
}

fn delta_event(params: &Value, kind: TextKind) -> Vec<EventKind> {
    let Some(delta) = params
        .get("delta")
        .and_then(|d| d.as_str())
        .filter(|d| !d.is_empty())
    else {
        return Vec::new();
    };
    vec![EventKind::StreamDelta {
        message_id: str_field(params, "itemId").unwrap_or_default(),
        kind,
        delta: delta.to_string(),
        parent_call_id: None,
    }]
}
