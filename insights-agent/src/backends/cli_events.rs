// ABOUTME: Maps Claude-style stream-json CLI output onto normalized events.
// ABOUTME: Tracks open tool calls so completions always follow their invocation.

use crate::event::{
    CompactionTrigger, EventKind, PermissionDenial, StatusKind, TextKind, ToolOutcome, Usage,
};
use crate::options::PermissionMode;
use crate::tool_kind::{classify, ToolKind, CLAUDE_TOOLS};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Delegation tool that spawns a subagent
pub const TASK_TOOL: &str = "Task";

struct OpenTool {
    name: String,
    kind: ToolKind,
    parent_call_id: Option<String>,
    started: Instant,
}

#[derive(Default)]
pub struct ClaudeEventMapper {
    open_tools: HashMap<String, OpenTool>,
    /// Insertion order of open tools, so cancellations come out deterministically
    open_order: Vec<String>,
    streaming_message_id: Option<String>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Text of a tool_result content field, which may be a string or a list of blocks
fn result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl ClaudeEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_open_tools(&self) -> bool {
        !self.open_tools.is_empty()
    }

    /// Translate one stdout message. Unknown shapes yield nothing.
    pub fn map(&mut self, message: &Value) -> Vec<EventKind> {
        let Some(message_type) = message.get("type").and_then(|t| t.as_str()) else {
            return Vec::new();
        };

        match message_type {
            "system" => self.map_system(message),
            "assistant" => self.map_assistant(message),
            "user" => self.map_user(message),
            "stream_event" => self.map_stream_event(message),
            "result" => self.map_result(message),
            _ => Vec::new(),
        }
    }

    fn map_system(&mut self, message: &Value) -> Vec<EventKind> {
        match message.get("subtype").and_then(|s| s.as_str()) {
            Some("init") => {
                let Some(session_id) = str_field(message, "session_id") else {
                    return Vec::new();
                };
                let tools = message
                    .get("tools")
                    .and_then(|t| t.as_array())
                    .map(|t| t.iter().filter_map(|n| n.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                vec![EventKind::SessionInit {
                    resolved_session_id: session_id,
                    model: str_field(message, "model"),
                    cwd: str_field(message, "cwd"),
                    tools,
                    permission_mode: message
                        .get("permissionMode")
                        .and_then(|m| m.as_str())
                        .and_then(|m| m.parse::<PermissionMode>().ok()),
                }]
            }
            Some("compact_boundary") => {
                let metadata = message.get("compact_metadata");
                let trigger = match metadata
                    .and_then(|m| m.get("trigger"))
                    .and_then(|t| t.as_str())
                {
                    Some("manual") => CompactionTrigger::Manual,
                    Some("clear") => CompactionTrigger::Clear,
                    _ => CompactionTrigger::Auto,
                };
                vec![EventKind::ContextCompaction {
                    trigger,
                    pre_tokens: metadata
                        .and_then(|m| m.get("pre_tokens"))
                        .and_then(|t| t.as_u64()),
                }]
            }
            Some("status") => match message.get("status").and_then(|s| s.as_str()) {
                Some("compacting") => vec![EventKind::status(StatusKind::Compacting)],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn map_assistant(&mut self, message: &Value) -> Vec<EventKind> {
        let parent = str_field(message, "parent_tool_use_id");
        let inner = message.get("message");
        let message_id = inner.and_then(|m| str_field(m, "id"));
        let Some(content) = inner
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(EventKind::Text {
                                kind: TextKind::Text,
                                text: text.to_string(),
                                message_id: message_id.clone(),
                                parent_call_id: parent.clone(),
                            });
                        }
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                        events.push(EventKind::Text {
                            kind: TextKind::Thinking,
                            text: text.to_string(),
                            message_id: message_id.clone(),
                            parent_call_id: parent.clone(),
                        });
                    }
                }
                Some("tool_use") => {
                    let (Some(call_id), Some(name)) = (str_field(block, "id"), str_field(block, "name"))
                    else {
                        tracing::warn!("tool_use block without id or name");
                        continue;
                    };
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let kind = classify(CLAUDE_TOOLS, &name);
                    tracing::debug!(tool = %name, id = %call_id, "Tool use detected");

                    events.push(EventKind::ToolInvocation {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                        tool_kind: kind,
                        input: input.clone(),
                        parent_call_id: parent.clone(),
                    });
                    if name == TASK_TOOL {
                        events.push(EventKind::SubagentSpawn {
                            call_id: call_id.clone(),
                            agent_type: str_field(&input, "subagent_type"),
                            description: str_field(&input, "description"),
                            prompt: str_field(&input, "prompt"),
                            parent_call_id: parent.clone(),
                        });
                    }
                    self.open_order.push(call_id.clone());
                    self.open_tools.insert(
                        call_id,
                        OpenTool {
                            name,
                            kind,
                            parent_call_id: parent.clone(),
                            started: Instant::now(),
                        },
                    );
                }
                _ => {}
            }
        }
        events
    }

    fn map_user(&mut self, message: &Value) -> Vec<EventKind> {
        let Some(content) = message
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let Some(call_id) = str_field(block, "tool_use_id") else {
                continue;
            };
            let Some(tool) = self.take_open(&call_id) else {
                tracing::warn!(call_id = %call_id, "tool_result for unknown tool call, dropping");
                continue;
            };

            let is_error = block
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let text = result_text(block.get("content"));
            let outcome = if is_error {
                ToolOutcome::Failure
            } else {
                ToolOutcome::Success
            };
            let output = message
                .get("tool_use_result")
                .cloned()
                .unwrap_or_else(|| Value::String(text.clone()));

            events.push(EventKind::ToolCompletion {
                call_id: call_id.clone(),
                tool_name: tool.name.clone(),
                tool_kind: tool.kind,
                outcome,
                output,
                error: is_error.then(|| text.clone()),
                duration_ms: Some(tool.started.elapsed().as_millis() as u64),
                parent_call_id: tool.parent_call_id.clone(),
            });
            if tool.name == TASK_TOOL {
                events.push(EventKind::SubagentComplete {
                    call_id,
                    outcome,
                    result: Some(text),
                });
            }
        }
        events
    }

    fn map_stream_event(&mut self, message: &Value) -> Vec<EventKind> {
        let Some(event) = message.get("event") else {
            return Vec::new();
        };
        let parent = str_field(message, "parent_tool_use_id");
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                self.streaming_message_id = event.get("message").and_then(|m| str_field(m, "id"));
                Vec::new()
            }
            Some("content_block_delta") => {
                let Some(delta) = event.get("delta") else {
                    return Vec::new();
                };
                let (kind, text) = match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => (TextKind::Text, str_field(delta, "text")),
                    Some("thinking_delta") => (TextKind::Thinking, str_field(delta, "thinking")),
                    _ => return Vec::new(),
                };
                match text {
                    Some(delta) if !delta.is_empty() => vec![EventKind::StreamDelta {
                        message_id: self.streaming_message_id.clone().unwrap_or_default(),
                        kind,
                        delta,
                        parent_call_id: parent,
                    }],
                    _ => Vec::new(),
                }
            }
            Some("message_stop") => {
                self.streaming_message_id = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn map_result(&mut self, message: &Value) -> Vec<EventKind> {
        let mut events = self.cancel_open_tools();

        let is_error = message
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if is_error {
            let text = str_field(message, "result")
                .or_else(|| str_field(message, "error"))
                .unwrap_or_else(|| "Unknown error".to_string());
            events.push(EventKind::text(TextKind::Error, text));
        }

        let permission_denials = message
            .get("permission_denials")
            .and_then(|d| d.as_array())
            .map(|denials| {
                denials
                    .iter()
                    .filter_map(|d| {
                        Some(PermissionDenial {
                            tool_name: str_field(d, "tool_name")?,
                            tool_use_id: str_field(d, "tool_use_id"),
                            input: d.get("tool_input").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = extract_usage(message);
        tracing::debug!(
            input_tokens = usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            output_tokens = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            "Turn complete"
        );

        events.push(EventKind::TurnComplete {
            cost_usd: message.get("total_cost_usd").and_then(|v| v.as_f64()),
            usage,
            duration_ms: message.get("duration_ms").and_then(|v| v.as_u64()),
            num_turns: message
                .get("num_turns")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
            stop_reason: str_field(message, "stop_reason").or_else(|| str_field(message, "subtype")),
            is_error,
            permission_denials,
        });
        events
    }

    fn take_open(&mut self, call_id: &str) -> Option<OpenTool> {
        let tool = self.open_tools.remove(call_id)?;
        self.open_order.retain(|id| id != call_id);
        Some(tool)
    }

    /// Close every open tool as cancelled, oldest first
    pub fn cancel_open_tools(&mut self) -> Vec<EventKind> {
        let mut events = Vec::new();
        for call_id in std::mem::take(&mut self.open_order) {
            let Some(tool) = self.open_tools.remove(&call_id) else {
                continue;
            };
            events.push(EventKind::ToolCompletion {
                call_id: call_id.clone(),
                tool_name: tool.name.clone(),
                tool_kind: tool.kind,
                outcome: ToolOutcome::Cancelled,
                output: Value::Null,
                error: None,
                duration_ms: Some(tool.started.elapsed().as_millis() as u64),
                parent_call_id: tool.parent_call_id,
            });
            if tool.name == TASK_TOOL {
                events.push(EventKind::SubagentComplete {
                    call_id,
                    outcome: ToolOutcome::Cancelled,
                    result: None,
                });
            }
        }
        events
    }
}

/// Token usage and cost from a result message
pub fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    // Get total cost
    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    // Get usage object for token counts
    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj.get("cache_read_input_tokens").and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    // modelUsage carries per-model totals and the context window
    if let Some(model_usage) = json.get("modelUsage").and_then(|v| v.as_object()) {
        let fill_tokens = usage.input_tokens == 0 && usage.output_tokens == 0;
        for (_model, stats) in model_usage {
            if fill_tokens {
                usage.input_tokens += stats
                    .get("inputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                usage.output_tokens += stats
                    .get("outputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                usage.cache_read_tokens = usage
                    .cache_read_tokens
                    .or_else(|| stats.get("cacheReadInputTokens").and_then(|v| v.as_u64()));
                usage.cache_write_tokens = usage
                    .cache_write_tokens
                    .or_else(|| stats.get("cacheCreationInputTokens").and_then(|v| v.as_u64()));
            }
            usage.context_window = usage
                .context_window
                .or_else(|| stats.get("contextWindow").and_then(|v| v.as_u64()));
            found_usage = true;
        }
    }

    if found_usage {
        Some(usage)
    } else {
        None
    }
}
