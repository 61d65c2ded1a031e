// ABOUTME: Tests for Conversation: permission queue, working timer, agent status and event folding.
// ABOUTME: Uses tokio's paused clock to check timer behaviour exactly.

use insights_agent::{
    CompactionTrigger, EventKind, InsightsEvent, PendingDecision, PermissionDecision,
    PermissionRequest, Provider, StatusKind, TextKind, ToolKind, ToolOutcome, Usage,
};
use insights_core::{
    AgentStatus, Conversation, ConversationState, LogEntryKind, INTERRUPTED_RESULT, TIMEOUT_REASON,
};
use serde_json::json;
use std::time::Duration;

fn event(kind: EventKind) -> InsightsEvent {
    InsightsEvent::new(Provider::Mock, "s1", kind)
}

fn init() -> InsightsEvent {
    event(EventKind::SessionInit {
        resolved_session_id: "thread-1".to_string(),
        model: Some("sonnet".to_string()),
        cwd: None,
        tools: Vec::new(),
        permission_mode: None,
    })
}

fn tool(call_id: &str, name: &str, parent: Option<&str>) -> InsightsEvent {
    event(EventKind::ToolInvocation {
        call_id: call_id.to_string(),
        tool_name: name.to_string(),
        tool_kind: ToolKind::Execute,
        input: json!({}),
        parent_call_id: parent.map(str::to_string),
    })
}

fn tool_done(call_id: &str, outcome: ToolOutcome) -> InsightsEvent {
    event(EventKind::ToolCompletion {
        call_id: call_id.to_string(),
        tool_name: "Bash".to_string(),
        tool_kind: ToolKind::Execute,
        outcome,
        output: json!("done"),
        error: None,
        duration_ms: None,
        parent_call_id: None,
    })
}

fn permission(tool_use_id: Option<&str>) -> (PermissionRequest, PendingDecision) {
    let (request, pending) = PermissionRequest::new("s1", "Bash", ToolKind::Execute, json!({}));
    (request.with_tool_use_id(tool_use_id.map(str::to_string)), pending)
}

fn working_conversation() -> Conversation {
    let mut conversation = Conversation::new();
    conversation.apply_event(&init());
    conversation.begin_turn();
    conversation
}

#[tokio::test(start_paused = true)]
async fn test_timer_pauses_while_permissions_pending() {
    let mut conversation = working_conversation();
    tokio::time::advance(Duration::from_secs(2)).await;

    let (a, _pa) = permission(None);
    let (b, _pb) = permission(None);
    conversation.add_pending_permission(a);
    conversation.add_pending_permission(b);
    assert!(conversation.timer().is_paused());
    assert_eq!(conversation.state(), ConversationState::WaitingForPermission);
    assert_eq!(conversation.pending_permission_count(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(conversation.allow_permission(None));
    assert!(conversation.timer().is_paused());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(conversation.deny_permission("no"));
    assert!(conversation.timer().is_running());
    assert_eq!(conversation.elapsed(), Duration::from_secs(2));

    tokio::time::advance(Duration::from_secs(1)).await;
    conversation.apply_event(&event(EventKind::turn_complete(Some("end_turn".into()), false)));
    assert_eq!(conversation.last_elapsed(), Some(Duration::from_secs(3)));
    assert_eq!(conversation.state(), ConversationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_permission_while_idle_does_not_start_timer() {
    let mut conversation = Conversation::new();
    conversation.apply_event(&init());
    let (request, _pending) = permission(None);
    conversation.add_pending_permission(request);
    assert!(conversation.timer().is_idle());
    assert!(conversation.is_waiting_for_permission());
    assert_eq!(conversation.state(), ConversationState::Idle);

    conversation.allow_permission(None);
    assert!(conversation.timer().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_turn_starting_behind_pending_permission_stays_paused() {
    let mut conversation = Conversation::new();
    conversation.apply_event(&init());
    let (request, _pending) = permission(None);
    conversation.add_pending_permission(request);

    conversation.begin_turn();
    assert!(conversation.timer().is_paused());
    assert_eq!(conversation.state(), ConversationState::WaitingForPermission);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(conversation.allow_permission(None));
    assert!(conversation.timer().is_running());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(conversation.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_request_cancelled_by_backend_leaves_queue() {
    let mut conversation = working_conversation();
    let (stale, pending) = permission(None);
    let (next, _next_pending) = permission(None);
    conversation.add_pending_permission(stale.clone());
    conversation.add_pending_permission(next.clone());

    assert!(stale.deny("Cancelled by agent"));
    assert_eq!(conversation.prune_resolved_permissions(), 1);
    assert_eq!(conversation.current_permission().map(|r| r.id.clone()), Some(next.id.clone()));
    assert_eq!(
        pending.wait().await,
        PermissionDecision::Deny {
            reason: "Cancelled by agent".to_string()
        }
    );

    assert!(next.deny("Cancelled by agent"));
    conversation.apply_event(&event(EventKind::status(StatusKind::Working)));
    assert_eq!(conversation.pending_permission_count(), 0);
    assert!(conversation.timer().is_running());
    assert_eq!(conversation.state(), ConversationState::Working);
    assert!(!conversation.allow_permission(None));
}

#[tokio::test]
async fn test_permissions_resolve_in_fifo_order() {
    let mut conversation = working_conversation();
    let (a, pa) = permission(None);
    let (b, pb) = permission(None);
    conversation.add_pending_permission(a.clone());
    conversation.add_pending_permission(b);

    assert_eq!(conversation.current_permission().map(|r| r.id.clone()), Some(a.id));
    conversation.deny_permission("first");
    conversation.allow_permission(Some(json!({"command": "ls"})));
    assert!(!conversation.allow_permission(None));

    assert_eq!(
        pa.wait().await,
        PermissionDecision::Deny {
            reason: "first".to_string()
        }
    );
    assert_eq!(
        pb.wait().await,
        PermissionDecision::Allow {
            updated_input: Some(json!({"command": "ls"}))
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_removal_resumes_timer() {
    let mut conversation = working_conversation();
    let (request, pending) = permission(Some("toolu_1"));
    conversation.add_pending_permission(request);
    assert!(conversation.timer().is_paused());

    assert!(!conversation.remove_pending_permission_by_tool_use_id("toolu_other"));
    assert!(conversation.remove_pending_permission_by_tool_use_id("toolu_1"));
    assert!(conversation.timer().is_running());
    assert_eq!(
        pending.wait().await,
        PermissionDecision::Deny {
            reason: TIMEOUT_REASON.to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_turn_ending_while_paused_discards_elapsed() {
    let mut conversation = working_conversation();
    tokio::time::advance(Duration::from_secs(5)).await;
    let (request, pending) = permission(None);
    conversation.add_pending_permission(request);

    conversation.apply_event(&event(EventKind::turn_complete(None, false)));
    assert_eq!(conversation.last_elapsed(), None);
    assert!(conversation.timer().is_idle());
    assert_eq!(conversation.pending_permission_count(), 0);
    assert!(!pending.wait().await.is_allow());
}

#[tokio::test]
async fn test_interrupt_denies_pending_and_errors_active_agents() {
    let mut conversation = working_conversation();
    conversation.apply_event(&tool("done", "Read", None));
    conversation.apply_event(&tool_done("done", ToolOutcome::Success));
    conversation.apply_event(&tool("busy", "Bash", None));
    conversation.apply_event(&tool("asking", "Bash", None));
    let (request, pending) = permission(Some("asking"));
    conversation.add_pending_permission(request);
    assert_eq!(
        conversation.agents().get("asking").map(|a| a.status),
        Some(AgentStatus::WaitingUser)
    );

    assert!(conversation.interrupt());

    assert_eq!(
        pending.wait().await,
        PermissionDecision::Deny {
            reason: INTERRUPTED_RESULT.to_string()
        }
    );
    assert!(!conversation.is_working());
    assert_eq!(conversation.pending_permission_count(), 0);
    let agents = conversation.agents();
    assert_eq!(agents.get("done").map(|a| a.status), Some(AgentStatus::Completed));
    for id in ["busy", "asking"] {
        let agent = agents.get(id).cloned();
        assert_eq!(
            agent.map(|a| (a.status, a.result)),
            Some((AgentStatus::Error, Some(INTERRUPTED_RESULT.to_string())))
        );
    }
}

#[test]
fn test_interrupt_without_session_is_noop() {
    let mut conversation = Conversation::new();
    assert!(!conversation.interrupt());
}

#[tokio::test]
async fn test_reset_session_clears_state_and_marks_log() {
    let mut conversation = working_conversation();
    conversation.apply_event(&tool("c1", "Bash", None));
    let (request, pending) = permission(None);
    conversation.add_pending_permission(request);
    conversation.apply_event(&event(EventKind::status(StatusKind::Compacting)));

    conversation.reset_session();

    assert!(!conversation.has_active_session());
    assert_eq!(conversation.resolved_session_id(), None);
    assert!(conversation.agents().is_empty());
    assert!(!conversation.is_working());
    assert!(!conversation.is_compacting());
    assert_eq!(conversation.pending_permission_count(), 0);
    assert!(!pending.wait().await.is_allow());
    assert_eq!(
        conversation.log().last().map(|e| e.kind.clone()),
        Some(LogEntryKind::ContextCleared)
    );
    assert!(conversation.log().current_context().is_empty());
}

#[test]
fn test_session_init_and_turn_complete() {
    let mut conversation = Conversation::new();
    conversation.apply_event(&init());
    assert!(conversation.has_active_session());
    assert_eq!(conversation.resolved_session_id(), Some("thread-1"));
    assert_eq!(conversation.model(), Some("sonnet"));

    conversation.apply_event(&event(EventKind::status(StatusKind::Working)));
    assert!(conversation.is_working());

    conversation.apply_event(&event(EventKind::TurnComplete {
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        }),
        cost_usd: Some(0.01),
        duration_ms: Some(1200),
        num_turns: Some(1),
        stop_reason: Some("error_max_turns".to_string()),
        is_error: true,
        permission_denials: Vec::new(),
    }));
    assert!(!conversation.is_working());
    assert_eq!(conversation.state(), ConversationState::Error);
    assert_eq!(conversation.last_usage().map(|u| u.input_tokens), Some(10));
    assert_eq!(conversation.last_cost_usd(), Some(0.01));
}

#[test]
fn test_subagent_lifecycle_and_permission_event() {
    let mut conversation = working_conversation();
    conversation.apply_event(&tool("task_1", "Task", None));
    conversation.apply_event(&event(EventKind::SubagentSpawn {
        call_id: "task_1".to_string(),
        agent_type: Some("explorer".to_string()),
        description: Some("find the bug".to_string()),
        prompt: None,
        parent_call_id: None,
    }));
    conversation.apply_event(&tool("nested", "Bash", Some("task_1")));
    assert_eq!(
        conversation.agents().get("task_1").map(|a| a.status),
        Some(AgentStatus::WaitingTool)
    );

    conversation.apply_event(&event(EventKind::PermissionRequest {
        request_id: "r1".to_string(),
        tool_name: "Bash".to_string(),
        tool_kind: ToolKind::Execute,
        input: json!({}),
        tool_use_id: Some("nested".to_string()),
        reason: None,
    }));
    assert_eq!(
        conversation.agents().get("nested").map(|a| a.status),
        Some(AgentStatus::WaitingUser)
    );

    conversation.apply_event(&tool_done("nested", ToolOutcome::Failure));
    conversation.apply_event(&event(EventKind::SubagentComplete {
        call_id: "task_1".to_string(),
        outcome: ToolOutcome::Success,
        result: Some("found it".to_string()),
    }));
    let task = conversation.agents().get("task_1").cloned();
    assert_eq!(
        task.map(|a| (a.status, a.is_subagent, a.result)),
        Some((AgentStatus::Completed, true, Some("found it".to_string())))
    );
    assert_eq!(
        conversation.agents().get("nested").map(|a| a.status),
        Some(AgentStatus::Error)
    );
}

#[test]
fn test_compaction_and_text_logging() {
    let mut conversation = working_conversation();
    conversation.apply_event(&event(EventKind::status(StatusKind::Compacting)));
    assert!(conversation.is_compacting());
    conversation.apply_event(&event(EventKind::ContextCompaction {
        trigger: CompactionTrigger::Auto,
        pre_tokens: Some(150_000),
    }));
    assert!(!conversation.is_compacting());
    assert!(conversation.has_active_session());

    conversation.apply_event(&event(EventKind::text(TextKind::Error, "quota exceeded")));
    conversation.apply_event(&event(EventKind::text(TextKind::Text, "hello")));
    assert_eq!(conversation.log().errors().collect::<Vec<_>>(), vec!["quota exceeded"]);
    assert!(matches!(
        conversation.log().last().map(|e| &e.kind),
        Some(LogEntryKind::Assistant { text, .. }) if text == "hello"
    ));

    conversation.apply_event(&event(EventKind::ContextCompaction {
        trigger: CompactionTrigger::Clear,
        pre_tokens: None,
    }));
    assert!(!conversation.has_active_session());
    assert_eq!(
        conversation.log().last().map(|e| e.kind.clone()),
        Some(LogEntryKind::ContextCleared)
    );
}

#[test]
fn test_mode_change_and_exit() {
    let mut conversation = working_conversation();
    conversation.apply_event(&event(EventKind::SessionStatus {
        status: StatusKind::ModeChanged,
        message: Some("plan".to_string()),
    }));
    assert_eq!(
        conversation.permission_mode(),
        Some(insights_agent::PermissionMode::Plan)
    );

    conversation.apply_event(&event(EventKind::SessionStatus {
        status: StatusKind::Exited,
        message: Some("CLI process exited".to_string()),
    }));
    assert!(!conversation.has_active_session());
    assert!(!conversation.is_working());
    assert!(!conversation.interrupt());
}
