// ABOUTME: Tests for the scripted mock backend.
// ABOUTME: Front-end code is tested against it, so its turn and permission semantics must hold.

mod common;

use common::{collect_turn, next, next_event};
use insights_agent::backends::mock::{MockBackend, MockStep};
use insights_agent::{
    AgentBackend, AgentError, BackendError, CreateSessionRequest, ErrorCode, EventKind,
    ModelInfo, PermissionDecision, PermissionMode, ReasoningEffort, SessionOptions, StatusKind,
    TextKind, ToolKind, ToolOutcome,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_text_response() {
    let backend = MockBackend::new().on_prompt("hello").respond_text("Hi there!");
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    session.send("hello").await.unwrap();
    let kinds = collect_turn(&mut events).await;
    assert!(matches!(&kinds[0], EventKind::SessionInit { resolved_session_id, .. } if resolved_session_id == "mock-session-1"));
    assert!(matches!(&kinds[1], EventKind::UserInput { text } if text == "hello"));
    assert!(matches!(&kinds[2], EventKind::SessionStatus { status: StatusKind::Working, .. }));
    assert!(matches!(&kinds[3], EventKind::Text { text, .. } if text == "Hi there!"));
    assert!(matches!(&kinds[4], EventKind::TurnComplete { is_error: false, .. }));
}

#[tokio::test]
async fn test_tool_response() {
    let backend = MockBackend::new().on_prompt("read file").respond_with(vec![
        EventKind::ToolInvocation {
            call_id: "t1".to_string(),
            tool_name: "Read".to_string(),
            tool_kind: ToolKind::Read,
            input: json!({"path": "/tmp/foo"}),
            parent_call_id: None,
        },
        EventKind::ToolCompletion {
            call_id: "t1".to_string(),
            tool_name: "Read".to_string(),
            tool_kind: ToolKind::Read,
            outcome: ToolOutcome::Success,
            output: json!({"content": "file contents"}),
            error: None,
            duration_ms: Some(10),
            parent_call_id: None,
        },
        EventKind::turn_complete(Some("end_turn".to_string()), false),
    ]);
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp").with_prompt("read file"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    let kinds = collect_turn(&mut events).await;
    let tools: Vec<&EventKind> = kinds
        .iter()
        .filter(|k| matches!(k, EventKind::ToolInvocation { .. } | EventKind::ToolCompletion { .. }))
        .collect();
    assert_eq!(tools.len(), 2);
    assert_eq!(backend.record().prompts, vec!["read file".to_string()]);
}

#[tokio::test]
async fn test_error_response() {
    let backend = MockBackend::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::RateLimited, "Too many requests");
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    session.send("please fail").await.unwrap();
    let kinds = collect_turn(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Text { kind: TextKind::Error, text, .. } if text == "Too many requests")));
    match kinds.last().unwrap() {
        EventKind::TurnComplete { stop_reason, is_error, .. } => {
            assert!(is_error);
            assert_eq!(stop_reason.as_deref(), Some("RATE_LIMITED"));
        }
        other => panic!("Expected TurnComplete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_expectations_are_consumed_in_order() {
    let backend = MockBackend::new()
        .on_prompt("step")
        .respond_text("first")
        .on_prompt("step")
        .respond_text("second");
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    for expected in ["first", "second"] {
        session.send("step").await.unwrap();
        let kinds = collect_turn(&mut events).await;
        assert!(kinds.iter().any(|k| matches!(k, EventKind::Text { text, .. } if text == expected)));
    }

    session.send("step").await.unwrap();
    let kinds = collect_turn(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Text { text, .. } if text.starts_with("Mock: no expectation"))));
}

#[tokio::test]
async fn test_permission_step_waits_for_decision() {
    let backend = MockBackend::new().on_prompt("write").respond_steps(vec![
        MockStep::permission("Write", ToolKind::Edit, json!({"file_path": "/tmp/x"})),
        MockStep::Event(EventKind::text(TextKind::Text, "written")),
        MockStep::Event(EventKind::turn_complete(Some("end_turn".to_string()), false)),
    ]);
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();
    let mut permissions = session.subscribe_permission_requests();

    session.send("write it").await.unwrap();
    let request = next(&mut permissions).await;
    assert_eq!(request.tool_name, "Write");

    request.allow(None);
    let kinds = collect_turn(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Text { text, .. } if text == "written")));
    assert_eq!(
        backend.record().decisions,
        vec![PermissionDecision::Allow { updated_input: None }]
    );
}

#[tokio::test]
async fn test_interrupt_cancels_running_turn() {
    let backend = MockBackend::new().on_prompt("slow").respond_steps(vec![
        MockStep::Delay(Duration::from_secs(60)),
        MockStep::Event(EventKind::text(TextKind::Text, "too late")),
        MockStep::Event(EventKind::turn_complete(Some("end_turn".to_string()), false)),
    ]);
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    session.send("slow").await.unwrap();
    session.interrupt().await.unwrap();
    let kinds = collect_turn(&mut events).await;
    assert!(matches!(
        kinds.last(),
        Some(EventKind::TurnComplete { stop_reason: Some(r), .. }) if r == "cancelled"
    ));
    assert!(!kinds.iter().any(|k| matches!(k, EventKind::Text { text, .. } if text == "too late")));

    // Idle interrupt emits nothing
    session.interrupt().await.unwrap();
    assert_eq!(backend.record().interrupts, 2);
}

#[tokio::test]
async fn test_mutators_are_recorded() {
    let backend = MockBackend::new();
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    session.set_model(Some("big")).await.unwrap();
    session.set_model(None).await.unwrap();
    session.set_permission_mode(Some(PermissionMode::Plan)).await.unwrap();
    session.set_reasoning_effort(Some(ReasoningEffort::High)).await.unwrap();
    next_event(&mut events, |k| matches!(k, EventKind::SessionStatus { status: StatusKind::ModeChanged, .. })).await;

    let record = backend.record();
    assert_eq!(record.models, vec![Some("big".to_string()), None]);
    assert_eq!(record.modes, vec![Some(PermissionMode::Plan)]);
    assert_eq!(record.efforts, vec![Some(ReasoningEffort::High)]);
}

#[tokio::test]
async fn test_kill_closes_streams() {
    let backend = MockBackend::new();
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();

    session.kill().await.unwrap();
    assert!(!session.is_alive());
    let kinds = common::collect_until_closed(&mut events).await;
    assert!(matches!(kinds.last(), Some(EventKind::SessionStatus { status: StatusKind::Exited, .. })));
    assert_eq!(
        session.send("anyone?").await.unwrap_err().code(),
        Some(ErrorCode::SessionClosed)
    );
    assert_eq!(backend.record().kills, 1);
}

#[tokio::test]
async fn test_resume_keeps_resolved_id() {
    let backend = MockBackend::new();
    let options = SessionOptions {
        resume_session_id: Some("earlier".to_string()),
        ..Default::default()
    };
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp").with_options(options))
        .await
        .unwrap();
    assert_eq!(session.resolved_session_id(), "earlier");
}

#[tokio::test]
async fn test_fail_next_create() {
    let backend = MockBackend::new().fail_next_create("no auth");
    let err = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Some(ErrorCode::SessionCreateError));
    assert!(backend.create_session(CreateSessionRequest::new("/tmp")).await.is_ok());
}

#[tokio::test]
async fn test_models_and_errors_stream() {
    let backend = MockBackend::new();
    assert_eq!(
        backend.list_models().await.unwrap_err().code(),
        Some(ErrorCode::Unsupported)
    );

    let backend = backend.with_models(vec![ModelInfo {
        id: "m1".to_string(),
        is_default: true,
        ..ModelInfo::default()
    }]);
    assert_eq!(backend.list_models().await.unwrap()[0].id, "m1");

    let mut errors = backend.subscribe_errors();
    backend.fail(true, AgentError::Backend(BackendError::new(ErrorCode::AuthFailed, "expired")));
    let failure = next(&mut errors).await;
    assert!(failure.fatal);
    assert_eq!(failure.error.code(), Some(ErrorCode::AuthFailed));
}

#[tokio::test]
async fn test_dispose_closes_sessions() {
    let backend = MockBackend::new();
    let session = backend
        .create_session(CreateSessionRequest::new("/tmp"))
        .await
        .unwrap();
    backend.dispose().await;
    assert!(!session.is_alive());
}
