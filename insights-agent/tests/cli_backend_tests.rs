// ABOUTME: Tests for the CLI backend against a scripted stream-json process.
// ABOUTME: Covers launch flags, user messages, permission control requests, interrupts and exit.

mod common;

use common::{collect_turn, collect_until_closed, next, next_event};
use insights_agent::backends::cli::{build_args, CliBackend, CliConfig};
use insights_agent::testing::{FakeLauncher, FakePeer};
use insights_agent::{
    AgentBackend, AgentSession, CreateSessionRequest, ErrorCode, EventKind, PermissionMode,
    ReasoningEffort, SessionOptions, StatusKind, TextKind, ToolKind, ToolOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;

async fn start(launcher: &Arc<FakeLauncher>, options: SessionOptions) -> Arc<dyn AgentSession> {
    CliBackend::with_launcher(CliConfig::default(), launcher.clone())
        .create_session(CreateSessionRequest::new("/repo").with_options(options))
        .await
        .unwrap()
}

/// Wait for a control_request with `subtype` and answer it successfully
async fn ack_control(peer: &FakePeer, subtype: &str) -> Value {
    let request = peer
        .wait_for(|m| m["type"] == "control_request" && m["request"]["subtype"] == subtype)
        .await;
    peer.send_json(&json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request["request_id"], "response": {}}
    }))
    .await;
    request
}

#[test]
fn test_build_args_new_session() {
    let options = SessionOptions {
        model: Some("opus".to_string()),
        permission_mode: Some(PermissionMode::Plan),
        allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
        max_turns: Some(4),
        include_partial_messages: true,
        ..Default::default()
    };
    let args = build_args(&CliConfig::default(), "sid-1", &options);
    let joined = args.join(" ");
    assert!(joined.starts_with("--print --input-format stream-json --output-format stream-json --verbose"));
    assert!(joined.contains("--permission-prompt-tool stdio"));
    assert!(joined.contains("--model opus"));
    assert!(joined.contains("--permission-mode plan"));
    assert!(joined.contains("--session-id sid-1"));
    assert!(joined.contains("--allowedTools Read,Grep"));
    assert!(joined.contains("--max-turns 4"));
    assert!(joined.contains("--include-partial-messages"));
    assert!(!joined.contains("--resume"));
}

#[test]
fn test_build_args_resume_replaces_session_id() {
    let options = SessionOptions {
        resume_session_id: Some("old-session".to_string()),
        ..Default::default()
    };
    let config = CliConfig {
        extra_args: vec!["--debug".to_string()],
        ..Default::default()
    };
    let args = build_args(&config, "sid-2", &options);
    let joined = args.join(" ");
    assert!(joined.contains("--resume old-session"));
    assert!(!joined.contains("--session-id"));
    assert_eq!(args.last().map(String::as_str), Some("--debug"));
}

#[tokio::test]
async fn test_launch_spec_and_effort_env() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let options = SessionOptions {
        reasoning_effort: Some(ReasoningEffort::High),
        ..Default::default()
    };
    let session = start(&launcher, options).await;

    let spec = &launcher.specs()[0];
    assert_eq!(spec.program, "claude");
    assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/repo")));
    assert_eq!(
        spec.env.get("MAX_THINKING_TOKENS"),
        Some(&ReasoningEffort::High.thinking_tokens().to_string())
    );
    assert_eq!(session.resolved_session_id(), session.session_id());
}

#[tokio::test]
async fn test_one_process_per_session() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let backend = CliBackend::with_launcher(CliConfig::default(), launcher.clone());
    backend.create_session(CreateSessionRequest::new("/a")).await.unwrap();
    backend.create_session(CreateSessionRequest::new("/b")).await.unwrap();
    assert_eq!(launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_launch_failure_is_session_create_error() {
    let backend =
        CliBackend::with_launcher(CliConfig::default(), Arc::new(FakeLauncher::failing("ENOENT")));
    let err = backend
        .create_session(CreateSessionRequest::new("/repo"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Some(ErrorCode::SessionCreateError));
}

#[tokio::test]
async fn test_turn_round_trip() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut events = session.subscribe_events();
    let peer = launcher.peer(0).unwrap();

    session.send("what is here?").await.unwrap();
    let user = peer.wait_for(|m| m["type"] == "user").await;
    assert_eq!(user["message"]["role"], "user");
    assert_eq!(user["message"]["content"][0], json!({"type": "text", "text": "what is here?"}));

    peer.send_json(&json!({"type": "system", "subtype": "init", "session_id": "cli-real-id", "model": "sonnet"})).await;
    peer.send_json(&json!({
        "type": "assistant",
        "message": {"id": "m1", "content": [{"type": "tool_use", "id": "tu_1", "name": "LS", "input": {"path": "."}}]}
    })).await;
    peer.send_json(&json!({
        "type": "user",
        "message": {"content": [{"type": "tool_result", "tool_use_id": "tu_1", "content": "src\nCargo.toml"}]}
    })).await;
    peer.send_json(&json!({
        "type": "assistant",
        "message": {"id": "m2", "content": [{"type": "text", "text": "A Rust crate."}]}
    })).await;
    peer.send_json(&json!({"type": "result", "subtype": "success", "is_error": false, "num_turns": 1})).await;

    let kinds = collect_turn(&mut events).await;
    assert!(matches!(&kinds[0], EventKind::UserInput { text } if text == "what is here?"));
    assert!(kinds.iter().any(|k| matches!(k, EventKind::ToolCompletion { outcome: ToolOutcome::Success, tool_kind: ToolKind::Search, .. })));
    assert!(kinds.iter().any(|k| matches!(k, EventKind::Text { kind: TextKind::Text, text, .. } if text == "A Rust crate.")));
    assert_eq!(session.resolved_session_id(), "cli-real-id");
}

#[tokio::test]
async fn test_can_use_tool_allow_and_deny() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut permissions = session.subscribe_permission_requests();
    let peer = launcher.peer(0).unwrap();

    peer.send_json(&json!({
        "type": "control_request", "request_id": "cli_req_1",
        "request": {"subtype": "can_use_tool", "tool_name": "Write",
                    "input": {"file_path": "/repo/a.txt", "content": "x"}, "tool_use_id": "tu_w"}
    })).await;
    let request = next(&mut permissions).await;
    assert_eq!(request.tool_kind, ToolKind::Edit);
    assert_eq!(request.tool_use_id.as_deref(), Some("tu_w"));
    request.allow(Some(json!({"file_path": "/repo/b.txt", "content": "x"})));

    let reply = peer
        .wait_for(|m| m["type"] == "control_response" && m["response"]["request_id"] == "cli_req_1")
        .await;
    assert_eq!(reply["response"]["subtype"], "success");
    assert_eq!(reply["response"]["response"]["behavior"], "allow");
    assert_eq!(reply["response"]["response"]["updatedInput"]["file_path"], "/repo/b.txt");

    peer.send_json(&json!({
        "type": "control_request", "request_id": "cli_req_2",
        "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "rm -rf /"}}
    })).await;
    next(&mut permissions).await.deny("Too dangerous");
    let reply = peer
        .wait_for(|m| m["type"] == "control_response" && m["response"]["request_id"] == "cli_req_2")
        .await;
    assert_eq!(
        reply["response"]["response"],
        json!({"behavior": "deny", "message": "Too dangerous"})
    );
}

#[tokio::test]
async fn test_unsupported_control_request_gets_error() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let _session = start(&launcher, SessionOptions::default()).await;
    let peer = launcher.peer(0).unwrap();

    peer.send_json(&json!({
        "type": "control_request", "request_id": "cli_req_3",
        "request": {"subtype": "hook_callback"}
    })).await;
    let reply = peer
        .wait_for(|m| m["type"] == "control_response" && m["response"]["request_id"] == "cli_req_3")
        .await;
    assert_eq!(reply["response"]["subtype"], "error");
}

#[tokio::test]
async fn test_control_cancel_denies_permission() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut permissions = session.subscribe_permission_requests();
    let peer = launcher.peer(0).unwrap();

    peer.send_json(&json!({
        "type": "control_request", "request_id": "cli_req_4",
        "request": {"subtype": "can_use_tool", "tool_name": "Read", "input": {}}
    })).await;
    let request = next(&mut permissions).await;
    peer.send_json(&json!({"type": "control_cancel_request", "request_id": "cli_req_4"})).await;

    tokio::time::timeout(common::WAIT, async {
        while !request.is_resolved() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_interrupt_sends_control_request_only_when_busy() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let peer = launcher.peer(0).unwrap();

    session.interrupt().await.unwrap();
    assert!(peer.received().iter().all(|m| m["type"] != "control_request"));

    session.send("long job").await.unwrap();
    let (interrupted, request) = tokio::join!(session.interrupt(), ack_control(&peer, "interrupt"));
    interrupted.unwrap();
    let request_id = request["request_id"].as_str().unwrap();
    assert!(request_id.starts_with("req_1_"));
}

#[tokio::test]
async fn test_mutators_use_control_requests() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut events = session.subscribe_events();
    let peer = launcher.peer(0).unwrap();

    let (result, request) = tokio::join!(session.set_model(Some("haiku")), ack_control(&peer, "set_model"));
    result.unwrap();
    assert_eq!(request["request"]["model"], "haiku");

    let (result, request) = tokio::join!(
        session.set_permission_mode(Some(PermissionMode::BypassPermissions)),
        ack_control(&peer, "set_permission_mode")
    );
    result.unwrap();
    assert_eq!(request["request"]["mode"], "bypassPermissions");
    next_event(&mut events, |k| matches!(k, EventKind::SessionStatus { status: StatusKind::ModeChanged, .. })).await;

    let (result, request) = tokio::join!(
        session.set_reasoning_effort(Some(ReasoningEffort::Low)),
        ack_control(&peer, "set_max_thinking_tokens")
    );
    result.unwrap();
    assert_eq!(
        request["request"]["max_thinking_tokens"],
        ReasoningEffort::Low.thinking_tokens()
    );
}

#[tokio::test]
async fn test_mutators_reset_to_defaults() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut events = session.subscribe_events();
    let peer = launcher.peer(0).unwrap();

    let (result, request) = tokio::join!(session.set_model(None), ack_control(&peer, "set_model"));
    result.unwrap();
    assert!(request["request"]["model"].is_null());

    let (result, request) = tokio::join!(
        session.set_permission_mode(None),
        ack_control(&peer, "set_permission_mode")
    );
    result.unwrap();
    assert_eq!(request["request"]["mode"], "default");
    let changed = next_event(&mut events, |k| {
        matches!(k, EventKind::SessionStatus { status: StatusKind::ModeChanged, .. })
    })
    .await;
    assert!(matches!(
        changed.kind,
        EventKind::SessionStatus { message: Some(ref m), .. } if m == "default"
    ));

    let (result, request) = tokio::join!(
        session.set_reasoning_effort(None),
        ack_control(&peer, "set_max_thinking_tokens")
    );
    result.unwrap();
    assert!(request["request"]["max_thinking_tokens"].is_null());
}

#[tokio::test]
async fn test_control_error_response_fails_the_call() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let peer = launcher.peer(0).unwrap();

    let reply = async {
        let request = peer
            .wait_for(|m| m["type"] == "control_request" && m["request"]["subtype"] == "set_model")
            .await;
        peer.send_json(&json!({
            "type": "control_response",
            "response": {"subtype": "error", "request_id": request["request_id"], "error": "Unknown model"}
        }))
        .await;
    };
    let (result, _) = tokio::join!(session.set_model(Some("nope")), reply);
    assert_eq!(result.unwrap_err().code(), Some(ErrorCode::SendError));
}

#[tokio::test]
async fn test_exit_mid_turn_emits_error_and_closes() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut events = session.subscribe_events();
    let peer = launcher.peer(0).unwrap();

    session.send("go").await.unwrap();
    peer.send_json(&json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}}]}
    })).await;
    peer.close().await;

    let kinds = collect_until_closed(&mut events).await;
    let cancelled = kinds
        .iter()
        .position(|k| matches!(k, EventKind::ToolCompletion { outcome: ToolOutcome::Cancelled, .. }))
        .unwrap();
    let error = kinds
        .iter()
        .position(|k| matches!(k, EventKind::Text { kind: TextKind::Error, text, .. } if text == "CLI process exited"))
        .unwrap();
    let complete = kinds
        .iter()
        .position(|k| matches!(k, EventKind::TurnComplete { stop_reason: Some(r), is_error: true, .. } if r == "process_exited"))
        .unwrap();
    assert!(cancelled < error && error < complete);
    assert!(matches!(kinds.last(), Some(EventKind::SessionStatus { status: StatusKind::Exited, .. })));
    assert!(!session.is_alive());
    assert_eq!(session.send("more").await.unwrap_err().code(), Some(ErrorCode::SessionClosed));
}

#[tokio::test]
async fn test_kill_denies_pending_permissions() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let session = start(&launcher, SessionOptions::default()).await;
    let mut permissions = session.subscribe_permission_requests();
    let peer = launcher.peer(0).unwrap();

    peer.send_json(&json!({
        "type": "control_request", "request_id": "cli_req_5",
        "request": {"subtype": "can_use_tool", "tool_name": "Edit", "input": {}}
    })).await;
    let request = next(&mut permissions).await;
    session.kill().await.unwrap();
    assert!(request.is_resolved());
    assert!(!session.is_alive());
}

#[tokio::test]
async fn test_missing_resume_target_reports_error() {
    let launcher = Arc::new(FakeLauncher::new(|_| {}));
    let options = SessionOptions {
        resume_session_id: Some("gone-session".to_string()),
        ..Default::default()
    };
    let session = start(&launcher, options).await;
    assert_eq!(session.resolved_session_id(), "gone-session");
    let mut events = session.subscribe_events();

    launcher
        .peer(0)
        .unwrap()
        .write_stderr("No conversation found with session ID: gone-session")
        .await;
    let event = next_event(&mut events, |k| matches!(k, EventKind::Text { kind: TextKind::Error, .. })).await;
    match event.kind {
        EventKind::Text { text, .. } => assert!(text.contains("Session not found")),
        _ => unreachable!(),
    }
}
