// ABOUTME: Tests for the JSON-RPC transport over in-memory pipes.
// ABOUTME: Covers id matching, peer errors, malformed lines, server requests and shutdown.

use insights_agent::error::{codes, RequestError, RpcError};
use insights_agent::testing::FakePeer;
use insights_agent::transport::{LogLevel, ProcessState, Transport, TransportOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn transport() -> (Arc<Transport>, FakePeer) {
    let (peer, launched) = FakePeer::new();
    (Arc::new(Transport::new(launched)), peer)
}

#[tokio::test]
async fn test_request_resolves_with_handler_result() {
    let (transport, peer) = transport();
    peer.on("ping", |params| Ok(json!({"echo": params["n"]})));

    let result = transport.send_request("ping", json!({"n": 7})).await.unwrap();
    assert_eq!(result, json!({"echo": 7}));
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_responses_match_by_id() {
    let (transport, peer) = transport();

    let first = tokio::spawn({
        let transport = transport.clone();
        async move { transport.send_request("first", json!({})).await }
    });
    let first_req = peer.wait_for_request("first").await;
    let second = tokio::spawn({
        let transport = transport.clone();
        async move { transport.send_request("second", json!({})).await }
    });
    let second_req = peer.wait_for_request("second").await;
    assert_ne!(first_req["id"], second_req["id"]);

    peer.respond(&second_req["id"], json!("two")).await;
    peer.respond(&first_req["id"], json!("one")).await;

    assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    assert_eq!(first.await.unwrap().unwrap(), json!("one"));
}

#[tokio::test]
async fn test_request_ids_start_at_one_and_increase() {
    let (transport, peer) = transport();
    peer.on_result("a", json!(null));

    transport.send_request("a", json!({})).await.unwrap();
    transport.send_request("a", json!({})).await.unwrap();

    let ids: Vec<u64> = peer
        .received()
        .iter()
        .filter_map(|m| m["id"].as_u64())
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_peer_error_surfaces_as_rpc_error() {
    let (transport, peer) = transport();
    peer.on("explode", |_| Err(RpcError::new(-32001, "kaboom")));

    let err = transport.send_request("explode", json!({})).await.unwrap_err();
    match err {
        RequestError::Rpc(e) => {
            assert_eq!(e.code, -32001);
            assert_eq!(e.message, "kaboom");
        }
        other => panic!("Expected RpcError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_response_id_is_dropped() {
    let (transport, peer) = transport();
    peer.on_result("real", json!("ok"));

    peer.respond(&json!(999), json!("stray")).await;
    let result = transport.send_request("real", json!({})).await.unwrap();
    assert_eq!(result, json!("ok"));
}

#[tokio::test]
async fn test_malformed_lines_are_logged_and_skipped() {
    let (transport, peer) = transport();
    let mut entries = transport.subscribe_log_entries();
    let mut notifications = transport.subscribe_notifications();

    peer.send_raw("this is not json").await;
    peer.send_raw("[1, 2, 3]").await;
    peer.send_raw("").await;
    peer.notify("still/alive", json!({"ok": true})).await;

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.method, "still/alive");
    assert_eq!(notification.params, json!({"ok": true}));

    let entry = entries.recv().await.unwrap();
    assert_eq!(entry.level, LogLevel::Warn);
    assert!(entry.message.contains("this is not json"));
    let entry = entries.recv().await.unwrap();
    assert!(entry.message.contains("[1, 2, 3]"));
    assert!(transport.is_running());
}

#[tokio::test]
async fn test_server_request_without_consumer_gets_method_not_found() {
    let (_transport, peer) = transport();

    let id = peer.request("client/unknown", json!({})).await;
    let response = peer.wait_for_response(&id).await;
    assert_eq!(response["error"]["code"], codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_server_requests_reach_consumer_and_can_be_answered() {
    let (transport, peer) = transport();
    let mut requests = transport.take_server_requests().unwrap();
    assert!(transport.take_server_requests().is_none());

    let id = peer.request("fs/read_text_file", json!({"path": "/x"})).await;
    let request = requests.recv().await.unwrap();
    assert_eq!(request.method, "fs/read_text_file");
    assert_eq!(request.params["path"], "/x");

    transport.respond(&request.id, json!({"content": "hi"})).unwrap();
    let response = peer.wait_for_response(&id).await;
    assert_eq!(response["result"]["content"], "hi");
}

#[tokio::test]
async fn test_notifications_go_out_without_id() {
    let (transport, peer) = transport();
    transport
        .send_notification("initialized", json!({}))
        .unwrap();
    let message = peer.wait_for_notification("initialized").await;
    assert_eq!(message["jsonrpc"], "2.0");
    assert!(message.get("id").is_none());
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let (transport, peer) = transport();
    let pending = tokio::spawn({
        let transport = transport.clone();
        async move { transport.send_request("never", json!({})).await }
    });
    peer.wait_for_request("never").await;

    transport.close();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Transport disposed");

    let err = transport.send_request("after", json!({})).await.unwrap_err();
    assert!(matches!(err, RequestError::Process(_)));
}

#[tokio::test]
async fn test_peer_exit_fails_pending_requests() {
    let (transport, peer) = transport();
    let mut exit = transport.exit_status();
    let pending = tokio::spawn({
        let transport = transport.clone();
        async move { transport.send_request("never", json!({})).await }
    });
    peer.wait_for_request("never").await;

    peer.close().await;
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Process exited");

    let state = *exit.wait_for(|s| *s != ProcessState::Running).await.unwrap();
    assert!(matches!(state, ProcessState::Exited { .. }));
}

#[tokio::test]
async fn test_request_timeout() {
    let (peer, launched) = FakePeer::new();
    let transport = Transport::with_options(
        launched,
        TransportOptions {
            label: "slow".to_string(),
            request_timeout: Duration::from_millis(50),
        },
    );

    let err = transport.send_request("slow", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn test_stderr_lines_become_logs() {
    let (transport, peer) = transport();
    let mut logs = transport.subscribe_logs();
    let mut entries = transport.subscribe_log_entries();

    peer.write_stderr("ERROR: something broke").await;

    assert_eq!(logs.recv().await.unwrap(), "ERROR: something broke");
    let entry = entries.recv().await.unwrap();
    assert_eq!(entry.level, LogLevel::Error);
    assert_eq!(entry.message, "ERROR: something broke");
}
