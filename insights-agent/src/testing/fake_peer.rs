// ABOUTME: In-process stand-in for an agent subprocess over tokio duplex pipes.
// ABOUTME: Answers JSON-RPC requests from per-method handlers and records every line it receives.

use crate::error::RpcError;
use crate::transport::LaunchedProcess;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

const PIPE_CAPACITY: usize = 1 << 20;
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Computes the result (or error) for one request method
pub type Handler = Box<dyn Fn(&Value) -> Result<Value, RpcError> + Send + Sync>;

struct PeerInner {
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
    stderr: tokio::sync::Mutex<Option<DuplexStream>>,
    handlers: Mutex<HashMap<String, Handler>>,
    received: Mutex<Vec<Value>>,
    counter: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl PeerInner {
    async fn write_line(&self, line: &str) {
        let mut stdout = self.stdout.lock().await;
        if let Some(pipe) = stdout.as_mut() {
            let mut bytes = line.as_bytes().to_vec();
            bytes.push(b'\n');
            if pipe.write_all(&bytes).await.is_err() {
                *stdout = None;
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            tracing::warn!(line, "Fake peer received non-JSON line");
            return;
        };
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        self.counter.send_modify(|n| *n += 1);

        let (Some(method), Some(id)) = (
            message.get("method").and_then(|m| m.as_str()),
            message.get("id"),
        ) else {
            return;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let outcome = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(method).map(|handler| handler(&params))
        };
        let reply = match outcome {
            Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Some(Err(error)) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
            None => return,
        };
        self.write_line(&reply.to_string()).await;
    }
}

/// The agent side of an in-memory stdio connection
#[derive(Clone)]
pub struct FakePeer {
    inner: Arc<PeerInner>,
}

impl FakePeer {
    /// Create a peer and the LaunchedProcess a transport or backend reads from
    pub fn new() -> (Self, LaunchedProcess) {
        let (client_stdout, peer_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_stdin, peer_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_stderr, peer_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (counter, _) = watch::channel(0);

        let inner = Arc::new(PeerInner {
            stdout: tokio::sync::Mutex::new(Some(peer_stdout)),
            stderr: tokio::sync::Mutex::new(Some(peer_stderr)),
            handlers: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            counter,
            next_id: AtomicU64::new(1000),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(peer_stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    reader.handle_line(&line).await;
                }
            }
        });

        let launched = LaunchedProcess {
            stdout: Box::new(client_stdout),
            stdin: Box::new(client_stdin),
            stderr: Some(Box::new(client_stderr)),
            child: None,
        };
        (Self { inner }, launched)
    }

    /// Answer every `method` request with `handler`'s result
    pub fn on<F>(&self, method: &str, handler: F) -> &Self
    where
        F: Fn(&Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.to_string(), Box::new(handler));
        self
    }

    /// Answer every `method` request with a fixed result
    pub fn on_result(&self, method: &str, result: Value) -> &Self {
        self.on(method, move |_| Ok(result.clone()))
    }

    pub async fn send_raw(&self, line: &str) {
        self.inner.write_line(line).await;
    }

    pub async fn send_json(&self, message: &Value) {
        self.inner.write_line(&message.to_string()).await;
    }

    pub async fn notify(&self, method: &str, params: Value) {
        self.send_json(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await;
    }

    /// Send a server-initiated request; returns its id
    pub async fn request(&self, method: &str, params: Value) -> Value {
        let id = json!(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.send_json(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        id
    }

    pub async fn respond(&self, id: &Value, result: Value) {
        self.send_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    pub async fn respond_error(&self, id: &Value, code: i64, message: &str) {
        self.send_json(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }))
        .await;
    }

    pub async fn write_stderr(&self, line: &str) {
        let mut stderr = self.inner.stderr.lock().await;
        if let Some(pipe) = stderr.as_mut() {
            let _ = pipe.write_all(format!("{}\n", line).as_bytes()).await;
        }
    }

    /// Everything the client has written so far, parsed
    pub fn received(&self) -> Vec<Value> {
        self.inner
            .received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until a received message satisfies `predicate`; panics after a few seconds
    pub async fn wait_for<P>(&self, predicate: P) -> Value
    where
        P: Fn(&Value) -> bool,
    {
        let mut changes = self.inner.counter.subscribe();
        let found = tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if let Some(message) = self.received().into_iter().find(|m| predicate(m)) {
                    return Some(message);
                }
                if changes.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        match found {
            Ok(Some(message)) => message,
            _ => panic!(
                "Fake peer timed out waiting for a message; received: {:?}",
                self.received()
            ),
        }
    }

    pub async fn wait_for_request(&self, method: &str) -> Value {
        self.wait_for(|m| {
            m.get("method").and_then(|v| v.as_str()) == Some(method) && m.get("id").is_some()
        })
        .await
    }

    pub async fn wait_for_notification(&self, method: &str) -> Value {
        self.wait_for(|m| {
            m.get("method").and_then(|v| v.as_str()) == Some(method) && m.get("id").is_none()
        })
        .await
    }

    /// Wait for the client's answer to a server-initiated request
    pub async fn wait_for_response(&self, id: &Value) -> Value {
        self.wait_for(|m| m.get("method").is_none() && m.get("id") == Some(id))
            .await
    }

    /// Close stdout and stderr, which the client sees as process exit
    pub async fn close(&self) {
        self.inner.stdout.lock().await.take();
        self.inner.stderr.lock().await.take();
    }
}
