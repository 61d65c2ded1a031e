// ABOUTME: JSON-RPC transport over a subprocess's stdio with id-matched request/response.
// ABOUTME: Fans out notifications, server-initiated requests and stderr logs to subscribers.

pub mod jsonrpc;
pub mod process;

pub use jsonrpc::{Notification, ServerRequest};
pub use process::{
    LaunchedProcess, LineProcess, LogEntry, LogLevel, ProcessLauncher, ProcessSpec, ProcessState,
    SystemLauncher,
};

use crate::error::{ProcessError, RequestError, RpcError};
use jsonrpc::Incoming;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub const DISPOSED_MESSAGE: &str = "Transport disposed";
pub const EXITED_MESSAGE: &str = "Process exited";

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Name used in logs
    pub label: String,
    pub request_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            label: "transport".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type PendingSender = oneshot::Sender<Result<Value, RequestError>>;

struct PendingTable {
    /// Set once the transport can no longer complete requests
    closed: Option<String>,
    entries: HashMap<u64, PendingSender>,
}

struct Inner {
    label: String,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    process: LineProcess,
    notifications: broadcast::Sender<Notification>,
    requests_tx: mpsc::UnboundedSender<ServerRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerRequest>>>,
    request_timeout: Duration,
}

impl Inner {
    fn write(&self, message: &Value) -> Result<(), ProcessError> {
        self.process.write_line(message.to_string())
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.closed.is_none() {
                pending.closed = Some(reason.to_string());
            }
            pending.entries.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(transport = %self.label, count = drained.len(), reason, "Failing pending requests");
        }
        for tx in drained {
            let _ = tx.send(Err(ProcessError::new(reason).into()));
        }
    }

    fn respond_raw(&self, message: Value) {
        if let Err(e) = self.write(&message) {
            tracing::warn!(transport = %self.label, error = %e, "Failed to send response");
        }
    }

    fn handle_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                self.report_malformed(trimmed, &e.to_string());
                return;
            }
        };

        let Some(incoming) = jsonrpc::classify(value) else {
            self.report_malformed(trimmed, "not a JSON-RPC object");
            return;
        };

        match incoming {
            Incoming::Response { id, outcome } => {
                let waiter = jsonrpc::id_as_u64(&id).and_then(|id| {
                    self.pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .entries
                        .remove(&id)
                });
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(RequestError::from));
                    }
                    None => {
                        tracing::warn!(transport = %self.label, id = %id, "Response for unknown request id, dropping");
                    }
                }
            }
            Incoming::Notification(notification) => {
                tracing::trace!(transport = %self.label, method = %notification.method, "Notification");
                let _ = self.notifications.send(notification);
            }
            Incoming::Request(request) => self.dispatch_server_request(request),
        }
    }

    fn dispatch_server_request(&self, request: ServerRequest) {
        tracing::debug!(transport = %self.label, method = %request.method, "Server request");
        let unclaimed = self
            .requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        let rejected = if unclaimed {
            Some(request)
        } else {
            self.requests_tx.send(request).err().map(|e| e.0)
        };
        if let Some(request) = rejected {
            tracing::warn!(transport = %self.label, method = %request.method, "No consumer for server request");
            let error = RpcError::method_not_found(&request.method);
            self.respond_raw(jsonrpc::error_response(&request.id, &error));
        }
    }

    fn report_malformed(&self, line: &str, reason: &str) {
        tracing::warn!(transport = %self.label, reason, line, "Dropping malformed line");
        self.process.publish_log(LogEntry::new(
            LogLevel::Warn,
            self.label.clone(),
            format!("Malformed line ({}): {}", reason, line),
        ));
    }
}

/// JSON-RPC 2.0 client/server endpoint over newline-delimited stdio
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Launch a subprocess and wire a transport to it
    pub fn spawn(
        launcher: &dyn ProcessLauncher,
        spec: &ProcessSpec,
        options: TransportOptions,
    ) -> Result<Self, ProcessError> {
        let launched = launcher.launch(spec)?;
        Ok(Self::with_options(launched, options))
    }

    /// Wire a transport to any reader/writer pair with default options
    pub fn new(launched: LaunchedProcess) -> Self {
        Self::with_options(launched, TransportOptions::default())
    }

    pub fn with_options(launched: LaunchedProcess, options: TransportOptions) -> Self {
        let (process, mut lines) = LineProcess::start(options.label.clone(), launched);
        let (notifications, _) = broadcast::channel(1024);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            label: options.label,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable {
                closed: None,
                entries: HashMap::new(),
            }),
            process,
            notifications,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            request_timeout: options.request_timeout,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_line(&line);
            }
            if let Some(inner) = weak.upgrade() {
                tracing::debug!(transport = %inner.label, "Peer closed stdout");
                inner.process.mark_exited();
                inner.fail_all(EXITED_MESSAGE);
            }
        });

        Self { inner }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Send a request and wait for its response, bounded by the default timeout
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.send_request_with_timeout(method, params, Some(self.inner.request_timeout))
            .await
    }

    /// Send a request; `None` waits until the response or disposal
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = &pending.closed {
                return Err(ProcessError::new(reason.clone()).into());
            }
            pending.entries.insert(id, tx);
        }

        tracing::debug!(transport = %self.inner.label, id, method, "Sending request");
        if let Err(e) = self.inner.write(&jsonrpc::request(id, method, params)) {
            self.remove_pending(id);
            return Err(e.into());
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.remove_pending(id);
                    tracing::warn!(transport = %self.inner.label, id, method, "Request timed out");
                    return Err(ProcessError::new(format!(
                        "Request {} timed out after {}s",
                        method,
                        limit.as_secs()
                    ))
                    .into());
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(ProcessError::new(DISPOSED_MESSAGE).into()))
    }

    fn remove_pending(&self, id: u64) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .remove(&id);
    }

    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), ProcessError> {
        tracing::debug!(transport = %self.inner.label, method, "Sending notification");
        self.inner.write(&jsonrpc::notification(method, params))
    }

    /// Answer a server-initiated request
    pub fn respond(&self, id: &Value, result: Value) -> Result<(), ProcessError> {
        self.inner.write(&jsonrpc::response(id, result))
    }

    pub fn respond_error(&self, id: &Value, error: RpcError) -> Result<(), ProcessError> {
        self.inner.write(&jsonrpc::error_response(id, &error))
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Take the single consumer of server-initiated requests.
    ///
    /// Until taken (or after the receiver is dropped) requests are answered with method-not-found.
    pub fn take_server_requests(&self) -> Option<mpsc::UnboundedReceiver<ServerRequest>> {
        self.inner
            .requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.inner.process.subscribe_logs()
    }

    pub fn subscribe_log_entries(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.process.subscribe_log_entries()
    }

    pub fn exit_status(&self) -> watch::Receiver<ProcessState> {
        self.inner.process.watch_state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.process.is_running()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Fail outstanding requests, close stdin and kill the subprocess
    pub fn close(&self) {
        tracing::debug!(transport = %self.inner.label, "Closing transport");
        self.inner.fail_all(DISPOSED_MESSAGE);
        self.inner.process.close_stdin();
        self.inner.process.kill();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.fail_all(DISPOSED_MESSAGE);
    }
}
