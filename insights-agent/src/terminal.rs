// ABOUTME: Agent-requested terminals: spawn a command, buffer its output, report its exit.
// ABOUTME: Backs the terminal/* server requests of the ACP backend.

use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

struct OutputBuffer {
    text: String,
    truncated: bool,
    limit: usize,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }
}

struct Terminal {
    output: Mutex<OutputBuffer>,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
    cancel: CancellationToken,
}

impl Terminal {
    fn exit_status(&self) -> Option<TerminalExitStatus> {
        self.exit.borrow().clone()
    }
}

/// Terminals owned by one session
pub struct TerminalManager {
    cwd: PathBuf,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

impl TerminalManager {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            terminals: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, params: &Value) -> Result<Arc<Terminal>, RpcError> {
        let id = params
            .get("terminalId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("Missing terminalId"))?;
        self.terminals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::invalid_params(format!("Unknown terminal: {}", id)))
    }

    /// Handle `terminal/create`
    pub fn create(&self, params: &Value) -> Result<Value, RpcError> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("Missing command"))?;
        let args: Vec<String> = params
            .get("args")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let cwd = params
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.cwd.clone());
        let limit = params
            .get("outputByteLimit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_OUTPUT_LIMIT);

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = params.get("env").and_then(|v| v.as_array()) {
            for var in env {
                if let (Some(name), Some(value)) = (
                    var.get("name").and_then(|v| v.as_str()),
                    var.get("value").and_then(|v| v.as_str()),
                ) {
                    cmd.env(name, value);
                }
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::internal(format!("Failed to run {}: {}", command, e)))?;

        let id = format!("term_{}", uuid::Uuid::new_v4().simple());
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminal = Arc::new(Terminal {
            output: Mutex::new(OutputBuffer {
                text: String::new(),
                truncated: false,
                limit,
            }),
            exit: exit_rx,
            cancel: CancellationToken::new(),
        });

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(stdout, terminal.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(stderr, terminal.clone())));
        }

        let cancel = terminal.cancel.clone();
        let label = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    child.wait().await.ok()
                }
            };
            for pump in pumps {
                let _ = pump.await;
            }
            let exit = status
                .map(to_exit_status)
                .unwrap_or(TerminalExitStatus {
                    exit_code: None,
                    signal: None,
                });
            tracing::debug!(terminal = %label, ?exit, "Terminal command finished");
            let _ = exit_tx.send(Some(exit));
        });

        tracing::info!(terminal = %id, command, "Terminal created");
        self.terminals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), terminal);
        Ok(json!({ "terminalId": id }))
    }

    /// Handle `terminal/output`
    pub fn output(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        let (output, truncated) = {
            let buffer = terminal.output.lock().unwrap_or_else(|e| e.into_inner());
            (buffer.text.clone(), buffer.truncated)
        };
        let mut result = json!({ "output": output, "truncated": truncated });
        if let Some(exit) = terminal.exit_status() {
            result["exitStatus"] = json!(exit);
        }
        Ok(result)
    }

    /// Handle `terminal/wait_for_exit`
    pub async fn wait_for_exit(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        let mut exit = terminal.exit.clone();
        let status = exit
            .wait_for(|s| s.is_some())
            .await
            .map_err(|_| RpcError::internal("Terminal supervisor stopped"))?
            .clone();
        Ok(json!(status))
    }

    /// Handle `terminal/kill`; the terminal stays queryable
    pub fn kill(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        terminal.cancel.cancel();
        Ok(json!({}))
    }

    /// Handle `terminal/release`: kill and forget
    pub fn release(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        terminal.cancel.cancel();
        if let Some(id) = params.get("terminalId").and_then(|v| v.as_str()) {
            self.terminals
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
        Ok(json!({}))
    }

    pub fn release_all(&self) {
        let terminals: Vec<Arc<Terminal>> = self
            .terminals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, t)| t)
            .collect();
        for terminal in terminals {
            terminal.cancel.cancel();
        }
    }
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, terminal: Arc<Terminal>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                terminal
                    .output
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&chunk);
            }
        }
    }
}

#[cfg(unix)]
fn to_exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    use std::os::unix::process::ExitStatusExt;
    TerminalExitStatus {
        exit_code: status.code(),
        signal: status.signal().map(|s| s.to_string()),
    }
}

#[cfg(not(unix))]
fn to_exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    TerminalExitStatus {
        exit_code: status.code(),
        signal: None,
    }
}
