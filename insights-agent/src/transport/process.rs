// ABOUTME: Subprocess launch and newline-delimited line I/O over its stdio.
// ABOUTME: LineProcess runs writer, reader, stderr and supervisor tasks; Drop kills the child.

use crate::error::ProcessError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What to launch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// A running peer: its stdio halves and, for real subprocesses, the child handle
pub struct LaunchedProcess {
    pub stdout: BoxedReader,
    pub stdin: BoxedWriter,
    pub stderr: Option<BoxedReader>,
    pub child: Option<tokio::process::Child>,
}

/// Seam between backends and process creation, so tests can hand out in-memory pipes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<LaunchedProcess, ProcessError>;
}

/// Launches real subprocesses with tokio::process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<LaunchedProcess, ProcessError> {
        tracing::debug!(program = %spec.program, args = ?spec.args, "Spawning subprocess");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::new(format!("Failed to spawn {}: {}", spec.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::new("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::new("Failed to capture stdout"))?;
        let stderr = child.stderr.take();

        Ok(LaunchedProcess {
            stdout: Box::new(stdout),
            stdin: Box::new(stdin),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Some(child),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited { code: Option<i32> },
    Killed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log line from a subprocess or the transport itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

fn stderr_level(line: &str) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("panic") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

/// A subprocess speaking newline-delimited text on stdio
pub struct LineProcess {
    label: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state_tx: Arc<watch::Sender<ProcessState>>,
    state_rx: watch::Receiver<ProcessState>,
    logs: broadcast::Sender<String>,
    log_entries: broadcast::Sender<LogEntry>,
    cancel: CancellationToken,
    has_child: bool,
}

impl LineProcess {
    /// Start the I/O tasks. Returns the process and the stream of stdout lines, which ends on EOF.
    pub fn start(
        label: impl Into<String>,
        launched: LaunchedProcess,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let label = label.into();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let state_tx = Arc::new(state_tx);
        let (logs, _) = broadcast::channel(256);
        let (log_entries, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(label.clone(), launched.stdin, out_rx));

        let has_child = launched.child.is_some();
        tokio::spawn(read_loop(
            label.clone(),
            launched.stdout,
            line_tx,
            (!has_child).then(|| state_tx.clone()),
        ));

        if let Some(stderr) = launched.stderr {
            tokio::spawn(stderr_loop(
                label.clone(),
                stderr,
                logs.clone(),
                log_entries.clone(),
            ));
        }

        if let Some(child) = launched.child {
            tokio::spawn(supervise(label.clone(), child, state_tx.clone(), cancel.clone()));
        }

        let process = Self {
            label,
            outbound: Mutex::new(Some(out_tx)),
            state_tx,
            state_rx,
            logs,
            log_entries,
            cancel,
            has_child,
        };
        (process, line_rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue one line for stdin. The newline is added by the writer.
    pub fn write_line(&self, line: String) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::new("Process exited"));
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(line)
                .map_err(|_| ProcessError::new("Process stdin closed")),
            None => Err(ProcessError::new("Process stdin closed")),
        }
    }

    pub fn close_stdin(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Kill the child if one is attached
    pub fn kill(&self) {
        self.cancel.cancel();
        self.close_stdin();
        if !self.has_child {
            self.state_tx.send_if_modified(|state| {
                if *state == ProcessState::Running {
                    *state = ProcessState::Killed;
                    true
                } else {
                    false
                }
            });
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.logs.subscribe()
    }

    pub fn subscribe_log_entries(&self) -> broadcast::Receiver<LogEntry> {
        self.log_entries.subscribe()
    }

    /// Publish a log entry produced on our side (e.g. a malformed line)
    pub fn publish_log(&self, entry: LogEntry) {
        let _ = self.log_entries.send(entry);
    }

    /// Mark the peer as gone when there is no child to supervise
    pub fn mark_exited(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == ProcessState::Running {
                *state = ProcessState::Exited { code: None };
                true
            } else {
                false
            }
        });
    }
}

impl Drop for LineProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(label: String, mut stdin: BoxedWriter, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(process = %label, error = %e, "Failed to write to stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(process = %label, error = %e, "Failed to flush stdin");
            break;
        }
    }
    let _ = stdin.shutdown().await;
    tracing::debug!(process = %label, "stdin writer finished");
}

async fn read_loop(
    label: String,
    stdout: BoxedReader,
    tx: mpsc::UnboundedSender<String>,
    exit_on_eof: Option<Arc<watch::Sender<ProcessState>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(process = %label, error = %e, "Failed to read stdout");
                break;
            }
        }
    }
    tracing::debug!(process = %label, "stdout closed");
    if let Some(state) = exit_on_eof {
        state.send_if_modified(|s| {
            if *s == ProcessState::Running {
                *s = ProcessState::Exited { code: None };
                true
            } else {
                false
            }
        });
    }
}

async fn stderr_loop(
    label: String,
    stderr: BoxedReader,
    logs: broadcast::Sender<String>,
    entries: broadcast::Sender<LogEntry>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        tracing::debug!(process = %label, stderr = %line, "Subprocess stderr");
        let _ = entries.send(LogEntry::new(stderr_level(&line), label.clone(), line.clone()));
        let _ = logs.send(line);
    }
}

async fn supervise(
    label: String,
    mut child: tokio::process::Child,
    state: Arc<watch::Sender<ProcessState>>,
    cancel: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            tracing::info!(process = %label, ?code, "Subprocess exited");
            state.send_replace(ProcessState::Exited { code });
        }
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(process = %label, error = %e, "Failed to kill subprocess");
            }
            tracing::info!(process = %label, "Subprocess killed");
            state.send_replace(ProcessState::Killed);
        }
    }
}
