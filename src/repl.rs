// ABOUTME: Line-oriented front-end: reads user input, runs local slash commands, prints session events.
// ABOUTME: Everything that reaches the agent goes through the ConversationDriver.

use crate::render;
use anyhow::Result;
use insights_agent::{AgentBackend, PermissionMode, ReasoningEffort, SessionOptions};
use insights_core::{parse_input, ConversationDriver, LocalCommand, ParseResult};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

const HELP: &str = "\
/allow [json]     allow the pending tool call, optionally with replacement input
/deny [reason]    deny the pending tool call
/interrupt        stop the running turn
/clear            start a fresh session on the next message
/model [id]       show or change the model (default clears the override)
/models           list models the backend offers
/mode [mode]      show or change the permission mode
/effort <level>   change reasoning effort (minimal, low, medium, high, default)
/status           conversation state
/quit             exit
//text            send text starting with a slash
Other /commands are passed to the agent.";

const DENIED_BY_USER: &str = "Denied by user";

/// Argument that clears a model or effort override
const DEFAULT_ARG: &str = "default";

/// Where the REPL writes its output
pub type Output = Arc<dyn Fn(&str) + Send + Sync>;

pub fn stdout_output() -> Output {
    Arc::new(|line: &str| println!("{}", line))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Repl {
    driver: Arc<ConversationDriver>,
    backend: Arc<dyn AgentBackend>,
    cwd: PathBuf,
    options: SessionOptions,
    output: Output,
    background: CancellationToken,
}

impl Repl {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        cwd: PathBuf,
        options: SessionOptions,
        output: Output,
    ) -> Self {
        Self {
            driver: Arc::new(ConversationDriver::new()),
            backend,
            cwd,
            options,
            output,
            background: CancellationToken::new(),
        }
    }

    pub fn driver(&self) -> &Arc<ConversationDriver> {
        &self.driver
    }

    fn print(&self, line: &str) {
        (self.output)(line);
    }

    /// Start printing session events and backend failures
    pub fn spawn_printers(&self) {
        let mut events = self.driver.subscribe_events();
        let output = self.output.clone();
        let cancel = self.background.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                if let Some(line) = render::render_event(&event) {
                    output(&line);
                }
            }
        });

        let mut errors = self.backend.subscribe_errors();
        let output = self.output.clone();
        let cancel = self.background.clone();
        tokio::spawn(async move {
            loop {
                let failure = tokio::select! {
                    _ = cancel.cancelled() => break,
                    failure = errors.recv() => failure,
                };
                let Some(failure) = failure else { break };
                tracing::error!(fatal = failure.fatal, error = %failure.error, "Backend failure");
                output(&format!("backend error: {}", failure.error));
            }
        });
    }

    /// Create the session, sending the first prompt if there is one
    pub async fn start(&self, prompt: Option<&str>) {
        if let Err(e) = self
            .driver
            .start(
                self.backend.clone(),
                prompt,
                self.cwd.clone(),
                self.options.clone(),
            )
            .await
        {
            self.print(&format!("error: Failed to start session: {}", e));
        }
    }

    /// Read lines until end of input or /quit
    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> Result<()> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if self.handle_line(&line).await == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> Flow {
        match parse_input(line) {
            ParseResult::Ignore => Flow::Continue,
            ParseResult::Message(text) => {
                self.send(&text).await;
                Flow::Continue
            }
            ParseResult::Command(command) => match command.as_local() {
                Some(local) => self.handle_command(local).await,
                None => {
                    self.send(line.trim()).await;
                    Flow::Continue
                }
            },
        }
    }

    async fn send(&self, text: &str) {
        if let Err(e) = self.driver.send(text).await {
            self.print(&format!("error: {}", e));
        }
    }

    async fn handle_command(&self, command: LocalCommand) -> Flow {
        match command {
            LocalCommand::Help => self.print(HELP),
            LocalCommand::Quit => return Flow::Quit,
            LocalCommand::Allow { updated_input } => {
                let parsed = updated_input.map(|raw| serde_json::from_str::<Value>(&raw));
                let updated_input = match parsed {
                    Some(Ok(value)) => Some(value),
                    Some(Err(e)) => {
                        self.print(&format!("error: replacement input is not JSON: {}", e));
                        return Flow::Continue;
                    }
                    None => None,
                };
                if !self.driver.allow_permission(updated_input) {
                    self.print("No permission request is pending");
                }
            }
            LocalCommand::Deny { reason } => {
                let reason = reason.unwrap_or_else(|| DENIED_BY_USER.to_string());
                if !self.driver.deny_permission(&reason) {
                    self.print("No permission request is pending");
                }
            }
            LocalCommand::Interrupt => {
                if !self.driver.interrupt().await {
                    self.print("Nothing to interrupt");
                }
            }
            LocalCommand::Clear => {
                self.driver.clear().await;
                self.print("[context cleared]");
            }
            LocalCommand::Model(None) => {
                let model = self.driver.conversation().model().map(str::to_string);
                self.print(&format!("model: {}", model.as_deref().unwrap_or("default")));
            }
            LocalCommand::Model(Some(model)) => {
                let model = Some(model).filter(|m| m != DEFAULT_ARG);
                match self.driver.set_model(model.as_deref()).await {
                    Ok(()) => self.print(&format!(
                        "model set to {}",
                        model.as_deref().unwrap_or(DEFAULT_ARG)
                    )),
                    Err(e) => self.print(&format!("error: {}", e)),
                }
            }
            LocalCommand::Models => match self.driver.list_models().await {
                Ok(models) if models.is_empty() => self.print("No models reported"),
                Ok(models) => {
                    for model in models {
                        let marker = if model.is_default { "*" } else { " " };
                        self.print(&format!("{} {}", marker, model.id));
                    }
                }
                Err(e) => self.print(&format!("error: {}", e)),
            },
            LocalCommand::Mode(None) => {
                let mode = self.driver.conversation().permission_mode();
                self.print(&format!(
                    "mode: {}",
                    mode.map(|m| m.as_str()).unwrap_or("default")
                ));
            }
            LocalCommand::Mode(Some(raw)) => match raw.parse::<PermissionMode>() {
                Ok(mode) => {
                    if let Err(e) = self.driver.set_permission_mode(Some(mode)).await {
                        self.print(&format!("error: {}", e));
                    }
                }
                Err(e) => self.print(&format!("error: {}", e)),
            },
            LocalCommand::Effort(None) => {
                self.print("usage: /effort minimal|low|medium|high|default")
            }
            LocalCommand::Effort(Some(raw)) => {
                let effort = if raw == DEFAULT_ARG {
                    None
                } else {
                    match raw.parse::<ReasoningEffort>() {
                        Ok(effort) => Some(effort),
                        Err(e) => {
                            self.print(&format!("error: {}", e));
                            return Flow::Continue;
                        }
                    }
                };
                match self.driver.set_reasoning_effort(effort).await {
                    Ok(()) => self.print(&format!(
                        "reasoning effort set to {}",
                        effort.map(|e| e.to_string()).unwrap_or_else(|| DEFAULT_ARG.to_string())
                    )),
                    Err(e) => self.print(&format!("error: {}", e)),
                }
            }
            LocalCommand::Status => {
                let status = self.status();
                self.print(&status);
            }
        }
        Flow::Continue
    }

    fn status(&self) -> String {
        let conversation = self.driver.conversation();
        let mut status = format!(
            "state: {:?}\nsession: {}",
            conversation.state(),
            conversation.resolved_session_id().unwrap_or("none")
        );
        let pending = conversation.pending_permission_count();
        if pending > 0 {
            status.push_str(&format!("\npermissions pending: {}", pending));
        }
        status
    }

    /// Stop background printers and kill the session
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.driver.shutdown().await;
    }
}
