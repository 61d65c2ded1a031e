// ABOUTME: Slash-command parsing for conversation input.
// ABOUTME: Recognizes /command lines, leaves everything else as text for the agent.

/// Represents a parsed command from user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command name (without prefix)
    pub name: String,
    /// Parsed arguments (handles quoted strings)
    pub args: Vec<String>,
    /// The raw argument string after the command name
    pub raw_args: String,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>, raw_args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args,
            raw_args: raw_args.into(),
        }
    }

    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    fn raw_or_none(&self) -> Option<String> {
        if self.raw_args.is_empty() {
            None
        } else {
            Some(self.raw_args.clone())
        }
    }

    /// Map to a command handled locally by the front-end.
    /// Anything else (e.g. /compact) is an agent command and should be sent as text.
    pub fn as_local(&self) -> Option<LocalCommand> {
        let command = match self.name.as_str() {
            "help" | "h" => LocalCommand::Help,
            "allow" | "y" => LocalCommand::Allow {
                updated_input: self.raw_or_none(),
            },
            "deny" | "n" => LocalCommand::Deny {
                reason: self.raw_or_none(),
            },
            "interrupt" | "stop" => LocalCommand::Interrupt,
            "clear" => LocalCommand::Clear,
            "model" => LocalCommand::Model(self.first_arg().map(str::to_string)),
            "models" => LocalCommand::Models,
            "mode" => LocalCommand::Mode(self.first_arg().map(str::to_string)),
            "effort" => LocalCommand::Effort(self.first_arg().map(str::to_string)),
            "status" => LocalCommand::Status,
            "quit" | "exit" | "q" => LocalCommand::Quit,
            _ => return None,
        };
        Some(command)
    }
}

/// Commands the front-end handles without involving the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Help,
    /// Allow the current permission request, optionally replacing the tool input with JSON
    Allow { updated_input: Option<String> },
    Deny { reason: Option<String> },
    Interrupt,
    Clear,
    Model(Option<String>),
    Models,
    Mode(Option<String>),
    Effort(Option<String>),
    Status,
    Quit,
}

/// Result of parsing a line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Command(Command),
    /// Plain text for the agent
    Message(String),
    /// Nothing to do (empty input)
    Ignore,
}

impl ParseResult {
    pub fn is_command(&self) -> bool {
        matches!(self, ParseResult::Command(_))
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&str> {
        match self {
            ParseResult::Message(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Parse arguments from a string, respecting quoted strings
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parse a line of user input
///
/// - `/command args` is a command; the name is lowercased
/// - `//text` escapes the prefix and is sent as `/text`
/// - empty input is ignored
pub fn parse_input(body: &str) -> ParseResult {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    if let Some(escaped) = trimmed.strip_prefix("//") {
        return ParseResult::Message(format!("/{}", escaped));
    }

    if let Some(after_slash) = trimmed.strip_prefix('/') {
        if after_slash.chars().next().is_some_and(|c| c.is_alphabetic()) {
            let parts: Vec<&str> = after_slash.splitn(2, char::is_whitespace).collect();
            let name = parts[0].to_lowercase();
            let raw_args = parts.get(1).map(|s| s.trim()).unwrap_or("").to_string();
            let args = parse_args(&raw_args);
            return ParseResult::Command(Command::new(name, args, raw_args));
        }
    }

    ParseResult::Message(trimmed.to_string())
}
