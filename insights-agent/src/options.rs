// ABOUTME: Session options shared by all backends, plus per-backend support tables.
// ABOUTME: Unsupported options produce ValidationWarnings that are logged, never fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept_edits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypass_permissions",
        }
    }

    /// Camel-case name used by the CLI flag and by ACP mode ids
    pub fn wire_name(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "accept_edits" | "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypass_permissions" | "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(format!("Unknown permission mode: {}", other)),
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Thinking-token budget for backends that take a budget instead of a level
    pub fn thinking_tokens(&self) -> u32 {
        match self {
            ReasoningEffort::Minimal => 0,
            ReasoningEffort::Low => 4_000,
            ReasoningEffort::Medium => 10_000,
            ReasoningEffort::High => 31_999,
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(ReasoningEffort::Minimal),
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => Err(format!("Unknown reasoning effort: {}", other)),
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a new session. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Resume an existing backend session/thread instead of starting a new one
    pub resume_session_id: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub include_partial_messages: bool,
    /// Attach the original wire payload to every emitted event
    pub include_raw_events: bool,
    pub env: HashMap<String, String>,
}

impl SessionOptions {
    /// Names of the fields the caller actually set
    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.model.is_some() {
            fields.push("model");
        }
        if self.permission_mode.is_some() {
            fields.push("permission_mode");
        }
        if self.reasoning_effort.is_some() {
            fields.push("reasoning_effort");
        }
        if self.resume_session_id.is_some() {
            fields.push("resume_session_id");
        }
        if self.system_prompt.is_some() {
            fields.push("system_prompt");
        }
        if !self.allowed_tools.is_empty() {
            fields.push("allowed_tools");
        }
        if !self.disallowed_tools.is_empty() {
            fields.push("disallowed_tools");
        }
        if self.max_turns.is_some() {
            fields.push("max_turns");
        }
        if self.include_partial_messages {
            fields.push("include_partial_messages");
        }
        if self.include_raw_events {
            fields.push("include_raw_events");
        }
        if !self.env.is_empty() {
            fields.push("env");
        }
        fields
    }
}

/// Which SessionOptions fields a backend honours
pub type OptionSupportTable = &'static [(&'static str, bool)];

/// An option the backend will ignore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub backend: &'static str,
    pub field: &'static str,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Option '{}' is not supported by the {} backend and will be ignored",
            self.field, self.backend
        )
    }
}

/// Compare the set fields against `table`, logging one warning per unsupported field
pub fn validate_options(
    backend: &'static str,
    table: OptionSupportTable,
    options: &SessionOptions,
) -> Vec<ValidationWarning> {
    let warnings: Vec<ValidationWarning> = options
        .set_fields()
        .into_iter()
        .filter(|field| {
            !table
                .iter()
                .any(|(name, supported)| name == field && *supported)
        })
        .map(|field| ValidationWarning { backend, field })
        .collect();

    for warning in &warnings {
        tracing::warn!(backend, field = warning.field, "{}", warning);
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: OptionSupportTable = &[("model", true), ("max_turns", false)];

    #[test]
    fn test_unset_options_produce_no_warnings() {
        let warnings = validate_options("test", TABLE, &SessionOptions::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unsupported_and_unknown_fields_warn() {
        let options = SessionOptions {
            model: Some("m".to_string()),
            max_turns: Some(3),
            system_prompt: Some("be brief".to_string()),
            ..Default::default()
        };
        let warnings = validate_options("test", TABLE, &options);
        let fields: Vec<_> = warnings.iter().map(|w| w.field).collect();
        assert_eq!(fields, vec!["system_prompt", "max_turns"]);
    }

    #[test]
    fn test_permission_mode_parses_both_spellings() {
        assert_eq!("acceptEdits".parse::<PermissionMode>().unwrap(), PermissionMode::AcceptEdits);
        assert_eq!(
            "bypass_permissions".parse::<PermissionMode>().unwrap(),
            PermissionMode::BypassPermissions
        );
        assert!("yolo".parse::<PermissionMode>().is_err());
    }
}
