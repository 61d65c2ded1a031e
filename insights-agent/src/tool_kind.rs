// ABOUTME: Backend-agnostic tool categories and the per-backend lookup tables.
// ABOUTME: Unknown names fall back to Other, anything prefixed mcp__ is Mcp.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Execute,
    Read,
    Edit,
    Delete,
    Move,
    Search,
    Fetch,
    Browse,
    Think,
    Ask,
    Memory,
    Mcp,
    Other,
}

/// Static mapping from a backend's native tool identifier to a ToolKind
pub type ToolKindTable = &'static [(&'static str, ToolKind)];

pub const MCP_PREFIX: &str = "mcp__";

/// Claude-style CLI tool names
pub const CLAUDE_TOOLS: ToolKindTable = &[
    ("Bash", ToolKind::Execute),
    ("BashOutput", ToolKind::Execute),
    ("KillShell", ToolKind::Execute),
    ("Read", ToolKind::Read),
    ("NotebookRead", ToolKind::Read),
    ("Edit", ToolKind::Edit),
    ("MultiEdit", ToolKind::Edit),
    ("Write", ToolKind::Edit),
    ("NotebookEdit", ToolKind::Edit),
    ("Glob", ToolKind::Search),
    ("Grep", ToolKind::Search),
    ("LS", ToolKind::Search),
    ("WebFetch", ToolKind::Fetch),
    ("WebSearch", ToolKind::Fetch),
    ("TodoWrite", ToolKind::Think),
    ("ExitPlanMode", ToolKind::Think),
    ("AskUserQuestion", ToolKind::Ask),
    ("Memory", ToolKind::Memory),
    ("Task", ToolKind::Other),
];

/// App-server item types
pub const APP_SERVER_ITEMS: ToolKindTable = &[
    ("commandExecution", ToolKind::Execute),
    ("fileChange", ToolKind::Edit),
    ("mcpToolCall", ToolKind::Mcp),
    ("webSearch", ToolKind::Fetch),
    ("imageView", ToolKind::Read),
    ("reasoning", ToolKind::Think),
    ("todoList", ToolKind::Think),
];

/// ACP `ToolKind` values
pub const ACP_KINDS: ToolKindTable = &[
    ("read", ToolKind::Read),
    ("edit", ToolKind::Edit),
    ("delete", ToolKind::Delete),
    ("move", ToolKind::Move),
    ("search", ToolKind::Search),
    ("execute", ToolKind::Execute),
    ("think", ToolKind::Think),
    ("fetch", ToolKind::Fetch),
    ("switch_mode", ToolKind::Other),
    ("other", ToolKind::Other),
];

/// Classify a native tool name through `table`
pub fn classify(table: ToolKindTable, name: &str) -> ToolKind {
    if name.starts_with(MCP_PREFIX) {
        return ToolKind::Mcp;
    }
    table
        .iter()
        .find(|(native, _)| *native == name)
        .map(|(_, kind)| *kind)
        .unwrap_or(ToolKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_map_through_table() {
        assert_eq!(classify(CLAUDE_TOOLS, "Bash"), ToolKind::Execute);
        assert_eq!(classify(CLAUDE_TOOLS, "MultiEdit"), ToolKind::Edit);
        assert_eq!(classify(APP_SERVER_ITEMS, "fileChange"), ToolKind::Edit);
        assert_eq!(classify(ACP_KINDS, "delete"), ToolKind::Delete);
    }

    #[test]
    fn test_mcp_prefix_wins_over_table() {
        assert_eq!(classify(CLAUDE_TOOLS, "mcp__github__create_issue"), ToolKind::Mcp);
        assert_eq!(classify(ACP_KINDS, "mcp__x"), ToolKind::Mcp);
    }

    #[test]
    fn test_unknown_name_is_other() {
        assert_eq!(classify(CLAUDE_TOOLS, "bash"), ToolKind::Other);
        assert_eq!(classify(APP_SERVER_ITEMS, ""), ToolKind::Other);
    }
}
