// ABOUTME: Terminal front-end for driving coding-agent backends through insights-agent.
// ABOUTME: Argument parsing, config lookup, event rendering and the interactive loop.

pub mod cli;
pub mod paths;
pub mod render;
pub mod repl;
