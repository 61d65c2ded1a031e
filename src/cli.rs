// ABOUTME: Command-line arguments and config resolution for the insights binary.
// ABOUTME: Flags override the [backend] and [session] sections of the loaded TOML config.

use crate::paths;
use anyhow::{bail, Result};
use clap::Parser;
use insights_agent::{Config, PermissionMode, ReasoningEffort};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "insights", version, about = "Drive a coding agent from the terminal")]
pub struct Args {
    /// Config file (default: ./insights.toml, then ~/.config/insights/config.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Backend type: cli, app-server, acp, mock
    #[arg(long, short = 'b')]
    pub backend: Option<String>,

    /// Working directory for the session
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Permission mode: default, accept_edits, plan, bypass_permissions
    #[arg(long)]
    pub mode: Option<PermissionMode>,

    /// Reasoning effort: minimal, low, medium, high
    #[arg(long)]
    pub effort: Option<ReasoningEffort>,

    /// Resume a backend session or thread by id
    #[arg(long)]
    pub resume: Option<String>,

    /// Print raw wire messages alongside events
    #[arg(long)]
    pub raw: bool,

    /// First prompt; the REPL starts after it completes
    pub prompt: Vec<String>,
}

impl Args {
    pub fn prompt(&self) -> Option<String> {
        let prompt = self.prompt.join(" ");
        if prompt.trim().is_empty() {
            None
        } else {
            Some(prompt)
        }
    }
}

/// Load the config named by --config, else the first existing default, else built-in defaults
pub fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let mut loaded = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            (Config::from_file(path)?, Some(path.clone()))
        }
        None => {
            let found = paths::config_candidates()
                .into_iter()
                .find(|candidate| candidate.exists());
            match found {
                Some(path) => (Config::from_file(&path)?, Some(path)),
                None => (Config::default(), None),
            }
        }
    };
    apply_overrides(&mut loaded.0, args);
    Ok(loaded)
}

pub fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(backend) = &args.backend {
        if *backend != config.backend.backend_type {
            // Backend-specific fields belong to the configured type only.
            config.backend.config.clear();
        }
        config.backend.backend_type = backend.clone();
    }
    if let Some(cwd) = &args.cwd {
        config.session.cwd = Some(cwd.clone());
    }
    if let Some(model) = &args.model {
        config.session.model = Some(model.clone());
    }
    if args.mode.is_some() {
        config.session.permission_mode = args.mode;
    }
    if args.effort.is_some() {
        config.session.reasoning_effort = args.effort;
    }
    if args.raw {
        config.session.include_raw_events = true;
    }
}
