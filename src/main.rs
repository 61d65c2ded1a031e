// ABOUTME: Main entry point for the insights terminal front-end.
// ABOUTME: Initializes logging and config, builds the backend from the registry, then runs the REPL.

use anyhow::{Context, Result};
use clap::Parser;
use insights::cli::{load_config, Args};
use insights::repl::{stdout_output, Repl};
use insights_agent::BackendRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let (config, config_path) = load_config(&args)?;

    // RUST_LOG wins over the [logging] filter; logs go to stderr so stdout stays the conversation.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        backend = %config.backend.backend_type,
        config = ?config_path,
        "Starting insights"
    );

    let registry = BackendRegistry::default();
    let backend = registry
        .create_from_config(&config.backend)
        .with_context(|| format!("Failed to create backend '{}'", config.backend.backend_type))?;

    let cwd = match config.session.cwd.clone() {
        Some(cwd) => std::path::absolute(&cwd)
            .with_context(|| format!("Failed to resolve working directory {}", cwd.display()))?,
        None => std::env::current_dir().context("Failed to determine working directory")?,
    };
    let mut options = config.session.to_options();
    options.resume_session_id = args.resume.clone();

    let repl = Repl::new(backend.clone(), cwd, options, stdout_output());
    repl.spawn_printers();
    repl.start(args.prompt().as_deref()).await;

    let result = repl
        .run(tokio::io::BufReader::new(tokio::io::stdin()))
        .await;

    repl.shutdown().await;
    backend.dispose().await;
    tracing::info!("Shutting down");
    result
}
