//! `rehearse serve`: expose one agent over HTTP and WebSocket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::adapters::http::{AppState, HttpServer};
use crate::cli::context::{build_runner, open_orchestrator, ModelMode};
use crate::domain::models::{AgentDefinition, Config, TestCase};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Agent definition file (JSON or YAML)
    pub agent: PathBuf,

    /// Test suite used when a start request names tests without sending them
    #[arg(long = "tests", value_name = "PATH")]
    pub suite: Option<PathBuf>,

    /// Address to bind (overrides server.host)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (overrides server.port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Use the scripted backend instead of calling the model API
    #[arg(long)]
    pub dry_run: bool,
}

/// Serve the agent until ctrl-c, then interrupt in-flight tests.
pub async fn execute(args: ServeArgs, config: Config) -> Result<ExitCode> {
    let agent = AgentDefinition::load(&args.agent)
        .with_context(|| format!("Failed to load agent from {}", args.agent.display()))?;
    let suite = match &args.suite {
        Some(path) => TestCase::load_many(path)
            .with_context(|| format!("Failed to load tests from {}", path.display()))?,
        None => Vec::new(),
    };

    let mut server_config = config.server.clone();
    if let Some(host) = args.host {
        server_config.host = host;
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }

    let mode = if args.dry_run {
        ModelMode::DryRun
    } else {
        ModelMode::Live
    };
    let runner = build_runner(&config, mode)?;
    let orchestrator = open_orchestrator(&config, runner).await?;

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        agent: Arc::new(agent),
        suite,
        defaults: config.run_options(),
    };
    let server = HttpServer::new(server_config, state);
    let address = server.address().context("Invalid server address")?;
    eprintln!("Serving on http://{address} (Ctrl-C to stop)");

    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|err| anyhow::anyhow!(err))
        .context("HTTP server failed")?;

    Ok(ExitCode::SUCCESS)
}
