//! Command-line interface.
//!
//! Commands share one wiring path (`context`) and render through
//! [`output::CommandOutput`], so every command supports `--json`.

pub mod commands;
pub mod context;
pub mod output;
pub mod types;

use std::process::ExitCode;

use console::style;

pub use types::{Cli, Commands};

/// Dispatch a parsed command line.
pub async fn dispatch(cli: Cli, config: crate::domain::models::Config) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => commands::run::execute(args, cli.json, config).await,
        Commands::Runs(args) => commands::runs::execute(args, cli.json, config).await,
        Commands::Repair(args) => commands::repair::execute(args, cli.json, config).await,
        Commands::Serve(args) => commands::serve::execute(args, config).await,
    }
}

/// Report a failed command and return the exit code for it.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) -> ExitCode {
    if json_mode {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "error": err.to_string(),
            "causes": causes,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );
    } else {
        eprintln!("{} {err:#}", style("error:").red().bold());
    }
    ExitCode::from(2)
}
