//! `rehearse runs`: inspect and manage stored runs.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use super::run::RunReport;
use crate::cli::context::open_store;
use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::{Config, RunSummary};

#[derive(Args, Debug)]
pub struct RunsArgs {
    #[command(subcommand)]
    pub command: RunsCommands,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommands {
    /// List stored runs, newest first
    List {
        /// Only runs of this agent
        #[arg(long = "agent", value_name = "ID")]
        agent_id: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run with its results
    Show {
        /// Run ID
        id: Uuid,
    },
    /// Delete a stored run and its results
    Delete {
        /// Run ID
        id: Uuid,
    },
}

#[derive(Debug, Serialize)]
pub struct RunListOutput {
    pub runs: Vec<RunSummary>,
}

impl CommandOutput for RunListOutput {
    fn to_human(&self) -> String {
        if self.runs.is_empty() {
            return "No runs found.".to_string();
        }
        format!(
            "{}\n{} run(s)",
            TableFormatter::new().format_runs(&self.runs),
            self.runs.len()
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.runs).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct RunDeleteOutput {
    pub success: bool,
    pub run_id: Uuid,
}

impl CommandOutput for RunDeleteOutput {
    fn to_human(&self) -> String {
        format!("Deleted run {}", self.run_id)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success,
            "run_id": self.run_id,
        })
    }
}

/// List or delete stored runs.
pub async fn execute(args: RunsArgs, json_mode: bool, config: Config) -> Result<ExitCode> {
    let orchestrator = open_store(&config).await?;

    match args.command {
        RunsCommands::List { agent_id, limit } => {
            let runs = orchestrator
                .list_runs(agent_id.as_deref(), limit)
                .await
                .context("Failed to list runs")?;
            output(&RunListOutput { runs }, json_mode);
        }
        RunsCommands::Show { id } => {
            let run = orchestrator
                .get_run(id)
                .await
                .with_context(|| format!("Failed to load run {id}"))?;
            output(&RunReport { run }, json_mode);
        }
        RunsCommands::Delete { id } => {
            orchestrator
                .get_run(id)
                .await
                .with_context(|| format!("Failed to load run {id}"))?;
            orchestrator
                .delete_run(id)
                .await
                .with_context(|| format!("Failed to delete run {id}"))?;
            output(
                &RunDeleteOutput {
                    success: true,
                    run_id: id,
                },
                json_mode,
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_message() {
        let output = RunListOutput { runs: Vec::new() };
        assert_eq!(output.to_human(), "No runs found.");
        assert_eq!(output.to_json(), serde_json::json!([]));
    }
}
